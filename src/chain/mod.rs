pub mod redeem_tx;
