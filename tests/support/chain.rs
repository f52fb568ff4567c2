use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use ln_subswap::lightning::node::NodeTransaction;

/// A reclaim-shaped transaction: one input spending a swap output with
/// `<sig> <preimage> <script>`.
pub fn redeem_tx(preimage: &[u8], funding_vout: u32, output_sat: u64) -> Transaction {
    let mut witness = Witness::new();
    witness.push([0x30u8; 72]);
    witness.push(preimage);
    witness.push([0x51u8; 100]);

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: funding_vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness,
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_sat),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Wallet view of `tx` as if it paid `sat_per_vbyte`.
pub fn node_tx(tx: &Transaction, sat_per_vbyte: u64, num_confirmations: u32) -> NodeTransaction {
    let weight = tx.weight().to_wu();
    NodeTransaction {
        txid: tx.compute_txid().to_string(),
        num_confirmations,
        total_fees: sat_per_vbyte * weight / 4,
        raw_tx_hex: bitcoin::consensus::encode::serialize_hex(tx),
        block_height: 0,
    }
}
