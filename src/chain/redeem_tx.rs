use anyhow::{Context as _, Result};
use bitcoin::Transaction;
use bitcoin::hashes::{Hash as _, sha256};

/// What the redeem engine needs to know about a broadcast reclaim
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemTx {
    pub txid: String,
    pub weight: u64,
    /// Preimage revealed in the claim witness, if the transaction spends
    /// the swap output through the hash branch.
    pub preimage: Option<Vec<u8>>,
}

impl RedeemTx {
    pub fn from_raw_hex(raw_tx_hex: &str) -> Result<Self> {
        let bytes = hex::decode(raw_tx_hex).context("hex decode raw tx")?;
        let tx: Transaction =
            bitcoin::consensus::deserialize(&bytes).context("deserialize raw tx")?;
        Ok(Self::from_tx(&tx))
    }

    pub fn from_tx(tx: &Transaction) -> Self {
        // A redeem spends exactly one swap output with
        // <sig> <preimage> <witness script>.
        let preimage = match tx.input.as_slice() {
            [txin] if txin.witness.len() >= 2 => txin
                .witness
                .nth(1)
                .filter(|p| !p.is_empty())
                .map(<[u8]>::to_vec),
            _ => None,
        };

        Self {
            txid: tx.compute_txid().to_string(),
            weight: tx.weight().to_wu(),
            preimage,
        }
    }

    /// Fee rate this transaction achieved, in sat/vbyte.
    pub fn sat_per_vbyte(&self, total_fees: u64) -> f64 {
        achieved_sat_per_vbyte(total_fees, self.weight)
    }

    pub fn reveals(&self, payment_hash: &[u8; 32]) -> bool {
        self.preimage
            .as_deref()
            .is_some_and(|p| &sha256_preimage(p) == payment_hash)
    }
}

pub fn achieved_sat_per_vbyte(total_fees: u64, weight: u64) -> f64 {
    if weight == 0 {
        return 0.0;
    }
    total_fees as f64 * 4.0 / weight as f64
}

pub fn sha256_preimage(preimage: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}
