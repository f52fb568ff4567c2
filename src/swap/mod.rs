pub mod coordinator;
pub mod memory;
pub mod redeem;
pub mod service;
pub mod store;

use serde::{Deserialize, Serialize};

/// Confirmations after which a redeem transaction is final.
pub const REDEEM_CONFIRMATIONS: u32 = 6;

/// Pending redeems whose funds confirmed longer ago than this are no longer
/// scanned.
pub const PENDING_REDEEM_HORIZON: u32 = 288 * 100;

/// Confirmation target used whenever no deadline-aware rate is available.
pub const FALLBACK_TARGET_CONF: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    /// Hex encoded, primary key.
    pub payment_hash: String,
    pub payment_request: String,
    pub lock_height: u32,
    pub confirmation_height: u32,
    pub utxos: Vec<String>,

    /// Hex encoded, set once the off-chain payment succeeded.
    pub preimage: Option<String>,
    /// Every redeem transaction ever broadcast, oldest first.
    pub redeem_txids: Vec<String>,
    pub redeem_confirmed: bool,
}

impl SwapRecord {
    /// Blocks left before the counterparty may reclaim the funds.
    pub fn blocks_left(&self, current_height: u32) -> i64 {
        blocks_left(self.lock_height, self.confirmation_height, current_height)
    }
}

pub fn blocks_left(lock_height: u32, confirmation_height: u32, current_height: u32) -> i64 {
    i64::from(lock_height) - (i64::from(current_height) - i64::from(confirmation_height))
}

/// Fields fixed when a swap payment is first recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSwapPayment {
    pub payment_hash: String,
    pub payment_request: String,
    pub lock_height: u32,
    pub confirmation_height: u32,
    pub utxos: Vec<String>,
}

/// A swap address handed out by InitSwap. Funding progress is read from
/// the swap node on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddress {
    pub address: String,
    pub payment_hash: String,
    pub notification_tokens: Vec<String>,
}
