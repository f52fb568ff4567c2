use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{SwapLedger, pending_horizon};
use super::{DepositAddress, NewSwapPayment, SwapRecord};

/// In-memory [`SwapLedger`] for tests and throwaway deployments.
/// Everything is lost on restart.
#[derive(Clone, Default)]
pub struct MemorySwapLedger {
    swaps: Arc<RwLock<HashMap<String, SwapRecord>>>,
    deposits: Arc<RwLock<HashMap<String, DepositAddress>>>,
    filtered: Arc<RwLock<HashSet<String>>>,
}

impl MemorySwapLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_filtered_address(&self, address: &str) {
        self.filtered.write().await.insert(address.to_string());
    }
}

#[async_trait]
impl SwapLedger for MemorySwapLedger {
    async fn insert_if_absent(&self, payment: &NewSwapPayment) -> Result<bool> {
        let mut swaps = self.swaps.write().await;
        if swaps.contains_key(&payment.payment_hash) {
            return Ok(false);
        }
        swaps.insert(
            payment.payment_hash.clone(),
            SwapRecord {
                payment_hash: payment.payment_hash.clone(),
                payment_request: payment.payment_request.clone(),
                lock_height: payment.lock_height,
                confirmation_height: payment.confirmation_height,
                utxos: payment.utxos.clone(),
                preimage: None,
                redeem_txids: Vec::new(),
                redeem_confirmed: false,
            },
        );
        Ok(true)
    }

    async fn set_preimage(&self, payment_hash: &str, preimage: &str) -> Result<bool> {
        let mut swaps = self.swaps.write().await;
        let Some(record) = swaps.get_mut(payment_hash) else {
            return Ok(false);
        };
        match &record.preimage {
            Some(stored) => anyhow::ensure!(
                stored == preimage,
                "swap {payment_hash} already has a different preimage"
            ),
            None => record.preimage = Some(preimage.to_string()),
        }
        Ok(true)
    }

    async fn append_redeem_tx(&self, payment_hash: &str, txid: &str) -> Result<bool> {
        let mut swaps = self.swaps.write().await;
        let Some(record) = swaps.get_mut(payment_hash) else {
            return Ok(false);
        };
        record.redeem_txids.push(txid.to_string());
        Ok(true)
    }

    async fn set_confirmed(&self, payment_hash: &str) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        let record = swaps
            .get_mut(payment_hash)
            .ok_or_else(|| anyhow::anyhow!("swap payment not found: {payment_hash}"))?;
        record.redeem_confirmed = true;
        Ok(())
    }

    async fn list_pending_redeems(&self, current_height: u32) -> Result<Vec<SwapRecord>> {
        let ignore_before = pending_horizon(current_height);
        let swaps = self.swaps.read().await;
        let mut pending: Vec<SwapRecord> = swaps
            .values()
            .filter(|r| {
                !r.redeem_confirmed
                    && r.preimage.is_some()
                    && r.confirmation_height > ignore_before
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (a.confirmation_height, &a.payment_hash).cmp(&(b.confirmation_height, &b.payment_hash))
        });
        Ok(pending)
    }

    async fn get_swap(&self, payment_hash: &str) -> Result<Option<SwapRecord>> {
        Ok(self.swaps.read().await.get(payment_hash).cloned())
    }

    async fn track_deposit_address(
        &self,
        address: &str,
        payment_hash: &str,
        notification_token: &str,
    ) -> Result<()> {
        let mut deposits = self.deposits.write().await;
        let entry = deposits
            .entry(address.to_string())
            .or_insert_with(|| DepositAddress {
                address: address.to_string(),
                payment_hash: payment_hash.to_string(),
                notification_tokens: Vec::new(),
            });
        entry.payment_hash = payment_hash.to_string();
        if !notification_token.is_empty()
            && !entry.notification_tokens.iter().any(|t| t == notification_token)
        {
            entry.notification_tokens.push(notification_token.to_string());
            entry.notification_tokens.sort();
        }
        Ok(())
    }

    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>> {
        Ok(self.deposits.read().await.get(address).cloned())
    }

    async fn has_filtered_address(&self, addresses: &[String]) -> Result<bool> {
        let filtered = self.filtered.read().await;
        Ok(addresses.iter().any(|a| filtered.contains(a)))
    }
}
