use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use ln_subswap::fees::feed::FeeFeed;
use ln_subswap::fees::{FeeError, FeeMatrixBody, FeeSnapshot};
use ln_subswap::lightning::invoice::decode_invoice;
use ln_subswap::lightning::node::{
    ChannelBalance, NodeTransaction, PaymentOutcome, RedeemFee, RoutingNode, SwapAddress,
    SwapNode, UnspentAmount,
};
use ln_subswap::swap::memory::MemorySwapLedger;
use ln_subswap::swap::store::SwapLedger;
use ln_subswap::swap::{DepositAddress, NewSwapPayment, SwapRecord};

#[derive(Default)]
pub struct FakeRoutingNode {
    pub height: AtomicU32,
    pub channels: Mutex<Vec<ChannelBalance>>,
    pub fail_list_channels: AtomicBool,
}

impl FakeRoutingNode {
    pub fn new(height: u32) -> Self {
        Self {
            height: AtomicU32::new(height),
            ..Default::default()
        }
    }

    pub fn add_channel(&self, remote_pubkey: &str, remote_balance: i64) {
        self.channels.lock().unwrap().push(ChannelBalance {
            remote_pubkey: remote_pubkey.to_string(),
            remote_balance,
        });
    }
}

#[async_trait]
impl RoutingNode for FakeRoutingNode {
    async fn block_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelBalance>> {
        if self.fail_list_channels.load(Ordering::SeqCst) {
            anyhow::bail!("routing node unavailable");
        }
        Ok(self.channels.lock().unwrap().clone())
    }
}

/// Everything the swap node was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCall {
    SwapInit,
    ResetMissionControl,
    SendPayment(String),
    Redeem(RedeemFee),
}

pub struct FakeSwapNode {
    pub height: AtomicU32,
    pub swap_address: SwapAddress,
    pub unspent: Mutex<HashMap<[u8; 32], UnspentAmount>>,
    pub redeem_fee: AtomicU32,
    /// Routing failure returned by the next payments; empty means success.
    pub payment_error: Mutex<String>,
    pub preimages: Mutex<HashMap<String, Vec<u8>>>,
    pub transactions: Mutex<Vec<NodeTransaction>>,
    pub fail_redeem: AtomicBool,
    pub fail_reset: AtomicBool,
    pub fail_send: AtomicBool,
    pub calls: Mutex<Vec<NodeCall>>,
    /// When set, the ledger record of every paid hash is captured at the
    /// moment the payment is sent.
    pub ledger: Mutex<Option<Arc<dyn SwapLedger>>>,
    pub records_at_payment: Mutex<Vec<Option<SwapRecord>>>,
    redeem_counter: AtomicUsize,
}

impl FakeSwapNode {
    pub fn new(height: u32) -> Self {
        Self {
            height: AtomicU32::new(height),
            swap_address: SwapAddress {
                address: "bcrt1qswapaddress".to_string(),
                pubkey: vec![2u8; 33],
                lock_height: 288,
            },
            unspent: Mutex::new(HashMap::new()),
            redeem_fee: AtomicU32::new(1_000),
            payment_error: Mutex::new(String::new()),
            preimages: Mutex::new(HashMap::new()),
            transactions: Mutex::new(Vec::new()),
            fail_redeem: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            ledger: Mutex::new(None),
            records_at_payment: Mutex::new(Vec::new()),
            redeem_counter: AtomicUsize::new(0),
        }
    }

    pub fn set_unspent(&self, hash: [u8; 32], unspent: UnspentAmount) {
        self.unspent.lock().unwrap().insert(hash, unspent);
    }

    /// Preimage the node learns when paying `bolt11`.
    pub fn set_preimage_for(&self, bolt11: &str, preimage: &[u8]) {
        self.preimages
            .lock()
            .unwrap()
            .insert(bolt11.to_string(), preimage.to_vec());
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn payments(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, NodeCall::SendPayment(_)))
            .count()
    }

    pub fn redeems(&self) -> Vec<RedeemFee> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NodeCall::Redeem(fee) => Some(fee),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: NodeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SwapNode for FakeSwapNode {
    async fn block_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn swap_init(&self, _hash: &[u8], _pubkey: &[u8]) -> Result<SwapAddress> {
        self.record(NodeCall::SwapInit);
        Ok(self.swap_address.clone())
    }

    async fn unspent_amount(&self, hash: &[u8; 32]) -> Result<UnspentAmount> {
        Ok(self
            .unspent
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or(UnspentAmount {
                amount: 0,
                lock_height: 0,
                utxos: Vec::new(),
            }))
    }

    async fn redeem_fees(&self, _hash: &[u8; 32], _target_conf: u32) -> Result<u64> {
        Ok(u64::from(self.redeem_fee.load(Ordering::SeqCst)))
    }

    async fn redeem(&self, _preimage: &[u8], fee: RedeemFee) -> Result<String> {
        self.record(NodeCall::Redeem(fee));
        if self.fail_redeem.load(Ordering::SeqCst) {
            anyhow::bail!("redeem rejected by node");
        }
        let n = self.redeem_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{n:064x}"))
    }

    async fn send_payment_sync(&self, payment_request: &str) -> Result<PaymentOutcome> {
        self.record(NodeCall::SendPayment(payment_request.to_string()));

        let ledger = self.ledger.lock().unwrap().clone();
        if let Some(ledger) = ledger {
            let invoice = decode_invoice(payment_request, bitcoin::Network::Regtest)?;
            let record = ledger.get_swap(&hex::encode(invoice.payment_hash)).await?;
            self.records_at_payment.lock().unwrap().push(record);
        }

        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("payment stream closed");
        }
        let payment_error = self.payment_error.lock().unwrap().clone();
        if !payment_error.is_empty() {
            return Ok(PaymentOutcome {
                payment_error,
                preimage: None,
            });
        }
        Ok(PaymentOutcome {
            payment_error: String::new(),
            preimage: self.preimages.lock().unwrap().get(payment_request).cloned(),
        })
    }

    async fn reset_mission_control(&self) -> Result<()> {
        self.record(NodeCall::ResetMissionControl);
        if self.fail_reset.load(Ordering::SeqCst) {
            anyhow::bail!("mission control unavailable");
        }
        Ok(())
    }

    async fn transactions_since(&self, start_height: u32) -> Result<Vec<NodeTransaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| tx.block_height == 0 || tx.block_height >= start_height)
            .cloned()
            .collect())
    }
}

/// Feed serving a fixed matrix, or failing when none is set.
#[derive(Default)]
pub struct StaticFeeFeed {
    pub body: Mutex<Option<FeeMatrixBody>>,
    pub fetches: AtomicUsize,
}

impl StaticFeeFeed {
    pub fn new(body: Option<FeeMatrixBody>) -> Self {
        Self {
            body: Mutex::new(body),
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FeeFeed for StaticFeeFeed {
    async fn fetch(&self) -> Result<FeeMatrixBody, FeeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.body.lock().unwrap().clone().ok_or(FeeError::NoData)
    }
}

/// Matrix where every target and confidence maps to the same cell.
pub fn flat_matrix(cell: i32) -> FeeMatrixBody {
    FeeMatrixBody {
        index: vec![1, 6, 144],
        columns: vec!["0.5".into(), "0.9".into(), "0.99".into()],
        data: vec![vec![cell; 3]; 3],
    }
}

pub fn flat_snapshot(cell: i32) -> FeeSnapshot {
    FeeSnapshot::try_from(flat_matrix(cell)).unwrap()
}

/// Memory ledger whose preimage writes always fail.
#[derive(Default)]
pub struct PreimageFailingLedger {
    pub inner: MemorySwapLedger,
}

#[async_trait]
impl SwapLedger for PreimageFailingLedger {
    async fn insert_if_absent(&self, payment: &NewSwapPayment) -> Result<bool> {
        self.inner.insert_if_absent(payment).await
    }

    async fn set_preimage(&self, _payment_hash: &str, _preimage: &str) -> Result<bool> {
        anyhow::bail!("disk I/O error")
    }

    async fn append_redeem_tx(&self, payment_hash: &str, txid: &str) -> Result<bool> {
        self.inner.append_redeem_tx(payment_hash, txid).await
    }

    async fn set_confirmed(&self, payment_hash: &str) -> Result<()> {
        self.inner.set_confirmed(payment_hash).await
    }

    async fn list_pending_redeems(&self, current_height: u32) -> Result<Vec<SwapRecord>> {
        self.inner.list_pending_redeems(current_height).await
    }

    async fn get_swap(&self, payment_hash: &str) -> Result<Option<SwapRecord>> {
        self.inner.get_swap(payment_hash).await
    }

    async fn track_deposit_address(
        &self,
        address: &str,
        payment_hash: &str,
        notification_token: &str,
    ) -> Result<()> {
        self.inner
            .track_deposit_address(address, payment_hash, notification_token)
            .await
    }

    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>> {
        self.inner.get_deposit_address(address).await
    }

    async fn has_filtered_address(&self, addresses: &[String]) -> Result<bool> {
        self.inner.has_filtered_address(addresses).await
    }
}
