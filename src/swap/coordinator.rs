use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use thiserror::Error;

use super::redeem::RedeemEngine;
use super::store::SwapLedger;
use super::{FALLBACK_TARGET_CONF, NewSwapPayment};
use crate::fees::oracle::FeeRateOracle;
use crate::lightning::invoice::decode_invoice;
use crate::lightning::node::{RedeemFee, RoutingNode, SwapNode, SwapUtxo};

pub const DEPOSIT_THRESHOLD_SAT: u64 = 4_000_000;
pub const DEPOSIT_THRESHOLD_LEGACY_SAT: u64 = 900_000;
pub const REQUIRED_RESERVE_SAT: u64 = 600;

/// A redeem is assumed to weigh 1 000 WU when sizing the minimum deposit.
const REDEEM_VSIZE: f64 = 250.0;

#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub network: Network,
    pub deposit_threshold: u64,
    pub deposit_threshold_legacy: u64,
    pub required_reserve: u64,
    /// Hex node id handed to clients by `QueryRoutingNode`.
    pub routing_node: Option<String>,
    pub min_deposit_conf_target: u32,
    pub redeem_fee_conf_target: u32,
    pub address_filtering: bool,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            deposit_threshold: DEPOSIT_THRESHOLD_SAT,
            deposit_threshold_legacy: DEPOSIT_THRESHOLD_LEGACY_SAT,
            required_reserve: REQUIRED_RESERVE_SAT,
            routing_node: None,
            min_deposit_conf_target: 12,
            redeem_fee_conf_target: FALLBACK_TARGET_CONF,
            address_filtering: false,
        }
    }
}

/// Which balance ceiling a request is served under. Older clients still use
/// the legacy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositLimit {
    Current,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSwapRequest {
    pub node_id: String,
    pub hash: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub notification_token: String,
}

/// Result of InitSwap. With a closed deposit window only the limits and
/// `error_message` are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitSwapReply {
    pub address: String,
    pub pubkey: Vec<u8>,
    pub lock_height: u32,
    pub max_allowed_deposit: u64,
    pub min_allowed_deposit: u64,
    pub required_reserve: u64,
    pub error_message: String,
}

/// Funding seen at a tracked swap address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositFunding {
    /// Transaction of the first funding output.
    pub tx: String,
    /// Total locked at the address.
    pub amount: u64,
    /// Every funding output has confirmed.
    pub confirmed: bool,
    /// Oldest confirmation height, zero while unconfirmed.
    pub block_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    FundsExceedLimit,
    TxTooSmall,
    InvoiceAmountMismatch,
    SwapExpired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimReply {
    /// Rejection reason or the node's routing failure, empty on success.
    pub payment_error: String,
    pub rejection: Option<ClaimRejection>,
}

impl ClaimReply {
    fn rejected(rejection: ClaimRejection, payment_error: impl Into<String>) -> Self {
        Self {
            payment_error: payment_error.into(),
            rejection: Some(rejection),
        }
    }

    pub fn funds_exceeded_limit(&self) -> bool {
        self.rejection.is_some()
    }

    pub fn is_paid(&self) -> bool {
        self.rejection.is_none() && self.payment_error.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("payment request is not valid: {0}")]
    MalformedInvoice(String),

    #[error("there are no UTXOs related to payment request")]
    NoUtxos,

    #[error("swap funds come from a filtered address")]
    Filtered,

    #[error("swap payment {0} already exists")]
    Duplicate(String),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

/// Request-facing side of the swap service.
pub struct SwapCoordinator {
    cfg: SwapConfig,
    routing: Arc<dyn RoutingNode>,
    node: Arc<dyn SwapNode>,
    ledger: Arc<dyn SwapLedger>,
    fees: Arc<FeeRateOracle>,
    redeemer: Arc<RedeemEngine>,
}

impl SwapCoordinator {
    pub fn new(
        cfg: SwapConfig,
        routing: Arc<dyn RoutingNode>,
        node: Arc<dyn SwapNode>,
        ledger: Arc<dyn SwapLedger>,
        fees: Arc<FeeRateOracle>,
        redeemer: Arc<RedeemEngine>,
    ) -> Self {
        Self {
            cfg,
            routing,
            node,
            ledger,
            fees,
            redeemer,
        }
    }

    pub fn threshold(&self, limit: DepositLimit) -> u64 {
        match limit {
            DepositLimit::Current => self.cfg.deposit_threshold,
            DepositLimit::Legacy => self.cfg.deposit_threshold_legacy,
        }
    }

    /// How much more `node_id` may deposit before its inbound balance with
    /// us reaches the threshold.
    pub async fn max_allowed_deposit(&self, node_id: &str, limit: DepositLimit) -> Result<u64> {
        let channels = self
            .routing
            .list_channels()
            .await
            .context("list routing node channels")?;

        let remote_balance: i64 = channels
            .iter()
            .filter(|c| c.remote_pubkey == node_id)
            .map(|c| c.remote_balance)
            .sum();

        let threshold = i64::try_from(self.threshold(limit)).context("threshold out of range")?;
        Ok(u64::try_from(threshold - remote_balance).unwrap_or(0))
    }

    pub async fn init_swap(&self, req: &InitSwapRequest, limit: DepositLimit) -> Result<InitSwapReply> {
        let threshold = self.threshold(limit);
        let max_allowed_deposit = self
            .max_allowed_deposit(&req.node_id, limit)
            .await
            .context("failed to calculate max allowed deposit amount")?;

        if max_allowed_deposit == 0 {
            tracing::info!(node_id = %req.node_id, threshold, "deposit window closed");
            return Ok(InitSwapReply {
                max_allowed_deposit,
                required_reserve: self.cfg.required_reserve,
                error_message: deposit_window_closed_message(threshold),
                ..Default::default()
            });
        }

        let swap = self
            .node
            .swap_init(&req.hash, &req.pubkey)
            .await
            .with_context(|| format!("init swap for hash {}", hex::encode(&req.hash)))?;

        let min_allowed_deposit = self.min_allowed_deposit(swap.lock_height);

        self.ledger
            .track_deposit_address(&swap.address, &hex::encode(&req.hash), &req.notification_token)
            .await
            .with_context(|| format!("track deposit address {}", swap.address))?;

        tracing::info!(
            address = %swap.address,
            payment_hash = %hex::encode(&req.hash),
            lock_height = swap.lock_height,
            max_allowed_deposit,
            min_allowed_deposit,
            "swap address issued"
        );

        Ok(InitSwapReply {
            address: swap.address,
            pubkey: swap.pubkey,
            lock_height: swap.lock_height,
            max_allowed_deposit,
            min_allowed_deposit,
            required_reserve: self.cfg.required_reserve,
            error_message: String::new(),
        })
    }

    /// Funding status of previously issued swap addresses. The notification
    /// token is registered on every known address. Unknown, unfunded or
    /// failing addresses are left out of the result.
    pub async fn add_fund_status(
        &self,
        addresses: &[String],
        notification_token: &str,
    ) -> HashMap<String, DepositFunding> {
        let mut statuses = HashMap::new();
        for address in addresses {
            match self.deposit_funding(address, notification_token).await {
                Ok(Some(funding)) => {
                    statuses.insert(address.clone(), funding);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(address = %address, error = %err, "add fund status failed");
                }
            }
        }
        statuses
    }

    async fn deposit_funding(
        &self,
        address: &str,
        notification_token: &str,
    ) -> Result<Option<DepositFunding>> {
        let Some(deposit) = self
            .ledger
            .get_deposit_address(address)
            .await
            .context("get deposit address")?
        else {
            tracing::debug!(address = %address, "status requested for unknown address");
            return Ok(None);
        };

        if !notification_token.is_empty() {
            self.ledger
                .track_deposit_address(address, &deposit.payment_hash, notification_token)
                .await
                .context("register notification token")?;
        }

        let hash = hex::decode(&deposit.payment_hash)
            .ok()
            .and_then(|h| <[u8; 32]>::try_from(h).ok())
            .with_context(|| format!("invalid stored payment hash {}", deposit.payment_hash))?;
        let unspent = self
            .node
            .unspent_amount(&hash)
            .await
            .context("get swap address utxos")?;

        let Some(first) = unspent.utxos.first() else {
            return Ok(None);
        };
        let tx = first
            .outpoint
            .split_once(':')
            .map_or(first.outpoint.as_str(), |(txid, _)| txid)
            .to_string();
        let confirmed = unspent.utxos.iter().all(|u| u.block_height > 0);

        Ok(Some(DepositFunding {
            tx,
            amount: unspent.amount,
            confirmed,
            block_height: oldest_utxo_height(&unspent.utxos, 0),
        }))
    }

    fn min_allowed_deposit(&self, lock_height: u32) -> u64 {
        let blocks = i64::from(self.cfg.min_deposit_conf_target);
        match self.fees.fee_rate(blocks, lock_height) {
            Ok(rate) => (rate * REDEEM_VSIZE * 3.0 / 2.0).ceil() as u64,
            Err(err) => {
                tracing::warn!(error = %err, "no fee estimate for minimum deposit");
                0
            }
        }
    }

    /// Pays the client's invoice from funds locked at the swap address and
    /// hands the preimage to the redeem engine.
    ///
    /// Validation failures come back as a [`ClaimReply`] rejection and leave
    /// no trace in the ledger.
    pub async fn execute_claim(
        &self,
        payment_request: &str,
        limit: DepositLimit,
    ) -> Result<ClaimReply, ClaimError> {
        let invoice = decode_invoice(payment_request, self.cfg.network)
            .map_err(|e| ClaimError::MalformedInvoice(format!("{e:#}")))?;
        let payment_hash = hex::encode(invoice.payment_hash);
        let amount = invoice.amount_sat;

        let max_allowed_deposit = self
            .max_allowed_deposit(&invoice.destination, limit)
            .await
            .context("failed to calculate max allowed deposit amount")?;
        if amount > max_allowed_deposit {
            tracing::info!(payment_hash = %payment_hash, amount, max_allowed_deposit, "claim exceeds deposit limit");
            return Ok(ClaimReply::rejected(
                ClaimRejection::FundsExceedLimit,
                format!(
                    "payment request amount: {amount} is greater than max allowed: {max_allowed_deposit}"
                ),
            ));
        }

        let unspent = self
            .node
            .unspent_amount(&invoice.payment_hash)
            .await
            .context("get swap address utxos")?;
        if unspent.utxos.is_empty() {
            return Err(ClaimError::NoUtxos);
        }

        let fee = self
            .node
            .redeem_fees(&invoice.payment_hash, self.cfg.redeem_fee_conf_target)
            .await
            .context("couldn't determine the redeem transaction fees")?;
        tracing::debug!(payment_hash = %payment_hash, fee, utxo_amount = unspent.amount, amount, "redeem fee estimated");

        if u128::from(unspent.amount) * 2 < u128::from(fee) * 3 {
            return Ok(ClaimReply::rejected(
                ClaimRejection::TxTooSmall,
                "total UTXO not sufficient to create the redeem transaction",
            ));
        }

        if unspent.amount != amount {
            return Ok(ClaimReply::rejected(
                ClaimRejection::InvoiceAmountMismatch,
                "total UTXO amount not equal to the amount in client's payment request",
            ));
        }

        let height = self
            .routing
            .block_height()
            .await
            .context("couldn't determine the current blockheight")?;
        let utxo_height = oldest_utxo_height(&unspent.utxos, height);
        if is_expired(height, utxo_height, unspent.lock_height) {
            return Ok(ClaimReply::rejected(
                ClaimRejection::SwapExpired,
                "client transaction older than redeem block threshold",
            ));
        }

        if self.cfg.address_filtering {
            let sources: Vec<String> = unspent
                .utxos
                .iter()
                .flat_map(|u| u.source_addresses.iter().cloned())
                .collect();
            if self
                .ledger
                .has_filtered_address(&sources)
                .await
                .context("check filtered addresses")?
            {
                tracing::error!(payment_hash = %payment_hash, ?sources, "swap funded from filtered address");
                return Err(ClaimError::Filtered);
            }
        }

        let inserted = self
            .ledger
            .insert_if_absent(&NewSwapPayment {
                payment_hash: payment_hash.clone(),
                payment_request: payment_request.to_string(),
                lock_height: unspent.lock_height,
                confirmation_height: utxo_height,
                utxos: unspent.utxos.iter().map(|u| u.outpoint.clone()).collect(),
            })
            .await
            .context("insert swap payment")?;
        if !inserted {
            tracing::warn!(payment_hash = %payment_hash, "swap payment already recorded");
            return Err(ClaimError::Duplicate(payment_hash));
        }

        if let Err(err) = self.node.reset_mission_control().await {
            tracing::warn!(payment_hash = %payment_hash, error = %err, "reset mission control failed");
        }

        let outcome = self
            .node
            .send_payment_sync(payment_request)
            .await
            .context("send payment")?;
        if !outcome.payment_error.is_empty() {
            tracing::warn!(payment_hash = %payment_hash, amount, payment_error = %outcome.payment_error, "swap payment failed");
            return Ok(ClaimReply {
                payment_error: outcome.payment_error,
                rejection: None,
            });
        }

        let preimage = outcome
            .preimage
            .context("payment succeeded without a preimage")?;
        let stored = self
            .ledger
            .set_preimage(&payment_hash, &hex::encode(&preimage))
            .await
            .context("store swap preimage")?;
        if !stored {
            return Err(anyhow::anyhow!("swap payment {payment_hash} vanished before storing preimage").into());
        }
        tracing::info!(payment_hash = %payment_hash, amount, "swap payment sent");

        let blocks_left = super::blocks_left(unspent.lock_height, utxo_height, height);
        match self
            .redeemer
            .redeem(&preimage, blocks_left, unspent.lock_height)
            .await
        {
            Ok(txid) => tracing::info!(payment_hash = %payment_hash, txid = %txid, "redeem tx broadcast"),
            Err(err) => tracing::warn!(
                payment_hash = %payment_hash,
                error = %err,
                "redeem after payment failed, watcher will retry"
            ),
        }

        Ok(ClaimReply::default())
    }

    /// Broadcasts a redeem with caller-chosen pricing. A positive fee rate
    /// wins over a confirmation target; with neither the fallback target is
    /// used.
    pub async fn manual_redeem(
        &self,
        preimage: &[u8],
        target_conf: i32,
        sat_per_vbyte: i64,
    ) -> Result<String> {
        anyhow::ensure!(!preimage.is_empty(), "preimage is required");
        self.redeemer
            .redeem_with_fee(preimage, manual_redeem_fee(target_conf, sat_per_vbyte))
            .await
    }

    pub fn routing_node_id(&self) -> Result<Vec<u8>> {
        let node_id = self
            .cfg
            .routing_node
            .as_deref()
            .context("routing node is not configured")?;
        hex::decode(node_id).with_context(|| format!("decode routing node id {node_id}"))
    }
}

pub fn manual_redeem_fee(target_conf: i32, sat_per_vbyte: i64) -> RedeemFee {
    if let Ok(rate) = u64::try_from(sat_per_vbyte)
        && rate > 0
    {
        return RedeemFee::SatPerVbyte(rate);
    }
    match u32::try_from(target_conf) {
        Ok(target) if target > 0 => RedeemFee::TargetConf(target),
        _ => RedeemFee::TargetConf(FALLBACK_TARGET_CONF),
    }
}

/// Height the swap funds confirmed at. Unconfirmed outputs are ignored;
/// with none confirmed the current height is used.
pub fn oldest_utxo_height(utxos: &[SwapUtxo], current_height: u32) -> u32 {
    utxos
        .iter()
        .map(|u| u.block_height)
        .filter(|h| *h > 0)
        .min()
        .unwrap_or(current_height)
}

/// A swap is too old to pay once more than three quarters of its lock
/// window have passed.
pub fn is_expired(current_height: u32, utxo_height: u32, lock_height: u32) -> bool {
    let elapsed = i64::from(current_height) - i64::from(utxo_height);
    4 * elapsed > 3 * i64::from(lock_height)
}

pub fn deposit_window_closed_message(threshold_sat: u64) -> String {
    let btc = threshold_sat as f64 / 100_000_000.0;
    format!(
        "Adding funds is enabled when the balance is under {btc} BTC ({} Sat).",
        group_thousands(threshold_sat)
    )
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

