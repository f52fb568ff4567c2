use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::Mutex;

use super::store::SwapLedger;
use super::{FALLBACK_TARGET_CONF, REDEEM_CONFIRMATIONS, SwapRecord};
use crate::chain::redeem_tx::{RedeemTx, sha256_preimage};
use crate::fees::oracle::FeeRateOracle;
use crate::lightning::node::{NodeTransaction, RedeemFee, SwapNode};
use crate::shutdown::Shutdown;

pub const DEFAULT_REDEEM_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A replacement is only broadcast when the recommended rate beats the best
/// achieved one by more than this many sat/vbyte.
const BUMP_THRESHOLD_SAT_PER_VBYTE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct RedeemConfig {
    pub interval: Duration,
    pub fallback_target_conf: u32,
}

impl Default for RedeemConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REDEEM_INTERVAL,
            fallback_target_conf: FALLBACK_TARGET_CONF,
        }
    }
}

/// What one watcher pass did for a single swap.
#[derive(Debug, Clone, PartialEq)]
pub enum RedeemAction {
    /// No redeem transaction was known yet; one was broadcast.
    Broadcast { txid: String },
    /// Every known redeem was unconfirmed and underpriced.
    FeeBumped {
        txid: String,
        achieved: f64,
        recommended: f64,
    },
    Confirmed,
    /// The best redeem has some, but not enough, confirmations.
    Confirming,
    Unchanged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeemOutcome {
    pub payment_hash: String,
    pub action: RedeemAction,
}

/// Watches in-flight redeems: broadcasts missing ones, replaces underpriced
/// ones and promotes confirmed ones.
pub struct RedeemEngine {
    node: Arc<dyn SwapNode>,
    ledger: Arc<dyn SwapLedger>,
    fees: Arc<FeeRateOracle>,
    cfg: RedeemConfig,
    /// Swaps whose latest redeem was priced at the fallback target.
    fallback_priced: Mutex<HashSet<String>>,
}

impl RedeemEngine {
    pub fn new(
        node: Arc<dyn SwapNode>,
        ledger: Arc<dyn SwapLedger>,
        fees: Arc<FeeRateOracle>,
        cfg: RedeemConfig,
    ) -> Self {
        Self {
            node,
            ledger,
            fees,
            cfg,
            fallback_priced: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        tracing::info!(interval_secs = self.cfg.interval.as_secs(), "redeem watcher started");
        loop {
            if let Err(err) = self.check_redeems().await {
                tracing::warn!(error = %err, "redeem check failed");
            }

            if shutdown.sleep(self.cfg.interval).await {
                tracing::info!("redeem watcher stopped");
                return;
            }
        }
    }

    /// One watcher pass over every pending redeem.
    ///
    /// Fails only when the pass cannot start; per-swap failures are logged
    /// and reported as [`RedeemAction::Failed`].
    pub async fn check_redeems(&self) -> Result<Vec<RedeemOutcome>> {
        let height = self.node.block_height().await.context("get block height")?;
        let pending = self
            .ledger
            .list_pending_redeems(height)
            .await
            .context("list pending redeems")?;

        let Some(floor) = pending.iter().map(|r| r.confirmation_height).min() else {
            return Ok(Vec::new());
        };

        let txs: HashMap<String, NodeTransaction> = self
            .node
            .transactions_since(floor)
            .await
            .with_context(|| format!("list node transactions since {floor}"))?
            .into_iter()
            .map(|tx| (tx.txid.clone(), tx))
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for record in &pending {
            let action = match self.check_redeem(record, height, &txs).await {
                Ok(action) => action,
                Err(err) => {
                    tracing::warn!(
                        payment_hash = %record.payment_hash,
                        error = %err,
                        "failed to check redeem"
                    );
                    RedeemAction::Failed(format!("{err:#}"))
                }
            };
            outcomes.push(RedeemOutcome {
                payment_hash: record.payment_hash.clone(),
                action,
            });
        }
        Ok(outcomes)
    }

    async fn check_redeem(
        &self,
        record: &SwapRecord,
        height: u32,
        txs: &HashMap<String, NodeTransaction>,
    ) -> Result<RedeemAction> {
        let preimage = record
            .preimage
            .as_deref()
            .context("pending redeem without preimage")?;
        let preimage = hex::decode(preimage).context("hex decode stored preimage")?;
        let blocks_left = record.blocks_left(height);

        let resolved: Vec<&NodeTransaction> = record
            .redeem_txids
            .iter()
            .filter_map(|txid| txs.get(txid))
            .collect();

        if resolved.is_empty() {
            let txid = self
                .redeem(&preimage, blocks_left, record.lock_height)
                .await?;
            return Ok(RedeemAction::Broadcast { txid });
        }

        if resolved
            .iter()
            .any(|tx| tx.num_confirmations >= REDEEM_CONFIRMATIONS)
        {
            self.ledger
                .set_confirmed(&record.payment_hash)
                .await
                .context("mark redeem confirmed")?;
            tracing::info!(payment_hash = %record.payment_hash, "redeem confirmed");
            return Ok(RedeemAction::Confirmed);
        }

        if resolved.iter().any(|tx| tx.num_confirmations > 0) {
            return Ok(RedeemAction::Confirming);
        }

        let achieved = resolved
            .iter()
            .map(|tx| achieved_rate(record, tx))
            .fold(0.0_f64, f64::max);

        let recommended = match self.fees.fee_rate(blocks_left, record.lock_height) {
            Ok(rate) => rate,
            Err(err) => {
                if self.fallback_priced.lock().await.contains(&record.payment_hash) {
                    tracing::debug!(
                        payment_hash = %record.payment_hash,
                        error = %err,
                        "no fee estimate, fallback redeem already pending"
                    );
                    return Ok(RedeemAction::Unchanged);
                }
                tracing::warn!(
                    payment_hash = %record.payment_hash,
                    achieved,
                    error = %err,
                    "no fee estimate, rebroadcasting at fallback target"
                );
                let txid = self
                    .redeem_with_fee(&preimage, RedeemFee::TargetConf(self.cfg.fallback_target_conf))
                    .await?;
                self.set_fallback_priced(&record.payment_hash, true).await;
                return Ok(RedeemAction::Broadcast { txid });
            }
        };

        if recommended <= achieved + BUMP_THRESHOLD_SAT_PER_VBYTE {
            return Ok(RedeemAction::Unchanged);
        }

        tracing::info!(
            payment_hash = %record.payment_hash,
            achieved,
            recommended,
            blocks_left,
            "bumping redeem fee"
        );
        let txid = self
            .redeem_with_fee(&preimage, RedeemFee::SatPerVbyte(sat_per_vbyte(recommended)))
            .await?;
        self.set_fallback_priced(&record.payment_hash, false).await;
        Ok(RedeemAction::FeeBumped {
            txid,
            achieved,
            recommended,
        })
    }

    /// Broadcasts a redeem priced for `blocks_left` out of `lock_height`
    /// blocks, falling back to the fallback confirmation target when no
    /// estimate is available.
    pub async fn redeem(&self, preimage: &[u8], blocks_left: i64, lock_height: u32) -> Result<String> {
        let fee = match self.fees.fee_rate(blocks_left, lock_height) {
            Ok(rate) => RedeemFee::SatPerVbyte(sat_per_vbyte(rate)),
            Err(err) => {
                tracing::warn!(error = %err, blocks_left, "no fee estimate for redeem");
                RedeemFee::TargetConf(self.cfg.fallback_target_conf)
            }
        };
        let txid = self.redeem_with_fee(preimage, fee).await?;
        let payment_hash = hex::encode(sha256_preimage(preimage));
        self.set_fallback_priced(&payment_hash, matches!(fee, RedeemFee::TargetConf(_)))
            .await;
        Ok(txid)
    }

    async fn set_fallback_priced(&self, payment_hash: &str, fallback: bool) {
        let mut priced = self.fallback_priced.lock().await;
        if fallback {
            priced.insert(payment_hash.to_string());
        } else {
            priced.remove(payment_hash);
        }
    }

    /// Stores the preimage when the swap is known, asks the node to
    /// broadcast, then records the txid. Nothing is broadcast if the
    /// preimage cannot be stored.
    pub async fn redeem_with_fee(&self, preimage: &[u8], fee: RedeemFee) -> Result<String> {
        let payment_hash = hex::encode(sha256_preimage(preimage));

        let known = self
            .ledger
            .set_preimage(&payment_hash, &hex::encode(preimage))
            .await
            .with_context(|| format!("store preimage of {payment_hash}"))?;
        if !known {
            tracing::warn!(payment_hash = %payment_hash, "redeeming preimage of unknown swap");
        }

        let txid = self
            .node
            .redeem(preimage, fee)
            .await
            .with_context(|| format!("redeem {payment_hash} with {fee:?}"))?;
        tracing::info!(payment_hash = %payment_hash, txid = %txid, fee = ?fee, "redeem tx broadcast");

        let recorded = self
            .ledger
            .append_redeem_tx(&payment_hash, &txid)
            .await
            .with_context(|| format!("record redeem tx {txid}"))?;
        if !recorded {
            tracing::warn!(payment_hash = %payment_hash, txid = %txid, "redeem tx not tracked");
        }

        Ok(txid)
    }
}

/// Rate a known redeem achieved. Transactions that cannot be parsed count
/// as zero so they never block a bump.
fn achieved_rate(record: &SwapRecord, tx: &NodeTransaction) -> f64 {
    let parsed = match RedeemTx::from_raw_hex(&tx.raw_tx_hex) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(txid = %tx.txid, error = %err, "unparsable redeem tx");
            return 0.0;
        }
    };

    let payment_hash = hex::decode(&record.payment_hash)
        .ok()
        .and_then(|h| <[u8; 32]>::try_from(h).ok());
    if let Some(hash) = payment_hash
        && !parsed.reveals(&hash)
    {
        tracing::warn!(
            payment_hash = %record.payment_hash,
            txid = %tx.txid,
            "redeem tx does not reveal the swap preimage"
        );
    }

    parsed.sat_per_vbyte(tx.total_fees)
}

/// Whole sat/vbyte for a broadcast, never below one.
pub fn sat_per_vbyte(rate: f64) -> u64 {
    if !rate.is_finite() {
        return 1;
    }
    rate.ceil().max(1.0) as u64
}
