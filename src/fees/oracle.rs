use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::feed::{DEFAULT_FEED_URL, FeeFeed, HttpFeeFeed};
use super::{FeeError, FeeSnapshot};
use crate::shutdown::Shutdown;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FeeOracleConfig {
    pub feed_url: String,
    pub request_timeout: Duration,
    pub refresh_interval: Duration,
}

impl Default for FeeOracleConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Deadline-aware fee recommendations backed by a periodically refreshed
/// fee matrix.
///
/// Lookups take the read lock only long enough to clone an `Arc`, and a
/// refresh replaces the whole snapshot at once.
pub struct FeeRateOracle {
    feed: Arc<dyn FeeFeed>,
    refresh_interval: Duration,
    current: RwLock<Option<(Arc<FeeSnapshot>, Instant)>>,
}

impl FeeRateOracle {
    pub fn new(feed: Arc<dyn FeeFeed>, refresh_interval: Duration) -> Self {
        Self {
            feed,
            refresh_interval,
            current: RwLock::new(None),
        }
    }

    /// Oracle over the HTTP feed described by `cfg`.
    pub fn from_config(cfg: &FeeOracleConfig) -> Result<Self, FeeError> {
        let feed = HttpFeeFeed::new(&cfg.feed_url, cfg.request_timeout)?;
        tracing::info!(url = feed.url(), "using fee feed");
        Ok(Self::new(Arc::new(feed), cfg.refresh_interval))
    }

    pub fn snapshot(&self) -> Result<Arc<FeeSnapshot>, FeeError> {
        let guard = self.current.read().map_err(|_| FeeError::Poisoned)?;
        guard
            .as_ref()
            .map(|(snapshot, _)| snapshot.clone())
            .ok_or(FeeError::NoData)
    }

    /// Recommended sat/vbyte with `blocks_remaining` out of `total_window`
    /// blocks left before the deadline.
    pub fn fee_rate(&self, blocks_remaining: i64, total_window: u32) -> Result<f64, FeeError> {
        self.snapshot()?.fee_rate(blocks_remaining, total_window)
    }

    pub fn replace(&self, snapshot: FeeSnapshot) -> Result<(), FeeError> {
        let entry = (Arc::new(snapshot), Instant::now());
        let mut guard = self.current.write().map_err(|_| FeeError::Poisoned)?;
        *guard = Some(entry);
        Ok(())
    }

    /// Fetches and validates a new matrix. The cached snapshot is left
    /// untouched on any failure.
    pub async fn refresh(&self) -> Result<(), FeeError> {
        let body = self.feed.fetch().await?;
        let snapshot = FeeSnapshot::try_from(body)?;
        let previous_age = self
            .current
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|(_, fetched_at)| fetched_at.elapsed()));
        tracing::debug!(
            previous_age_secs = previous_age.map(|a| a.as_secs()),
            rows = snapshot.rows(),
            columns = snapshot.columns(),
            "fee matrix refreshed"
        );
        self.replace(snapshot)
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        tracing::info!(interval_secs = self.refresh_interval.as_secs(), "fee oracle started");
        loop {
            if let Err(err) = self.refresh().await {
                tracing::warn!(error = %err, "failed to get current chain fee rates");
            }

            if shutdown.sleep(self.refresh_interval).await {
                tracing::info!("fee oracle stopped");
                return;
            }
        }
    }
}
