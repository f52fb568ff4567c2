use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Client;

use super::{FeeError, FeeMatrixBody};

pub const DEFAULT_FEED_URL: &str = "https://whatthefee.io/data.json";

/// Feed results are published on this boundary, so requests inside one
/// window share a cache key upstream.
const CACHE_BUST_SECS: u64 = 300;

/// Source of fee matrices for the oracle.
#[async_trait]
pub trait FeeFeed: Send + Sync {
    async fn fetch(&self) -> Result<FeeMatrixBody, FeeError>;
}

#[derive(Debug, Clone)]
pub struct HttpFeeFeed {
    client: Client,
    url: String,
}

impl HttpFeeFeed {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FeeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeeFeed for HttpFeeFeed {
    async fn fetch(&self) -> Result<FeeMatrixBody, FeeError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let body = self
            .client
            .get(&self.url)
            .query(&[("c", cache_bust(now))])
            .send()
            .await?
            .error_for_status()?
            .json::<FeeMatrixBody>()
            .await?;

        Ok(body)
    }
}

pub fn cache_bust(unix_secs: u64) -> u64 {
    (unix_secs / CACHE_BUST_SECS) * CACHE_BUST_SECS
}
