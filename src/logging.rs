use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. Filtering follows `RUST_LOG` and
/// defaults to `info`.
///
/// Fails if a global subscriber is already set, which callers that may run
/// more than once (tests) are expected to ignore.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("init tracing subscriber: {e}"))
}
