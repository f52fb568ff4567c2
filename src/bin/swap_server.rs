use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use clap::Parser as _;
use ln_subswap::fees::feed::DEFAULT_FEED_URL;
use ln_subswap::fees::oracle::{FeeOracleConfig, FeeRateOracle};
use ln_subswap::lightning::node::{GrpcRoutingNode, GrpcSwapNode};
use ln_subswap::proto::v1::swapper_server::SwapperServer;
use ln_subswap::swap::coordinator::{
    DEPOSIT_THRESHOLD_LEGACY_SAT, DEPOSIT_THRESHOLD_SAT, REQUIRED_RESERVE_SAT, SwapConfig,
    SwapCoordinator,
};
use ln_subswap::swap::redeem::{RedeemConfig, RedeemEngine};
use ln_subswap::swap::service::SwapperService;
use ln_subswap::swap::store::SqliteSwapLedger;
use ln_subswap::swap::FALLBACK_TARGET_CONF;
use tonic::transport::Server;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen_addr: String,

    #[arg(long, default_value = "bitcoin", value_parser = parse_network)]
    network: Network,

    #[arg(long)]
    routing_node_endpoint: String,

    #[arg(long, env = "LND_MACAROON_HEX", hide_env_values = true)]
    routing_node_macaroon: Option<String>,

    #[arg(long)]
    swap_node_endpoint: String,

    #[arg(long, env = "SUBSWAPPER_LND_MACAROON_HEX", hide_env_values = true)]
    swap_node_macaroon: Option<String>,

    #[arg(long, default_value_t = 30)]
    node_timeout_secs: u64,

    #[arg(long)]
    ledger_path: PathBuf,

    #[arg(long, default_value = DEFAULT_FEED_URL)]
    fee_feed_url: String,

    #[arg(long, default_value_t = 10)]
    fee_feed_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    fee_refresh_interval_secs: u64,

    #[arg(long, default_value_t = 300)]
    redeem_interval_secs: u64,

    #[arg(long, default_value_t = DEPOSIT_THRESHOLD_SAT)]
    deposit_threshold_sat: u64,

    #[arg(long, default_value_t = DEPOSIT_THRESHOLD_LEGACY_SAT)]
    deposit_threshold_legacy_sat: u64,

    #[arg(long, default_value_t = REQUIRED_RESERVE_SAT)]
    required_reserve_sat: u64,

    /// Hex node id returned by QueryRoutingNode.
    #[arg(long, env = "REVERSE_SWAP_ROUTING_NODE")]
    routing_node_id: Option<String>,

    #[arg(long, default_value_t = false)]
    address_filtering: bool,
}

fn parse_network(s: &str) -> Result<Network, String> {
    Network::from_str(s).map_err(|e| format!("invalid network {s}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_subswap::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;
    let node_timeout = Duration::from_secs(args.node_timeout_secs);

    let routing = GrpcRoutingNode::new(
        &args.routing_node_endpoint,
        args.routing_node_macaroon.as_deref(),
        node_timeout,
    )
    .context("create routing node client")?;
    let node = GrpcSwapNode::new(
        &args.swap_node_endpoint,
        args.swap_node_macaroon.as_deref(),
        node_timeout,
    )
    .context("create swap node client")?;

    let ledger = SqliteSwapLedger::open(args.ledger_path).context("open swap ledger")?;
    tracing::info!(path = %ledger.path().display(), "swap ledger ready");

    let fees = FeeRateOracle::from_config(&FeeOracleConfig {
        feed_url: args.fee_feed_url,
        request_timeout: Duration::from_secs(args.fee_feed_timeout_secs),
        refresh_interval: Duration::from_secs(args.fee_refresh_interval_secs),
    })
    .context("create fee oracle")?;

    let node = Arc::new(node);
    let ledger = Arc::new(ledger);
    let fees = Arc::new(fees);

    let redeemer = Arc::new(RedeemEngine::new(
        node.clone(),
        ledger.clone(),
        fees.clone(),
        RedeemConfig {
            interval: Duration::from_secs(args.redeem_interval_secs),
            fallback_target_conf: FALLBACK_TARGET_CONF,
        },
    ));

    let cfg = SwapConfig {
        network: args.network,
        deposit_threshold: args.deposit_threshold_sat,
        deposit_threshold_legacy: args.deposit_threshold_legacy_sat,
        required_reserve: args.required_reserve_sat,
        routing_node: args.routing_node_id,
        address_filtering: args.address_filtering,
        ..Default::default()
    };
    let coordinator = Arc::new(SwapCoordinator::new(
        cfg,
        Arc::new(routing),
        node,
        ledger,
        fees.clone(),
        redeemer.clone(),
    ));

    let (trigger, shutdown) = ln_subswap::shutdown::channel();

    let fee_task = tokio::spawn({
        let fees = fees.clone();
        let shutdown = shutdown.clone();
        async move { fees.run(shutdown).await }
    });
    let redeem_task = tokio::spawn({
        let redeemer = redeemer.clone();
        async move { redeemer.run(shutdown).await }
    });

    tracing::info!(%listen_addr, network = %args.network, "starting swapper gRPC server");

    let served = Server::builder()
        .add_service(SwapperServer::new(SwapperService::new(coordinator)))
        .serve_with_shutdown(listen_addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await
        .context("serve gRPC");

    trigger.trigger();
    for (name, task) in [("fee oracle", fee_task), ("redeem watcher", redeem_task)] {
        if let Err(err) = task.await {
            tracing::warn!(task = name, error = %err, "background task join error");
        }
    }

    served
}
