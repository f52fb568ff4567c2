use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use ln_subswap::proto::v1::swapper_client::SwapperClient;
use ln_subswap::proto::v1::{
    AddFundStatusRequest, ExecuteClaimRequest, InitSwapRequest, ManualRedeemRequest, QueryRoutingNodeRequest,
    SwapError,
};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    grpc_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Requests a swap address for a payment hash.
    InitSwap {
        #[arg(long)]
        node_id: String,

        /// Hex encoded payment hash.
        #[arg(long)]
        hash: String,

        /// Hex encoded refund pubkey.
        #[arg(long)]
        pubkey: String,

        #[arg(long, default_value = "")]
        notification_token: String,

        #[arg(long, default_value_t = false)]
        legacy: bool,
    },
    /// Reports funding of swap addresses and registers a notification token.
    AddFundStatus {
        #[arg(long = "address", required = true)]
        addresses: Vec<String>,

        #[arg(long, default_value = "")]
        notification_token: String,
    },
    /// Asks the service to pay an invoice against funds at a swap address.
    ExecuteClaim {
        #[arg(long)]
        payment_request: String,

        #[arg(long, default_value_t = false)]
        legacy: bool,
    },
    ManualRedeem {
        /// Hex encoded preimage.
        #[arg(long)]
        preimage: String,

        #[arg(long, default_value_t = 0)]
        target_conf: i32,

        #[arg(long, default_value_t = 0)]
        sat_per_vbyte: i64,
    },
    QueryRoutingNode,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_subswap::logging::init().ok();
    let args = Args::parse();

    let mut client = SwapperClient::connect(args.grpc_url)
        .await
        .context("connect gRPC")?;

    let out = match args.command {
        Command::InitSwap {
            node_id,
            hash,
            pubkey,
            notification_token,
            legacy,
        } => {
            let req = InitSwapRequest {
                node_id,
                hash: hex::decode(&hash).context("decode hash")?,
                pubkey: hex::decode(&pubkey).context("decode pubkey")?,
                notification_token,
            };
            let reply = if legacy {
                client.init_swap_legacy(req).await.context("InitSwapLegacy")?
            } else {
                client.init_swap(req).await.context("InitSwap")?
            }
            .into_inner();

            json!({
              "address": reply.address,
              "pubkey": hex::encode(&reply.pubkey),
              "lock_height": reply.lock_height,
              "max_allowed_deposit": reply.max_allowed_deposit,
              "min_allowed_deposit": reply.min_allowed_deposit,
              "required_reserve": reply.required_reserve,
              "error_message": reply.error_message,
            })
        }
        Command::AddFundStatus {
            addresses,
            notification_token,
        } => {
            let reply = client
                .add_fund_status(AddFundStatusRequest {
                    addresses,
                    notification_token,
                })
                .await
                .context("AddFundStatus")?
                .into_inner();

            let statuses: serde_json::Map<String, serde_json::Value> = reply
                .statuses
                .into_iter()
                .map(|(address, s)| {
                    let status = json!({
                      "tx": s.tx,
                      "amount": s.amount,
                      "confirmed": s.confirmed,
                      "block_height": s.block_height,
                    });
                    (address, status)
                })
                .collect();
            json!({ "statuses": statuses })
        }
        Command::ExecuteClaim {
            payment_request,
            legacy,
        } => {
            let req = ExecuteClaimRequest { payment_request };
            let reply = if legacy {
                client
                    .execute_claim_legacy(req)
                    .await
                    .context("ExecuteClaimLegacy")?
            } else {
                client.execute_claim(req).await.context("ExecuteClaim")?
            }
            .into_inner();

            let swap_error = SwapError::try_from(reply.swap_error)
                .map(|e| e.as_str_name().to_string())
                .unwrap_or_else(|_| reply.swap_error.to_string());

            json!({
              "payment_error": reply.payment_error,
              "funds_exceeded_limit": reply.funds_exceeded_limit,
              "swap_error": swap_error,
            })
        }
        Command::ManualRedeem {
            preimage,
            target_conf,
            sat_per_vbyte,
        } => {
            let reply = client
                .manual_redeem(ManualRedeemRequest {
                    preimage: hex::decode(&preimage).context("decode preimage")?,
                    target_conf,
                    sat_per_vbyte,
                })
                .await
                .context("ManualRedeem")?
                .into_inner();

            json!({ "txid": reply.txid })
        }
        Command::QueryRoutingNode => {
            let reply = client
                .query_routing_node(QueryRoutingNodeRequest {})
                .await
                .context("QueryRoutingNode")?
                .into_inner();

            json!({ "node_id": hex::encode(&reply.node_id) })
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&out).context("encode output")?
    );
    Ok(())
}
