use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tonic::codegen::InterceptedService;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::proto::node as pb;
use crate::proto::node::routing_node_client::RoutingNodeClient;
use crate::proto::node::swap_node_client::SwapNodeClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBalance {
    pub remote_pubkey: String,
    pub remote_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapAddress {
    pub address: String,
    pub pubkey: Vec<u8>,
    pub lock_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapUtxo {
    pub outpoint: String,
    pub amount: u64,
    /// Zero while unconfirmed.
    pub block_height: u32,
    pub source_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentAmount {
    pub amount: u64,
    pub lock_height: u32,
    pub utxos: Vec<SwapUtxo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOutcome {
    /// Routing failure reported by the node, empty on success.
    pub payment_error: String,
    pub preimage: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTransaction {
    pub txid: String,
    pub num_confirmations: u32,
    pub total_fees: u64,
    pub raw_tx_hex: String,
    pub block_height: u32,
}

/// How the node should price a redeem transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemFee {
    TargetConf(u32),
    SatPerVbyte(u64),
}

/// The Lightning node swap clients hold their channels with.
#[async_trait]
pub trait RoutingNode: Send + Sync {
    async fn block_height(&self) -> Result<u32>;

    async fn list_channels(&self) -> Result<Vec<ChannelBalance>>;
}

/// The node holding the swap keys: it issues swap addresses, pays claims
/// and signs and broadcasts redeem transactions.
#[async_trait]
pub trait SwapNode: Send + Sync {
    async fn block_height(&self) -> Result<u32>;

    async fn swap_init(&self, hash: &[u8], pubkey: &[u8]) -> Result<SwapAddress>;

    async fn unspent_amount(&self, hash: &[u8; 32]) -> Result<UnspentAmount>;

    /// Fee in satoshis of a redeem transaction for `hash` at `target_conf`.
    async fn redeem_fees(&self, hash: &[u8; 32], target_conf: u32) -> Result<u64>;

    /// Broadcasts a redeem transaction and returns its txid.
    async fn redeem(&self, preimage: &[u8], fee: RedeemFee) -> Result<String>;

    /// Single payment attempt. Routing failures come back in
    /// [`PaymentOutcome::payment_error`], transport failures as `Err`.
    async fn send_payment_sync(&self, payment_request: &str) -> Result<PaymentOutcome>;

    async fn reset_mission_control(&self) -> Result<()>;

    /// Wallet transactions from `start_height` on, unconfirmed included.
    async fn transactions_since(&self, start_height: u32) -> Result<Vec<NodeTransaction>>;
}

/// Attaches the node credential to every request.
#[derive(Clone)]
pub struct MacaroonInterceptor {
    macaroon: Option<AsciiMetadataValue>,
}

impl MacaroonInterceptor {
    pub fn new(macaroon_hex: Option<&str>) -> Result<Self> {
        let macaroon = macaroon_hex
            .filter(|m| !m.is_empty())
            .map(AsciiMetadataValue::try_from)
            .transpose()
            .context("macaroon is not valid metadata")?;
        Ok(Self { macaroon })
    }
}

impl Interceptor for MacaroonInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(macaroon) = &self.macaroon {
            request.metadata_mut().insert("macaroon", macaroon.clone());
        }
        Ok(request)
    }
}

type AuthedChannel = InterceptedService<Channel, MacaroonInterceptor>;

fn lazy_channel(endpoint: &str, timeout: Duration) -> Result<Channel> {
    let channel = Endpoint::from_shared(endpoint.to_string())
        .with_context(|| format!("parse node endpoint {endpoint}"))?
        .timeout(timeout)
        .connect_lazy();
    Ok(channel)
}

#[derive(Clone)]
pub struct GrpcRoutingNode {
    client: RoutingNodeClient<AuthedChannel>,
}

impl GrpcRoutingNode {
    pub fn new(endpoint: &str, macaroon_hex: Option<&str>, timeout: Duration) -> Result<Self> {
        let channel = lazy_channel(endpoint, timeout)?;
        let interceptor = MacaroonInterceptor::new(macaroon_hex)?;
        Ok(Self {
            client: RoutingNodeClient::with_interceptor(channel, interceptor),
        })
    }
}

#[async_trait]
impl RoutingNode for GrpcRoutingNode {
    async fn block_height(&self) -> Result<u32> {
        let resp = self
            .client
            .clone()
            .get_info(pb::GetInfoRequest {})
            .await
            .context("GetInfo")?
            .into_inner();
        Ok(resp.block_height)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelBalance>> {
        let resp = self
            .client
            .clone()
            .list_channels(pb::ListChannelsRequest {})
            .await
            .context("ListChannels")?
            .into_inner();

        Ok(resp
            .channels
            .into_iter()
            .map(|c| ChannelBalance {
                remote_pubkey: c.remote_pubkey,
                remote_balance: c.remote_balance,
            })
            .collect())
    }
}

/// Long enough for a payment to find a route; the node gives up on its own
/// before this in practice.
const SEND_PAYMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct GrpcSwapNode {
    client: SwapNodeClient<AuthedChannel>,
    timeout: Duration,
}

impl GrpcSwapNode {
    pub fn new(endpoint: &str, macaroon_hex: Option<&str>, timeout: Duration) -> Result<Self> {
        // Payments outlive ordinary calls, so the channel only bounds them
        // loosely and per-call deadlines do the rest.
        let channel = lazy_channel(endpoint, SEND_PAYMENT_TIMEOUT.max(timeout))?;
        let interceptor = MacaroonInterceptor::new(macaroon_hex)?;
        Ok(Self {
            client: SwapNodeClient::with_interceptor(channel, interceptor),
            timeout,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.timeout);
        request
    }
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative {what}: {value}"))
}

fn height(value: i64, what: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("invalid {what}: {value}"))
}

#[async_trait]
impl SwapNode for GrpcSwapNode {
    async fn block_height(&self) -> Result<u32> {
        let resp = self
            .client
            .clone()
            .get_info(self.request(pb::GetInfoRequest {}))
            .await
            .context("GetInfo")?
            .into_inner();
        Ok(resp.block_height)
    }

    async fn swap_init(&self, hash: &[u8], pubkey: &[u8]) -> Result<SwapAddress> {
        let resp = self
            .client
            .clone()
            .swap_init(self.request(pb::SwapInitRequest {
                hash: hash.to_vec(),
                pubkey: pubkey.to_vec(),
            }))
            .await
            .context("SwapInit")?
            .into_inner();

        Ok(SwapAddress {
            address: resp.address,
            pubkey: resp.pubkey,
            lock_height: height(resp.lock_height, "lock_height")?,
        })
    }

    async fn unspent_amount(&self, hash: &[u8; 32]) -> Result<UnspentAmount> {
        let resp = self
            .client
            .clone()
            .unspent_amount(self.request(pb::UnspentAmountRequest {
                hash: hash.to_vec(),
            }))
            .await
            .context("UnspentAmount")?
            .into_inner();

        let utxos = resp
            .utxos
            .into_iter()
            .map(|u| {
                Ok(SwapUtxo {
                    amount: non_negative(u.amount, "utxo amount")?,
                    block_height: u32::try_from(u.block_height).unwrap_or_default(),
                    outpoint: u.outpoint,
                    source_addresses: u.source_addresses,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(UnspentAmount {
            amount: non_negative(resp.amount, "unspent amount")?,
            lock_height: height(resp.lock_height, "lock_height")?,
            utxos,
        })
    }

    async fn redeem_fees(&self, hash: &[u8; 32], target_conf: u32) -> Result<u64> {
        let target_conf = i32::try_from(target_conf).context("target_conf out of range")?;
        let resp = self
            .client
            .clone()
            .redeem_fees(self.request(pb::RedeemFeesRequest {
                hash: hash.to_vec(),
                target_conf,
            }))
            .await
            .context("RedeemFees")?
            .into_inner();
        non_negative(resp.amount, "redeem fee")
    }

    async fn redeem(&self, preimage: &[u8], fee: RedeemFee) -> Result<String> {
        let (target_conf, sat_per_vbyte) = match fee {
            RedeemFee::TargetConf(t) => (i32::try_from(t).context("target_conf out of range")?, 0),
            RedeemFee::SatPerVbyte(r) => {
                (0, i64::try_from(r).context("sat_per_vbyte out of range")?)
            }
        };

        let resp = self
            .client
            .clone()
            .redeem(self.request(pb::RedeemRequest {
                preimage: preimage.to_vec(),
                target_conf,
                sat_per_vbyte,
            }))
            .await
            .context("Redeem")?
            .into_inner();
        Ok(resp.txid)
    }

    async fn send_payment_sync(&self, payment_request: &str) -> Result<PaymentOutcome> {
        let mut request = Request::new(pb::SendPaymentRequest {
            payment_request: payment_request.to_string(),
        });
        request.set_timeout(SEND_PAYMENT_TIMEOUT);

        let resp = self
            .client
            .clone()
            .send_payment_sync(request)
            .await
            .context("SendPaymentSync")?
            .into_inner();

        Ok(PaymentOutcome {
            payment_error: resp.payment_error,
            preimage: (!resp.payment_preimage.is_empty()).then_some(resp.payment_preimage),
        })
    }

    async fn reset_mission_control(&self) -> Result<()> {
        self.client
            .clone()
            .reset_mission_control(self.request(pb::ResetMissionControlRequest {}))
            .await
            .context("ResetMissionControl")?;
        Ok(())
    }

    async fn transactions_since(&self, start_height: u32) -> Result<Vec<NodeTransaction>> {
        let start_height = i32::try_from(start_height).context("start_height out of range")?;
        let resp = self
            .client
            .clone()
            .get_transactions(self.request(pb::GetTransactionsRequest {
                start_height,
                end_height: -1,
            }))
            .await
            .context("GetTransactions")?
            .into_inner();

        resp.transactions
            .into_iter()
            .map(|tx| {
                Ok(NodeTransaction {
                    num_confirmations: u32::try_from(tx.num_confirmations).unwrap_or_default(),
                    total_fees: non_negative(tx.total_fees, "total_fees")?,
                    block_height: u32::try_from(tx.block_height).unwrap_or_default(),
                    txid: tx.tx_hash,
                    raw_tx_hex: tx.raw_tx_hex,
                })
            })
            .collect()
    }
}
