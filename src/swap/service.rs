use std::sync::Arc;

use tonic::{Request, Response, Status};

use super::coordinator::{
    ClaimError, ClaimRejection, ClaimReply, DepositFunding, DepositLimit, InitSwapReply,
    InitSwapRequest, SwapCoordinator,
};
use crate::proto::v1 as pb;

const INTERNAL_ERROR: &str = "internal error";

/// gRPC surface of [`SwapCoordinator`].
#[derive(Clone)]
pub struct SwapperService {
    coordinator: Arc<SwapCoordinator>,
}

impl SwapperService {
    pub fn new(coordinator: Arc<SwapCoordinator>) -> Self {
        Self { coordinator }
    }

    async fn init_swap_with(
        &self,
        req: pb::InitSwapRequest,
        limit: DepositLimit,
    ) -> Result<Response<pb::InitSwapReply>, Status> {
        if req.hash.len() != 32 {
            return Err(Status::invalid_argument("hash must be 32 bytes"));
        }
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node_id is required"));
        }

        let req = InitSwapRequest {
            node_id: req.node_id,
            hash: req.hash,
            pubkey: req.pubkey,
            notification_token: req.notification_token,
        };
        let reply = self
            .coordinator
            .init_swap(&req, limit)
            .await
            .map_err(|e| internal("init swap", &e))?;

        Ok(Response::new(init_reply_to_proto(reply)?))
    }

    async fn execute_claim_with(
        &self,
        req: pb::ExecuteClaimRequest,
        limit: DepositLimit,
    ) -> Result<Response<pb::ExecuteClaimReply>, Status> {
        let reply = self
            .coordinator
            .execute_claim(&req.payment_request, limit)
            .await
            .map_err(claim_error_to_status)?;
        Ok(Response::new(claim_reply_to_proto(reply)))
    }
}

/// Logs the full error chain; callers only see that the call failed.
fn internal(call: &str, err: &anyhow::Error) -> Status {
    tracing::warn!(call, error = %format_args!("{err:#}"), "request failed");
    Status::internal(INTERNAL_ERROR)
}

fn to_i64(value: u64, what: &str) -> Result<i64, Status> {
    i64::try_from(value).map_err(|_| Status::internal(format!("{what} out of range")))
}

fn init_reply_to_proto(reply: InitSwapReply) -> Result<pb::InitSwapReply, Status> {
    Ok(pb::InitSwapReply {
        address: reply.address,
        pubkey: reply.pubkey,
        lock_height: i64::from(reply.lock_height),
        max_allowed_deposit: to_i64(reply.max_allowed_deposit, "max_allowed_deposit")?,
        error_message: reply.error_message,
        required_reserve: to_i64(reply.required_reserve, "required_reserve")?,
        min_allowed_deposit: to_i64(reply.min_allowed_deposit, "min_allowed_deposit")?,
    })
}

fn funding_to_proto(
    funding: DepositFunding,
) -> Result<pb::add_fund_status_reply::AddressStatus, Status> {
    Ok(pb::add_fund_status_reply::AddressStatus {
        tx: funding.tx,
        amount: to_i64(funding.amount, "amount")?,
        confirmed: funding.confirmed,
        block_height: funding.block_height,
    })
}

fn claim_reply_to_proto(reply: ClaimReply) -> pb::ExecuteClaimReply {
    let swap_error = match reply.rejection {
        None => pb::SwapError::None,
        Some(ClaimRejection::FundsExceedLimit) => pb::SwapError::FundsExceedLimit,
        Some(ClaimRejection::TxTooSmall) => pb::SwapError::TxTooSmall,
        Some(ClaimRejection::InvoiceAmountMismatch) => pb::SwapError::InvoiceAmountMismatch,
        Some(ClaimRejection::SwapExpired) => pb::SwapError::SwapExpired,
    };
    pb::ExecuteClaimReply {
        funds_exceeded_limit: reply.funds_exceeded_limit(),
        payment_error: reply.payment_error,
        swap_error: swap_error as i32,
    }
}

fn claim_error_to_status(err: ClaimError) -> Status {
    match err {
        ClaimError::MalformedInvoice(msg) => {
            Status::invalid_argument(format!("payment request is not valid: {msg}"))
        }
        ClaimError::NoUtxos => Status::internal(err.to_string()),
        ClaimError::Filtered => Status::internal(INTERNAL_ERROR),
        ClaimError::Duplicate(_) => Status::already_exists(err.to_string()),
        ClaimError::Infrastructure(e) => internal("execute claim", &e),
    }
}

#[tonic::async_trait]
impl pb::swapper_server::Swapper for SwapperService {
    async fn init_swap(
        &self,
        request: Request<pb::InitSwapRequest>,
    ) -> Result<Response<pb::InitSwapReply>, Status> {
        self.init_swap_with(request.into_inner(), DepositLimit::Current)
            .await
    }

    async fn init_swap_legacy(
        &self,
        request: Request<pb::InitSwapRequest>,
    ) -> Result<Response<pb::InitSwapReply>, Status> {
        self.init_swap_with(request.into_inner(), DepositLimit::Legacy)
            .await
    }

    async fn add_fund_status(
        &self,
        request: Request<pb::AddFundStatusRequest>,
    ) -> Result<Response<pb::AddFundStatusReply>, Status> {
        let req = request.into_inner();
        let statuses = self
            .coordinator
            .add_fund_status(&req.addresses, &req.notification_token)
            .await
            .into_iter()
            .map(|(address, funding)| Ok((address, funding_to_proto(funding)?)))
            .collect::<Result<_, Status>>()?;
        Ok(Response::new(pb::AddFundStatusReply { statuses }))
    }

    async fn execute_claim(
        &self,
        request: Request<pb::ExecuteClaimRequest>,
    ) -> Result<Response<pb::ExecuteClaimReply>, Status> {
        self.execute_claim_with(request.into_inner(), DepositLimit::Current)
            .await
    }

    async fn execute_claim_legacy(
        &self,
        request: Request<pb::ExecuteClaimRequest>,
    ) -> Result<Response<pb::ExecuteClaimReply>, Status> {
        self.execute_claim_with(request.into_inner(), DepositLimit::Legacy)
            .await
    }

    async fn manual_redeem(
        &self,
        request: Request<pb::ManualRedeemRequest>,
    ) -> Result<Response<pb::ManualRedeemReply>, Status> {
        let req = request.into_inner();
        if req.preimage.is_empty() {
            return Err(Status::invalid_argument("preimage is required"));
        }

        let txid = self
            .coordinator
            .manual_redeem(&req.preimage, req.target_conf, req.sat_per_vbyte)
            .await
            .map_err(|e| internal("manual redeem", &e))?;

        Ok(Response::new(pb::ManualRedeemReply { txid }))
    }

    async fn query_routing_node(
        &self,
        _request: Request<pb::QueryRoutingNodeRequest>,
    ) -> Result<Response<pb::QueryRoutingNodeReply>, Status> {
        let node_id = self
            .coordinator
            .routing_node_id()
            .map_err(|e| internal("query routing node", &e))?;
        Ok(Response::new(pb::QueryRoutingNodeReply { node_id }))
    }
}
