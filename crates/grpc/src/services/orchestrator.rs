//! Orchestrator gRPC service implementation.

use cbsaga_application::{
    CreateWithdrawalRequest, CreateWithdrawalUseCase, GetWithdrawalUseCase,
};
use cbsaga_domain::DomainError;
use cbsaga_proto::orchestrator::v1::orchestrator_service_server::OrchestratorService;
use cbsaga_proto::orchestrator::v1::{
    CreateWithdrawalRequest as GrpcCreateWithdrawalRequest,
    CreateWithdrawalResponse as GrpcCreateWithdrawalResponse, GetWithdrawalRequest,
    GetWithdrawalResponse,
};
use cbsaga_shared::WithdrawalId;
use chrono::SecondsFormat;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{error, info};

pub struct OrchestratorGrpc {
    create_withdrawal: Arc<CreateWithdrawalUseCase>,
    get_withdrawal: Arc<GetWithdrawalUseCase>,
}

impl OrchestratorGrpc {
    pub fn new(
        create_withdrawal: Arc<CreateWithdrawalUseCase>,
        get_withdrawal: Arc<GetWithdrawalUseCase>,
    ) -> Self {
        Self {
            create_withdrawal,
            get_withdrawal,
        }
    }

    fn to_status(err: DomainError) -> Status {
        match err {
            DomainError::InvalidInput { message } => Status::invalid_argument(message),
            DomainError::IdempotencyKeyReuse => Status::failed_precondition(
                "idempotency_key already used for a different request",
            ),
            DomainError::IdempotencyInProgress { withdrawal_id } => {
                let mut message = String::from("request in progress; retry later");
                if let Some(id) = withdrawal_id {
                    message.push_str("; withdrawal_id=");
                    message.push_str(&id.to_string());
                }
                Status::aborted(message)
            }
            DomainError::OutcomeUnknown { withdrawal_id } => Status::aborted(format!(
                "withdrawal outcome unknown; retry with the same idempotency key; withdrawal_id={withdrawal_id}"
            )),
            DomainError::WithdrawalNotFound { .. } => Status::not_found("withdrawal not found"),
            err => {
                error!(error = %err, "internal error");
                Status::internal("internal error")
            }
        }
    }
}

#[tonic::async_trait]
impl OrchestratorService for OrchestratorGrpc {
    async fn create_withdrawal(
        &self,
        request: Request<GrpcCreateWithdrawalRequest>,
    ) -> Result<Response<GrpcCreateWithdrawalResponse>, Status> {
        let req = request.into_inner();
        info!(
            user_id = %req.user_id,
            asset = %req.asset,
            amount_minor = req.amount_minor,
            idempotency_key = %req.idempotency_key,
            "CreateWithdrawal called"
        );

        let result = self
            .create_withdrawal
            .execute(CreateWithdrawalRequest {
                user_id: req.user_id,
                asset: req.asset,
                amount_minor: req.amount_minor,
                destination_addr: req.destination_addr,
                idempotency_key: req.idempotency_key,
                trace_id: None,
            })
            .await
            .map_err(Self::to_status)?;

        info!(
            withdrawal_id = %result.withdrawal_id,
            status = %result.status,
            "CreateWithdrawal success"
        );

        Ok(Response::new(GrpcCreateWithdrawalResponse {
            withdrawal_id: result.withdrawal_id.to_string(),
            status: result.status.to_string(),
        }))
    }

    async fn get_withdrawal(
        &self,
        request: Request<GetWithdrawalRequest>,
    ) -> Result<Response<GetWithdrawalResponse>, Status> {
        let req = request.into_inner();

        let withdrawal_id: WithdrawalId = req
            .withdrawal_id
            .parse()
            .map_err(|_| Status::invalid_argument("withdrawal_id must be a UUID"))?;

        let withdrawal = self
            .get_withdrawal
            .execute(withdrawal_id)
            .await
            .map_err(Self::to_status)?;

        Ok(Response::new(GetWithdrawalResponse {
            withdrawal_id: withdrawal.withdrawal_id.to_string(),
            user_id: withdrawal.user_id,
            asset: withdrawal.asset,
            amount_minor: withdrawal.amount_minor,
            destination_addr: withdrawal.destination_addr,
            status: withdrawal.status.to_string(),
            failure_reason: withdrawal.failure_reason.unwrap_or_default(),
            created_at: withdrawal
                .created_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            updated_at: withdrawal
                .updated_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        }))
    }
}
