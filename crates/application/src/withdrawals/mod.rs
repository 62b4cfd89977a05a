mod create_withdrawal;
mod get_withdrawal;
mod retry_policy;

pub use create_withdrawal::{
    CreateWithdrawalRequest, CreateWithdrawalResponse, CreateWithdrawalUseCase,
};
pub use get_withdrawal::GetWithdrawalUseCase;
pub use retry_policy::is_retryable_finalize;
