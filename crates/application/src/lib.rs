//! Application layer for the cbsaga withdrawal platform.

pub mod withdrawals;

pub use withdrawals::{
    CreateWithdrawalRequest, CreateWithdrawalResponse, CreateWithdrawalUseCase,
    GetWithdrawalUseCase,
};
