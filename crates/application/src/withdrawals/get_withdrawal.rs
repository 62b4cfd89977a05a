//! Withdrawal projection.

use cbsaga_domain::withdrawals::{Withdrawal, WithdrawalRepositoryTx};
use cbsaga_domain::{DomainError, Result};
use cbsaga_shared::WithdrawalId;
use std::sync::Arc;

pub struct GetWithdrawalUseCase {
    withdrawals: Arc<dyn WithdrawalRepositoryTx>,
}

impl GetWithdrawalUseCase {
    pub fn new(withdrawals: Arc<dyn WithdrawalRepositoryTx>) -> Self {
        Self { withdrawals }
    }

    pub async fn execute(&self, withdrawal_id: WithdrawalId) -> Result<Withdrawal> {
        self.withdrawals
            .get(withdrawal_id)
            .await?
            .ok_or(DomainError::WithdrawalNotFound { withdrawal_id })
    }
}
