use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use super::error::BillingError;
use super::models::{LedgerEntry, PlanSummary};
use super::store::{
    BillingStore, CreditOutcome, CreditPurchase, LedgerFilter, ProcessedEvent, ReconcileEffect,
    ReconcileOutcome,
};

/// key: credit-ledger -> spendable balance + append-only history
///
/// Every call is a single store transaction: the balance and its ledger entry
/// are written together or not at all.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Credits a completed purchase. Replaying the same gateway reference is a
    /// no-op reported as [`CreditOutcome::Duplicate`].
    pub async fn add_credits(
        &self,
        purchase: &CreditPurchase,
    ) -> Result<CreditOutcome, BillingError> {
        ensure_positive(purchase.credits)?;
        let outcome = self
            .store
            .add_credits(purchase)
            .await
            .map_err(|err| log_store_error(err, purchase.account_id))?;

        info!(
            account_id = %purchase.account_id,
            reference = %purchase.gateway_reference_id,
            credits = purchase.credits,
            ?outcome,
            "credit purchase recorded"
        );
        Ok(outcome)
    }

    /// Webhook variant of [`add_credits`](Self::add_credits): the purchase and
    /// the processed-event mark commit together.
    pub async fn add_credits_for_event(
        &self,
        event: &ProcessedEvent,
        purchase: CreditPurchase,
    ) -> Result<ReconcileOutcome, BillingError> {
        ensure_positive(purchase.credits)?;
        let account_id = purchase.account_id;
        self.store
            .reconcile(event, &ReconcileEffect::Purchase(purchase))
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    /// Removes up to `credits` and returns the new balance. Debiting more than
    /// the balance empties it without reporting an error.
    pub async fn debit_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        if credits < 0 {
            return Err(BillingError::InvalidAmount {
                expected: "zero or more",
                actual: credits,
            });
        }
        self.store
            .debit_credits(account_id, credits)
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    pub async fn get_balance(&self, account_id: Uuid) -> Result<i64, BillingError> {
        self.store
            .balance(account_id)
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    /// Check-and-debit in one step; `None` when the balance cannot cover it.
    pub async fn reserve(&self, account_id: Uuid, credits: i64) -> Result<Option<i64>, BillingError> {
        ensure_positive(credits)?;
        self.store
            .reserve_credits(account_id, credits)
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    pub async fn refund(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        ensure_positive(credits)?;
        self.store
            .refund_credits(account_id, credits)
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    pub async fn history(
        &self,
        account_id: Uuid,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        self.store
            .ledger_entries(account_id, filter)
            .await
            .map_err(|err| log_store_error(err, account_id))
    }

    /// Accounts not yet provisioned read as free with no credits.
    pub async fn plan_summary(&self, account_id: Uuid) -> Result<PlanSummary, BillingError> {
        let account = self
            .store
            .account(account_id)
            .await
            .map_err(|err| log_store_error(err, account_id))?;
        Ok(account
            .as_ref()
            .map(PlanSummary::from)
            .unwrap_or_else(PlanSummary::free))
    }
}

fn ensure_positive(credits: i64) -> Result<(), BillingError> {
    if credits <= 0 {
        return Err(BillingError::InvalidAmount {
            expected: "positive",
            actual: credits,
        });
    }
    Ok(())
}

fn log_store_error(err: BillingError, account_id: Uuid) -> BillingError {
    if err.is_retryable() {
        error!(?err, %account_id, "billing store operation failed");
    }
    err
}
