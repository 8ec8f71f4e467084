use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::credit_transactions::NewLedgerEntry;
use crate::db::{accounts, credit_transactions, subscriptions, webhook_events};

use super::error::BillingError;
use super::models::{Account, LedgerEntry, Subscription, TransactionKind, TransactionStatus};
use super::plans::Plan;
use super::store::{
    BillingStore, CreditOutcome, CreditPurchase, EffectApplied, LedgerFilter, NewSubscription,
    ProcessedEvent, ReconcileEffect, ReconcileOutcome, SubscriptionChange,
};

/// key: billing-store-postgres -> one transaction per operation
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn account(&self, account_id: Uuid) -> Result<Option<Account>, BillingError> {
        Ok(accounts::fetch_account(&self.pool, account_id).await?)
    }

    async fn balance(&self, account_id: Uuid) -> Result<i64, BillingError> {
        let balance =
            sqlx::query_scalar::<_, i64>("SELECT credit_balance FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn add_credits(&self, purchase: &CreditPurchase) -> Result<CreditOutcome, BillingError> {
        let mut tx = self.pool.begin().await?;
        let outcome = apply_purchase(&mut tx, purchase).await?;
        match outcome {
            CreditOutcome::Credited { .. } => tx.commit().await?,
            CreditOutcome::Duplicate => tx.rollback().await?,
        }
        Ok(outcome)
    }

    async fn debit_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        let mut tx = self.pool.begin().await?;
        let previous = accounts::lock_balance(&mut *tx, account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))?;
        let balance = (previous - credits).max(0);
        let removed = previous - balance;

        if removed > 0 {
            accounts::set_balance(&mut *tx, account_id, balance).await?;
            append_usage(&mut tx, account_id, -removed).await?;
        }
        tx.commit().await?;
        Ok(balance)
    }

    async fn reserve_credits(
        &self,
        account_id: Uuid,
        credits: i64,
    ) -> Result<Option<i64>, BillingError> {
        let mut tx = self.pool.begin().await?;
        let Some(balance) = accounts::reserve_balance(&mut *tx, account_id, credits).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        append_usage(&mut tx, account_id, -credits).await?;
        tx.commit().await?;
        Ok(Some(balance))
    }

    async fn refund_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        let mut tx = self.pool.begin().await?;
        let previous = accounts::lock_balance(&mut *tx, account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))?;
        let balance = accounts::set_balance(&mut *tx, account_id, previous + credits).await?;
        credit_transactions::insert_entry(
            &mut *tx,
            &NewLedgerEntry {
                account_id,
                kind: TransactionKind::Refund,
                credits_delta: credits,
                amount_minor_units: None,
                gateway_reference_id: None,
                status: TransactionStatus::Completed,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn ledger_entries(
        &self,
        account_id: Uuid,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        Ok(credit_transactions::list_entries(&self.pool, account_id, filter).await?)
    }

    async fn subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, BillingError> {
        Ok(subscriptions::find_by_external_id(&self.pool, external_subscription_id).await?)
    }

    async fn reconcile(
        &self,
        event: &ProcessedEvent,
        effect: &ReconcileEffect,
    ) -> Result<ReconcileOutcome, BillingError> {
        let mut tx = self.pool.begin().await?;
        if !webhook_events::claim_event(&mut *tx, event).await? {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::Duplicate);
        }

        let outcome = match effect {
            ReconcileEffect::Purchase(purchase) => match apply_purchase(&mut tx, purchase).await? {
                CreditOutcome::Credited { balance } => {
                    ReconcileOutcome::Applied(EffectApplied::Credited { balance })
                }
                CreditOutcome::Duplicate => ReconcileOutcome::Duplicate,
            },
            ReconcileEffect::Activate(subscription) => {
                apply_activation(&mut tx, subscription).await?
            }
            ReconcileEffect::Transition {
                external_subscription_id,
                change,
            } => apply_transition(&mut tx, external_subscription_id, change).await?,
        };

        match outcome {
            ReconcileOutcome::Applied(_) | ReconcileOutcome::Rejected(_) => tx.commit().await?,
            ReconcileOutcome::Duplicate | ReconcileOutcome::UnknownReference => {
                tx.rollback().await?
            }
        }
        Ok(outcome)
    }
}

async fn apply_purchase(
    tx: &mut Transaction<'_, Postgres>,
    purchase: &CreditPurchase,
) -> Result<CreditOutcome, BillingError> {
    let inserted = credit_transactions::insert_entry(
        &mut *tx,
        &NewLedgerEntry {
            account_id: purchase.account_id,
            kind: TransactionKind::Purchase,
            credits_delta: purchase.credits,
            amount_minor_units: Some(purchase.amount_minor_units),
            gateway_reference_id: Some(&purchase.gateway_reference_id),
            status: TransactionStatus::Completed,
        },
    )
    .await;

    let inserted = match inserted {
        Ok(inserted) => inserted,
        // FK violation: the ledger row points at an account that does not exist
        Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some("23503") => {
            return Err(BillingError::AccountNotFound(purchase.account_id));
        }
        Err(err) => return Err(err.into()),
    };

    if inserted.is_none() {
        return Ok(CreditOutcome::Duplicate);
    }

    let balance = accounts::credit_balance(&mut *tx, purchase.account_id, purchase.credits)
        .await?
        .ok_or(BillingError::AccountNotFound(purchase.account_id))?;
    Ok(CreditOutcome::Credited { balance })
}

async fn apply_activation(
    tx: &mut Transaction<'_, Postgres>,
    subscription: &NewSubscription,
) -> Result<ReconcileOutcome, BillingError> {
    if accounts::lock_balance(&mut *tx, subscription.account_id)
        .await?
        .is_none()
    {
        return Err(BillingError::AccountNotFound(subscription.account_id));
    }

    if subscriptions::insert_active(&mut *tx, subscription)
        .await?
        .is_none()
    {
        return Ok(ReconcileOutcome::Duplicate);
    }

    accounts::set_plan(&mut *tx, subscription.account_id, Plan::Unlimited.as_str()).await?;
    Ok(ReconcileOutcome::Applied(
        EffectApplied::SubscriptionActivated {
            account_id: subscription.account_id,
        },
    ))
}

async fn apply_transition(
    tx: &mut Transaction<'_, Postgres>,
    external_subscription_id: &str,
    change: &SubscriptionChange,
) -> Result<ReconcileOutcome, BillingError> {
    let Some(current) = subscriptions::lock_by_external_id(&mut *tx, external_subscription_id).await?
    else {
        return Ok(ReconcileOutcome::UnknownReference);
    };

    let next = match current.status.apply(change.event) {
        Ok(next) => next,
        Err(invalid) => return Ok(ReconcileOutcome::Rejected(invalid)),
    };

    subscriptions::update_lifecycle(
        &mut *tx,
        current.id,
        next,
        change.period,
        change.cancel_at_period_end,
    )
    .await?;

    if next.is_terminal() && !current.status.is_terminal() {
        // the account row lock serialises this check against activations and
        // against the deletion of the account's other subscriptions
        accounts::lock_balance(&mut *tx, current.account_id).await?;
        if !subscriptions::has_other_live(&mut *tx, current.account_id, current.id).await? {
            accounts::set_plan(&mut *tx, current.account_id, Plan::Free.as_str()).await?;
        }
    }

    Ok(ReconcileOutcome::Applied(EffectApplied::SubscriptionMoved {
        account_id: current.account_id,
        from: current.status,
        to: next,
    }))
}

async fn append_usage(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    credits_delta: i64,
) -> Result<(), BillingError> {
    credit_transactions::insert_entry(
        &mut *tx,
        &NewLedgerEntry {
            account_id,
            kind: TransactionKind::Usage,
            credits_delta,
            amount_minor_units: None,
            gateway_reference_id: None,
            status: TransactionStatus::Completed,
        },
    )
    .await?;
    Ok(())
}
