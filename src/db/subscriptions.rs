use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::billing::models::{BillingPeriod, Subscription, SubscriptionStatus};
use crate::billing::store::NewSubscription;

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, external_subscription_id, external_customer_id, \
    status, current_period_start, current_period_end, cancel_at_period_end, created_at, updated_at";

pub async fn find_by_external_id<'c, E>(
    executor: E,
    external_subscription_id: &str,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_subscription_id = $1"
    );
    sqlx::query_as::<_, Subscription>(&sql)
        .bind(external_subscription_id)
        .fetch_optional(executor)
        .await
}

pub async fn lock_by_external_id<'c, E>(
    executor: E,
    external_subscription_id: &str,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE external_subscription_id = $1 FOR UPDATE"
    );
    sqlx::query_as::<_, Subscription>(&sql)
        .bind(external_subscription_id)
        .fetch_optional(executor)
        .await
}

/// Whether the account holds a non-canceled subscription other than `excluding`.
pub async fn has_other_live<'c, E>(
    executor: E,
    account_id: Uuid,
    excluding: Uuid,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM subscriptions
            WHERE account_id = $1 AND id <> $2 AND status <> 'canceled'
        )
        "#,
    )
    .bind(account_id)
    .bind(excluding)
    .fetch_one(executor)
    .await
}

/// Inserts an `active` row; `None` when the external id is already on file.
pub async fn insert_active<'c, E>(
    executor: E,
    subscription: &NewSubscription,
) -> Result<Option<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO subscriptions (
            id,
            account_id,
            external_subscription_id,
            external_customer_id,
            status,
            current_period_start,
            current_period_end
        ) VALUES ($1, $2, $3, $4, 'active', $5, $6)
        ON CONFLICT (external_subscription_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription.account_id)
    .bind(&subscription.external_subscription_id)
    .bind(&subscription.external_customer_id)
    .bind(subscription.period.map(|period| period.start))
    .bind(subscription.period.map(|period| period.end))
    .fetch_optional(executor)
    .await
}

/// Period and cancel flag are left untouched when not supplied.
pub async fn update_lifecycle<'c, E>(
    executor: E,
    subscription_id: Uuid,
    status: SubscriptionStatus,
    period: Option<BillingPeriod>,
    cancel_at_period_end: Option<bool>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET
            status = $2,
            current_period_start = COALESCE($3, current_period_start),
            current_period_end = COALESCE($4, current_period_end),
            cancel_at_period_end = COALESCE($5, cancel_at_period_end),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(subscription_id)
    .bind(status)
    .bind(period.map(|period| period.start))
    .bind(period.map(|period| period.end))
    .bind(cancel_at_period_end)
    .execute(executor)
    .await?;
    Ok(())
}
