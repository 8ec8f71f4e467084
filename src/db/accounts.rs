use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::billing::models::Account;

// key: accounts-db -> balance mutations
pub async fn fetch_account<'c, E>(executor: E, account_id: Uuid) -> Result<Option<Account>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Account>(
        r#"
        SELECT id, email, plan, credit_balance, daily_usage_count, created_at, updated_at
        FROM accounts
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(executor)
    .await
}

/// Locks the account row for the rest of the transaction.
pub async fn lock_balance<'c, E>(executor: E, account_id: Uuid) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>("SELECT credit_balance FROM accounts WHERE id = $1 FOR UPDATE")
        .bind(account_id)
        .fetch_optional(executor)
        .await
}

/// Adds credits and lifts the plan to `credits` unless the account is already unlimited.
pub async fn credit_balance<'c, E>(
    executor: E,
    account_id: Uuid,
    credits: i64,
) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE accounts
        SET
            credit_balance = credit_balance + $2,
            plan = CASE WHEN plan = 'unlimited' THEN plan ELSE 'credits' END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING credit_balance
        "#,
    )
    .bind(account_id)
    .bind(credits)
    .fetch_optional(executor)
    .await
}

pub async fn set_balance<'c, E>(
    executor: E,
    account_id: Uuid,
    balance: i64,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE accounts
        SET credit_balance = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING credit_balance
        "#,
    )
    .bind(account_id)
    .bind(balance)
    .fetch_one(executor)
    .await
}

/// Conditional debit: only succeeds when the whole amount is available.
pub async fn reserve_balance<'c, E>(
    executor: E,
    account_id: Uuid,
    credits: i64,
) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE accounts
        SET credit_balance = credit_balance - $2, updated_at = NOW()
        WHERE id = $1 AND credit_balance >= $2
        RETURNING credit_balance
        "#,
    )
    .bind(account_id)
    .bind(credits)
    .fetch_optional(executor)
    .await
}

pub async fn set_plan<'c, E>(executor: E, account_id: Uuid, plan: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("UPDATE accounts SET plan = $2, updated_at = NOW() WHERE id = $1")
        .bind(account_id)
        .bind(plan)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}
