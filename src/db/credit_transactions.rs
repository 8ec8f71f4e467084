use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::billing::models::{LedgerEntry, TransactionKind, TransactionStatus};
use crate::billing::store::LedgerFilter;

pub struct NewLedgerEntry<'a> {
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub credits_delta: i64,
    pub amount_minor_units: Option<i64>,
    pub gateway_reference_id: Option<&'a str>,
    pub status: TransactionStatus,
}

// key: ledger-db -> append-only entries
/// Returns `None` when an entry with the same gateway reference already exists.
pub async fn insert_entry<'c, E>(
    executor: E,
    entry: &NewLedgerEntry<'_>,
) -> Result<Option<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO credit_transactions (
            id,
            account_id,
            kind,
            credits_delta,
            amount_minor_units,
            gateway_reference_id,
            status
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (gateway_reference_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.account_id)
    .bind(entry.kind)
    .bind(entry.credits_delta)
    .bind(entry.amount_minor_units)
    .bind(entry.gateway_reference_id)
    .bind(entry.status)
    .fetch_optional(executor)
    .await
}

pub async fn list_entries(
    pool: &PgPool,
    account_id: Uuid,
    filter: &LedgerFilter,
) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    let mut builder = QueryBuilder::new(
        "SELECT id, account_id, kind, credits_delta, amount_minor_units, gateway_reference_id, \
         status, created_at FROM credit_transactions ",
    );
    builder.push("WHERE account_id = ");
    builder.push_bind(account_id);

    if let Some(kind) = filter.kind {
        builder.push(" AND kind = ");
        builder.push_bind(kind);
    }

    builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
    builder.push_bind(filter.effective_limit());

    builder
        .build_query_as::<LedgerEntry>()
        .fetch_all(pool)
        .await
}
