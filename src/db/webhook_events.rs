use sqlx::{Executor, Postgres};

use crate::billing::store::ProcessedEvent;

// key: webhook-dedup-db -> gateway event ids
/// Marks the event processed. `false` means another delivery already claimed it.
pub async fn claim_event<'c, E>(executor: E, event: &ProcessedEvent) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO webhook_events (event_id, event_type)
        VALUES ($1, $2)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING event_id
        "#,
    )
    .bind(&event.event_id)
    .bind(&event.event_type)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}
