//! Read and acknowledge change events.
//!
//! Events are append-only; flipping `processed` is the only mutation the
//! store permits after insertion.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{ChangeEvent, ChangeKind, Tier};

/// List events for a tenant, newest first. `unprocessed_only` narrows to
/// events downstream consumers have not acknowledged yet.
pub async fn list_events(
    pool: &SqlitePool,
    tenant_id: &str,
    unprocessed_only: bool,
    limit: i64,
) -> Result<Vec<ChangeEvent>> {
    if limit < 1 {
        bail!("limit must be >= 1");
    }

    let mut sql = String::from(
        "SELECT e.id, e.resource_id, e.kind, e.tier, e.similarity, e.old_hash,
                e.new_hash, e.metadata_json, e.processed, e.created_at
         FROM change_events e
         JOIN resources r ON r.id = e.resource_id
         WHERE r.tenant_id = ?",
    );
    if unprocessed_only {
        sql.push_str(" AND e.processed = 0");
    }
    sql.push_str(" ORDER BY e.created_at DESC LIMIT ?");

    let rows = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(ChangeEvent {
                id: row.get("id"),
                resource_id: row.get("resource_id"),
                kind: ChangeKind::parse(row.get::<String, _>("kind").as_str())?,
                tier: Tier::parse(row.get("tier"))?,
                similarity: row.get("similarity"),
                old_hash: row.get("old_hash"),
                new_hash: row.get("new_hash"),
                metadata_json: row.get("metadata_json"),
                processed: row.get::<i64, _>("processed") != 0,
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

/// Acknowledge one event.
pub async fn mark_processed(pool: &SqlitePool, event_id: &str) -> Result<()> {
    let updated = sqlx::query("UPDATE change_events SET processed = 1 WHERE id = ?")
        .bind(event_id)
        .execute(pool)
        .await?
        .rows_affected();

    if updated == 0 {
        bail!("Change event not found: {}", event_id);
    }
    Ok(())
}
