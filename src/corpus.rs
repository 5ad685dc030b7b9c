//! Searchable corpus maintenance: promotion and the pool overlay.
//!
//! Promotion is driven by an external collaborator; this module only
//! performs the record-keeping it requests — copying a content unit into
//! the corpus and writing back the `ingested_to` linkage, atomically.
//!
//! The pool overlay is the shared-content forking pattern: a tenant's
//! corpus row may reference a pool-tenant base row, and unset overlay
//! fields fall back to the base at read time ([`merge_overlay`]). The
//! merge is an application-level step, never a store-level default.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::detect;
use crate::embedding;
use crate::models::SearchableUnit;

/// Promote a content unit into the searchable corpus.
///
/// Inserts the corpus row, its FTS entry, and the `ingested_to` linkage
/// in one transaction. Promoting an already-promoted unit is rejected.
pub async fn promote_unit(
    pool: &SqlitePool,
    unit_id: &str,
    category: Option<&str>,
    source_type: Option<&str>,
    tags: &[String],
) -> Result<String> {
    let unit = match detect::load_content_unit(pool, unit_id).await? {
        Some(u) => u,
        None => bail!("Content unit not found: {}", unit_id),
    };

    if let Some(corpus_id) = &unit.ingested_to {
        bail!("Unit {} already promoted to {}", unit_id, corpus_id);
    }

    if unit.embedding.is_none() {
        warn!(
            unit_id,
            "promoting unit without an embedding; it will be keyword-only until re-embedded"
        );
    }

    let corpus_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let tags_json = serde_json::to_string(tags)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO corpus_units
            (id, tenant_id, title, summary, category, source_type, tags_json,
             embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&corpus_id)
    .bind(&unit.tenant_id)
    .bind(&unit.title)
    .bind(&unit.summary)
    .bind(category)
    .bind(source_type)
    .bind(&tags_json)
    .bind(unit.embedding.as_deref().map(embedding::vec_to_blob))
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO corpus_fts (unit_id, tenant_id, text) VALUES (?, ?, ?)")
        .bind(&corpus_id)
        .bind(&unit.tenant_id)
        .bind(fts_text(unit.title.as_deref(), unit.summary.as_deref()))
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE content_units SET ingested_to = ?, updated_at = ? WHERE id = ?")
        .bind(&corpus_id)
        .bind(now)
        .bind(unit_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(corpus_id)
}

/// Fork a pool-tenant corpus row into a private per-tenant overlay.
///
/// Only the fields a tenant overrides are stored on the overlay row;
/// everything else resolves from the base via [`merge_overlay`].
pub async fn fork_pool_unit(
    pool: &SqlitePool,
    base_id: &str,
    tenant_id: &str,
    title: Option<&str>,
    summary: Option<&str>,
) -> Result<String> {
    let base = load_unit(pool, base_id).await?;
    let base = match base {
        Some(u) => u,
        None => bail!("Base corpus unit not found: {}", base_id),
    };

    let overlay_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO corpus_units
            (id, tenant_id, base_id, title, summary, category, source_type,
             tags_json, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, NULL, NULL, '[]', NULL, ?)
        "#,
    )
    .bind(&overlay_id)
    .bind(tenant_id)
    .bind(base_id)
    .bind(title)
    .bind(summary)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // The overlay's searchable text reflects the merged view.
    let merged_title = title.or(base.title.as_deref());
    let merged_summary = summary.or(base.summary.as_deref());
    sqlx::query("INSERT INTO corpus_fts (unit_id, tenant_id, text) VALUES (?, ?, ?)")
        .bind(&overlay_id)
        .bind(tenant_id)
        .bind(fts_text(merged_title, merged_summary))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(overlay_id)
}

/// Load one corpus unit, resolving its overlay against the base row when
/// one is referenced: each unset overlay field falls back to the base.
pub async fn resolve_unit(pool: &SqlitePool, unit_id: &str) -> Result<Option<SearchableUnit>> {
    let unit = match load_unit(pool, unit_id).await? {
        Some(u) => u,
        None => return Ok(None),
    };

    let resolved = match &unit.base_id {
        Some(base_id) => match load_unit(pool, base_id).await? {
            Some(base) => merge_overlay(&base, unit),
            None => {
                warn!(unit_id, base_id = %base_id, "overlay references a missing base unit");
                unit
            }
        },
        None => unit,
    };

    Ok(Some(resolved))
}

/// Fill each unset overlay field from the base. Identity and tenancy
/// always come from the overlay.
pub fn merge_overlay(base: &SearchableUnit, overlay: SearchableUnit) -> SearchableUnit {
    SearchableUnit {
        id: overlay.id,
        tenant_id: overlay.tenant_id,
        base_id: overlay.base_id,
        title: overlay.title.or_else(|| base.title.clone()),
        summary: overlay.summary.or_else(|| base.summary.clone()),
        category: overlay.category.or_else(|| base.category.clone()),
        source_type: overlay.source_type.or_else(|| base.source_type.clone()),
        tags: if overlay.tags.is_empty() {
            base.tags.clone()
        } else {
            overlay.tags
        },
        embedding: overlay.embedding.or_else(|| base.embedding.clone()),
        created_at: overlay.created_at,
    }
}

/// Flag active resources that never yielded a content unit.
///
/// This is the inconsistent-state case from the error taxonomy: logged
/// as a data-integrity warning, never fatal. Retrieval already excludes
/// such resources (nothing was promoted), so the scan only reports.
pub async fn scan_integrity(pool: &SqlitePool, tenant_id: &str) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.url FROM resources r
        WHERE r.tenant_id = ? AND r.status = 'active' AND r.kind = 'index'
          AND NOT EXISTS (SELECT 1 FROM content_units u WHERE u.resource_id = r.id)
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    for row in &rows {
        let id: String = row.get("id");
        let url: String = row.get("url");
        warn!(resource_id = %id, url = %url, "active index resource has no recorded content units");
    }

    Ok(rows.len() as u64)
}

fn fts_text(title: Option<&str>, summary: Option<&str>) -> String {
    match (title, summary) {
        (Some(t), Some(s)) => format!("{} {}", t, s),
        (Some(t), None) => t.to_string(),
        (None, Some(s)) => s.to_string(),
        (None, None) => String::new(),
    }
}

async fn load_unit(pool: &SqlitePool, unit_id: &str) -> Result<Option<SearchableUnit>> {
    let row = sqlx::query(
        "SELECT id, tenant_id, base_id, title, summary, category, source_type,
                tags_json, embedding, created_at
         FROM corpus_units WHERE id = ?",
    )
    .bind(unit_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let tags_json: String = row.get("tags_json");
    let embedding_blob: Option<Vec<u8>> = row.get("embedding");

    Ok(Some(SearchableUnit {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        base_id: row.get("base_id"),
        title: row.get("title"),
        summary: row.get("summary"),
        category: row.get("category"),
        source_type: row.get("source_type"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        embedding: embedding_blob.map(|b| embedding::blob_to_vec(&b)),
        created_at: row.get("created_at"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, tenant: &str) -> SearchableUnit {
        SearchableUnit {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            base_id: None,
            title: None,
            summary: None,
            category: None,
            source_type: None,
            tags: Vec::new(),
            embedding: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_merge_overlay_falls_back_to_base() {
        let mut base = unit("base", "pool");
        base.title = Some("base title".to_string());
        base.category = Some("news".to_string());
        base.tags = vec!["shared".to_string()];

        let mut overlay = unit("overlay", "tenant-a");
        overlay.base_id = Some("base".to_string());
        overlay.summary = Some("private summary".to_string());

        let merged = merge_overlay(&base, overlay);
        assert_eq!(merged.id, "overlay");
        assert_eq!(merged.tenant_id, "tenant-a");
        assert_eq!(merged.title.as_deref(), Some("base title"));
        assert_eq!(merged.summary.as_deref(), Some("private summary"));
        assert_eq!(merged.category.as_deref(), Some("news"));
        assert_eq!(merged.tags, vec!["shared".to_string()]);
    }

    #[test]
    fn test_merge_overlay_set_fields_win() {
        let mut base = unit("base", "pool");
        base.title = Some("base title".to_string());

        let mut overlay = unit("overlay", "tenant-a");
        overlay.title = Some("overridden".to_string());

        let merged = merge_overlay(&base, overlay);
        assert_eq!(merged.title.as_deref(), Some("overridden"));
    }

    #[test]
    fn test_fts_text_concatenation() {
        assert_eq!(fts_text(Some("a"), Some("b")), "a b");
        assert_eq!(fts_text(Some("a"), None), "a");
        assert_eq!(fts_text(None, None), "");
    }
}
