use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Monitored resources: one row per (tenant, url)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            source_id TEXT,
            url TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'article',
            parent_id TEXT,
            normalized_text TEXT,
            content_hash TEXT,
            simhash INTEGER,
            embedding BLOB,
            last_embedding_check INTEGER,
            pub_date TEXT,
            pub_date_provenance TEXT,
            pub_date_confidence REAL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            UNIQUE(tenant_id, url),
            FOREIGN KEY (parent_id) REFERENCES resources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content units extracted from resources: (resource, position) unique
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_units (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            title TEXT,
            summary TEXT,
            body TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            simhash INTEGER NOT NULL,
            embedding BLOB,
            pub_date TEXT,
            pub_date_provenance TEXT,
            pub_date_confidence REAL,
            status TEXT NOT NULL DEFAULT 'active',
            ingested_to TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            UNIQUE(resource_id, position),
            FOREIGN KEY (resource_id) REFERENCES resources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only change audit log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_events (
            id TEXT PRIMARY KEY,
            resource_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            tier INTEGER NOT NULL,
            similarity REAL NOT NULL,
            old_hash TEXT,
            new_hash TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            processed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (resource_id) REFERENCES resources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Searchable corpus queried by the hybrid retriever
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus_units (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            base_id TEXT,
            title TEXT,
            summary TEXT,
            category TEXT,
            source_type TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            embedding BLOB,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (base_id) REFERENCES corpus_units(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over corpus title+summary.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='corpus_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE corpus_fts USING fts5(
                unit_id UNINDEXED,
                tenant_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_tenant ON resources(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_units_resource ON content_units(resource_id, position)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_resource ON change_events(resource_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_processed ON change_events(processed, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_corpus_tenant ON corpus_units(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_corpus_created_at ON corpus_units(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
