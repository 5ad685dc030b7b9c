//! Tiered change detection for monitored resources and content units.
//!
//! Classification escalates through three comparison tiers, stopping at
//! the cheapest one that can decide:
//!
//! 1. **Exact** — no previous record means `new`; an equal SHA-256 hash
//!    means `identical` and short-circuits everything downstream.
//! 2. **Fuzzy** — simhash bit similarity at or above the trivial
//!    threshold means a formatting-level change.
//! 3. **Semantic** — embedding cosine similarity splits `minor_update`
//!    from `major_update`.
//!
//! Embeddings are the expensive signal, so the cheap tiers return a
//! [`CheapOutcome::NeedsEmbedding`] marker and the caller only invokes
//! the provider when that marker comes back. Each observation commits the
//! fingerprint overwrite and exactly one [`ChangeEvent`] in a single
//! transaction, with a compare-and-swap on the row version so concurrent
//! fetches of the same URL cannot both win.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Config, DetectionConfig};
use crate::embedding::{self, Embedder};
use crate::fingerprint;
use crate::models::{
    ChangeKind, ContentUnit, DateProvenance, DetectedDate, MonitoredResource, ResourceKind,
    ResourceStatus, Tier,
};

/// Terminal output of one classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeDecision {
    pub kind: ChangeKind,
    pub tier: Tier,
    pub similarity: f64,
}

/// Fingerprints of one version of a piece of content.
#[derive(Debug, Clone)]
pub struct Fingerprints {
    pub content_hash: String,
    pub simhash: u64,
}

impl Fingerprints {
    /// Compute both fingerprints from normalized text.
    pub fn of(text: &str) -> Self {
        Self {
            content_hash: fingerprint::content_hash(text),
            simhash: fingerprint::simhash(text),
        }
    }
}

/// Result of the cheap tiers (1–2).
#[derive(Debug, Clone, PartialEq)]
pub enum CheapOutcome {
    Decided(ChangeDecision),
    /// Hash and simhash were inconclusive; tier 3 must compare
    /// embeddings. Carries the tier-2 similarity for diagnostics.
    NeedsEmbedding { simhash_similarity: f64 },
}

/// Run tiers 1 and 2.
///
/// `new` of `None` means the fetch came back empty or gone, which
/// archives the resource regardless of history.
pub fn classify_cheap(
    previous: Option<&Fingerprints>,
    new: Option<&Fingerprints>,
    thresholds: &DetectionConfig,
) -> CheapOutcome {
    let new = match new {
        Some(fp) => fp,
        None => {
            return CheapOutcome::Decided(ChangeDecision {
                kind: ChangeKind::Archived,
                tier: Tier::Exact,
                similarity: 0.0,
            })
        }
    };

    let previous = match previous {
        Some(fp) => fp,
        None => {
            return CheapOutcome::Decided(ChangeDecision {
                kind: ChangeKind::New,
                tier: Tier::Exact,
                similarity: 0.0,
            })
        }
    };

    // Tier 1: exact hash comparison always short-circuits.
    if previous.content_hash == new.content_hash {
        return CheapOutcome::Decided(ChangeDecision {
            kind: ChangeKind::Identical,
            tier: Tier::Exact,
            similarity: 0.0,
        });
    }

    // Tier 2: fuzzy fingerprint comparison.
    let similarity = fingerprint::simhash_similarity(previous.simhash, new.simhash);
    if similarity >= thresholds.trivial_threshold {
        return CheapOutcome::Decided(ChangeDecision {
            kind: ChangeKind::Trivial,
            tier: Tier::Fuzzy,
            similarity,
        });
    }

    CheapOutcome::NeedsEmbedding {
        simhash_similarity: similarity,
    }
}

/// Run tier 3.
///
/// A missing previous embedding is not an error: the comparison cannot
/// run, so the decision defaults to the most conservative classification
/// for an existing record, `major_update`.
pub fn classify_semantic(
    previous_embedding: Option<&[f32]>,
    new_embedding: &[f32],
    thresholds: &DetectionConfig,
) -> ChangeDecision {
    let previous = match previous_embedding {
        Some(v) if !v.is_empty() => v,
        _ => {
            return ChangeDecision {
                kind: ChangeKind::MajorUpdate,
                tier: Tier::Semantic,
                similarity: 0.0,
            }
        }
    };

    let similarity = embedding::cosine_similarity(previous, new_embedding) as f64;
    let kind = if similarity >= thresholds.minor_threshold {
        ChangeKind::MinorUpdate
    } else {
        ChangeKind::MajorUpdate
    };

    ChangeDecision {
        kind,
        tier: Tier::Semantic,
        similarity,
    }
}

/// One fetched observation of a whole resource, as supplied by the
/// (external) fetcher.
#[derive(Debug, Clone)]
pub struct Observation {
    pub tenant_id: String,
    pub url: String,
    pub kind: ResourceKind,
    pub source_id: Option<String>,
    pub parent_id: Option<String>,
    /// Normalized text, or `None` when the fetch returned empty/404.
    pub text: Option<String>,
    pub detected_date: Option<DetectedDate>,
}

/// One fetched observation of a single content unit within a resource.
#[derive(Debug, Clone)]
pub struct UnitObservation {
    pub tenant_id: String,
    pub resource_id: String,
    pub position: i64,
    pub title: Option<String>,
    pub summary: Option<String>,
    /// Normalized body text, or `None` when the unit vanished.
    pub text: Option<String>,
    pub detected_date: Option<DetectedDate>,
}

/// Snapshot of the stored state the detector compares against.
struct PreviousResource {
    id: String,
    content_hash: Option<String>,
    simhash: Option<i64>,
    embedding: Option<Vec<u8>>,
    version: i64,
}

/// Classify one resource observation and persist the outcome.
///
/// Exactly one ChangeEvent row is written per successful invocation. On
/// a non-`identical` classification the stored text, fingerprints and
/// (when tier 3 ran) embedding are overwritten; `identical` only touches
/// the last-checked timestamp. All writes share one transaction guarded
/// by a version compare-and-swap, so a lost race returns an error and
/// leaves no partial state.
pub async fn observe_resource(
    pool: &SqlitePool,
    config: &Config,
    obs: &Observation,
    embedder: &dyn Embedder,
) -> Result<ChangeDecision> {
    if obs.tenant_id.trim().is_empty() {
        bail!("tenant_id must not be empty");
    }
    if obs.url.trim().is_empty() {
        bail!("url must not be empty");
    }

    let text = normalized_or_gone(obs.text.as_deref());
    let new_fp = text.map(Fingerprints::of);

    let previous = load_previous_resource(pool, &obs.tenant_id, &obs.url).await?;

    // First observation: insert the row up front so a concurrent first
    // fetch of the same URL loses on the UNIQUE(tenant_id, url) key and
    // at most one `new` event is ever recorded.
    let previous = match previous {
        Some(prev) => prev,
        None => match insert_new_resource(pool, config, obs, new_fp.as_ref(), text).await? {
            InsertOutcome::Inserted(decision) => return Ok(decision),
            InsertOutcome::LostRace => load_previous_resource(pool, &obs.tenant_id, &obs.url)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Resource vanished during concurrent insert"))?,
        },
    };

    let prev_fp = match (&previous.content_hash, previous.simhash) {
        (Some(hash), Some(sim)) => Some(Fingerprints {
            content_hash: hash.clone(),
            simhash: sim as u64,
        }),
        _ => None,
    };

    let (decision, new_embedding) = decide(
        prev_fp.as_ref(),
        new_fp.as_ref(),
        previous.embedding.as_deref(),
        text,
        config,
        embedder,
    )
    .await?;

    debug!(
        url = %obs.url,
        kind = decision.kind.as_str(),
        tier = decision.tier.as_i64(),
        similarity = decision.similarity,
        "classified resource observation"
    );

    persist_resource_decision(
        pool,
        &previous,
        obs,
        &decision,
        new_fp.as_ref(),
        new_embedding.as_deref(),
        text,
    )
    .await?;

    Ok(decision)
}

/// Classify one content-unit observation and persist the outcome.
///
/// Same tier contract as [`observe_resource`]; the ChangeEvent is
/// attributed to the owning resource with the unit position recorded in
/// the event metadata.
pub async fn observe_unit(
    pool: &SqlitePool,
    config: &Config,
    obs: &UnitObservation,
    embedder: &dyn Embedder,
) -> Result<ChangeDecision> {
    if obs.tenant_id.trim().is_empty() {
        bail!("tenant_id must not be empty");
    }
    if obs.position < 0 {
        bail!("position must be >= 0");
    }

    let text = normalized_or_gone(obs.text.as_deref());
    let new_fp = text.map(Fingerprints::of);

    let row = sqlx::query(
        "SELECT id, content_hash, simhash, embedding, version
         FROM content_units WHERE resource_id = ? AND position = ?",
    )
    .bind(&obs.resource_id)
    .bind(obs.position)
    .fetch_optional(pool)
    .await?;

    let previous = row.map(|r| PreviousResource {
        id: r.get("id"),
        content_hash: r.get("content_hash"),
        simhash: r.get("simhash"),
        embedding: r.get("embedding"),
        version: r.get("version"),
    });

    let previous = match previous {
        Some(prev) => prev,
        None => {
            return insert_new_unit(pool, config, obs, new_fp.as_ref(), text).await;
        }
    };

    let prev_fp = match (&previous.content_hash, previous.simhash) {
        (Some(hash), Some(sim)) => Some(Fingerprints {
            content_hash: hash.clone(),
            simhash: sim as u64,
        }),
        _ => None,
    };

    let (decision, new_embedding) = decide(
        prev_fp.as_ref(),
        new_fp.as_ref(),
        previous.embedding.as_deref(),
        text,
        config,
        embedder,
    )
    .await?;

    debug!(
        resource = %obs.resource_id,
        position = obs.position,
        kind = decision.kind.as_str(),
        tier = decision.tier.as_i64(),
        "classified unit observation"
    );

    persist_unit_decision(
        pool,
        &previous,
        obs,
        &decision,
        new_fp.as_ref(),
        new_embedding.as_deref(),
        text,
    )
    .await?;

    Ok(decision)
}

/// Treat empty/whitespace-only text the same as an absent fetch.
fn normalized_or_gone(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

/// Run the full tier chain, invoking the embedder only when tiers 1–2
/// are inconclusive. Returns the decision plus the freshly computed
/// embedding (present only when tier 3 ran).
async fn decide(
    prev_fp: Option<&Fingerprints>,
    new_fp: Option<&Fingerprints>,
    prev_embedding_blob: Option<&[u8]>,
    text: Option<&str>,
    config: &Config,
    embedder: &dyn Embedder,
) -> Result<(ChangeDecision, Option<Vec<f32>>)> {
    match classify_cheap(prev_fp, new_fp, &config.detection) {
        CheapOutcome::Decided(decision) => Ok((decision, None)),
        CheapOutcome::NeedsEmbedding { simhash_similarity } => {
            debug!(
                simhash_similarity,
                "fingerprints inconclusive, escalating to embedding comparison"
            );
            let text = text.ok_or_else(|| {
                anyhow::anyhow!("Tier 3 reached without text; classification bug")
            })?;
            let new_embedding = embedder.embed(text).await?;
            embedding::ensure_dims(&new_embedding, config.embedding.dims)?;

            let prev_embedding = prev_embedding_blob.map(embedding::blob_to_vec);
            let decision =
                classify_semantic(prev_embedding.as_deref(), &new_embedding, &config.detection);
            Ok((decision, Some(new_embedding)))
        }
    }
}

enum InsertOutcome {
    Inserted(ChangeDecision),
    LostRace,
}

async fn insert_new_resource(
    pool: &SqlitePool,
    config: &Config,
    obs: &Observation,
    new_fp: Option<&Fingerprints>,
    text: Option<&str>,
) -> Result<InsertOutcome> {
    // An empty first fetch still creates the row, immediately archived.
    let decision = match classify_cheap(None, new_fp, &config.detection) {
        CheapOutcome::Decided(d) => d,
        CheapOutcome::NeedsEmbedding { .. } => unreachable!("no previous record to escalate from"),
    };

    let status = if decision.kind == ChangeKind::Archived {
        ResourceStatus::Archived
    } else {
        ResourceStatus::Active
    };

    let now = chrono::Utc::now().timestamp();
    let resource_id = Uuid::new_v4().to_string();
    let (date, provenance, confidence) = date_columns(obs.detected_date.as_ref());

    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO resources
            (id, tenant_id, source_id, url, kind, parent_id, normalized_text,
             content_hash, simhash, pub_date, pub_date_provenance,
             pub_date_confidence, status, created_at, updated_at, version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        ON CONFLICT(tenant_id, url) DO NOTHING
        "#,
    )
    .bind(&resource_id)
    .bind(&obs.tenant_id)
    .bind(&obs.source_id)
    .bind(&obs.url)
    .bind(obs.kind.as_str())
    .bind(&obs.parent_id)
    .bind(text)
    .bind(new_fp.map(|fp| fp.content_hash.as_str()))
    .bind(new_fp.map(|fp| fp.simhash as i64))
    .bind(date)
    .bind(provenance)
    .bind(confidence)
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        // A concurrent first fetch already created this resource; it owns
        // the `new` event. Reclassify against the winner's row.
        tx.rollback().await?;
        return Ok(InsertOutcome::LostRace);
    }

    insert_event(
        &mut tx,
        &resource_id,
        &decision,
        None,
        new_fp.map(|fp| fp.content_hash.as_str()),
        serde_json::json!({ "url": obs.url, "kind": obs.kind.as_str() }),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(InsertOutcome::Inserted(decision))
}

async fn insert_new_unit(
    pool: &SqlitePool,
    config: &Config,
    obs: &UnitObservation,
    new_fp: Option<&Fingerprints>,
    text: Option<&str>,
) -> Result<ChangeDecision> {
    let decision = match classify_cheap(None, new_fp, &config.detection) {
        CheapOutcome::Decided(d) => d,
        CheapOutcome::NeedsEmbedding { .. } => unreachable!("no previous record to escalate from"),
    };

    // A unit that was never seen with content is not worth a row.
    let (text, new_fp) = match (text, new_fp) {
        (Some(t), Some(fp)) => (t, fp),
        _ => return Ok(decision),
    };

    let now = chrono::Utc::now().timestamp();
    let unit_id = Uuid::new_v4().to_string();
    let (date, provenance, confidence) = date_columns(obs.detected_date.as_ref());

    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO content_units
            (id, tenant_id, resource_id, position, title, summary, body,
             content_hash, simhash, pub_date, pub_date_provenance,
             pub_date_confidence, status, created_at, updated_at, version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, 0)
        ON CONFLICT(resource_id, position) DO NOTHING
        "#,
    )
    .bind(&unit_id)
    .bind(&obs.tenant_id)
    .bind(&obs.resource_id)
    .bind(obs.position)
    .bind(&obs.title)
    .bind(&obs.summary)
    .bind(text)
    .bind(&new_fp.content_hash)
    .bind(new_fp.simhash as i64)
    .bind(date)
    .bind(provenance)
    .bind(confidence)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        bail!(
            "Concurrent first observation of unit {}#{}; retry",
            obs.resource_id,
            obs.position
        );
    }

    insert_event(
        &mut tx,
        &obs.resource_id,
        &decision,
        None,
        Some(&new_fp.content_hash),
        serde_json::json!({ "unit_id": unit_id, "position": obs.position }),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(decision)
}

async fn persist_resource_decision(
    pool: &SqlitePool,
    previous: &PreviousResource,
    obs: &Observation,
    decision: &ChangeDecision,
    new_fp: Option<&Fingerprints>,
    new_embedding: Option<&[f32]>,
    text: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let updated = match decision.kind {
        // Identical: only the last-checked timestamp moves.
        ChangeKind::Identical => {
            sqlx::query("UPDATE resources SET updated_at = ? WHERE id = ? AND version = ?")
                .bind(now)
                .bind(&previous.id)
                .bind(previous.version)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        }
        // Content gone: archive but keep the last known good fingerprints.
        ChangeKind::Archived => sqlx::query(
            "UPDATE resources SET status = 'archived', updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(now)
        .bind(&previous.id)
        .bind(previous.version)
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        _ => {
            let fp = new_fp
                .ok_or_else(|| anyhow::anyhow!("Non-archival decision without fingerprints"))?;
            let (date, provenance, confidence) = date_columns(obs.detected_date.as_ref());
            sqlx::query(
                r#"
                UPDATE resources SET
                    normalized_text = ?,
                    content_hash = ?,
                    simhash = ?,
                    embedding = COALESCE(?, embedding),
                    last_embedding_check = CASE WHEN ? THEN ? ELSE last_embedding_check END,
                    pub_date = COALESCE(?, pub_date),
                    pub_date_provenance = COALESCE(?, pub_date_provenance),
                    pub_date_confidence = COALESCE(?, pub_date_confidence),
                    status = 'active',
                    updated_at = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(text)
            .bind(&fp.content_hash)
            .bind(fp.simhash as i64)
            .bind(new_embedding.map(crate::embedding::vec_to_blob))
            .bind(new_embedding.is_some())
            .bind(now)
            .bind(date)
            .bind(provenance)
            .bind(confidence)
            .bind(now)
            .bind(&previous.id)
            .bind(previous.version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        }
    };

    if updated == 0 {
        tx.rollback().await?;
        bail!(
            "Concurrent update of resource {} (version moved past {}); retry",
            previous.id,
            previous.version
        );
    }

    insert_event(
        &mut tx,
        &previous.id,
        decision,
        previous.content_hash.as_deref(),
        new_fp.map(|fp| fp.content_hash.as_str()),
        serde_json::json!({ "url": obs.url }),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn persist_unit_decision(
    pool: &SqlitePool,
    previous: &PreviousResource,
    obs: &UnitObservation,
    decision: &ChangeDecision,
    new_fp: Option<&Fingerprints>,
    new_embedding: Option<&[f32]>,
    text: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let updated = match decision.kind {
        ChangeKind::Identical => {
            sqlx::query("UPDATE content_units SET updated_at = ? WHERE id = ? AND version = ?")
                .bind(now)
                .bind(&previous.id)
                .bind(previous.version)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        }
        ChangeKind::Archived => sqlx::query(
            "UPDATE content_units SET status = 'archived', updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(now)
        .bind(&previous.id)
        .bind(previous.version)
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        _ => {
            let fp = new_fp
                .ok_or_else(|| anyhow::anyhow!("Non-archival decision without fingerprints"))?;
            let (date, provenance, confidence) = date_columns(obs.detected_date.as_ref());
            sqlx::query(
                r#"
                UPDATE content_units SET
                    title = COALESCE(?, title),
                    summary = COALESCE(?, summary),
                    body = ?,
                    content_hash = ?,
                    simhash = ?,
                    embedding = COALESCE(?, embedding),
                    pub_date = COALESCE(?, pub_date),
                    pub_date_provenance = COALESCE(?, pub_date_provenance),
                    pub_date_confidence = COALESCE(?, pub_date_confidence),
                    status = 'active',
                    updated_at = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(&obs.title)
            .bind(&obs.summary)
            .bind(text)
            .bind(&fp.content_hash)
            .bind(fp.simhash as i64)
            .bind(new_embedding.map(crate::embedding::vec_to_blob))
            .bind(date)
            .bind(provenance)
            .bind(confidence)
            .bind(now)
            .bind(&previous.id)
            .bind(previous.version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        }
    };

    if updated == 0 {
        tx.rollback().await?;
        bail!(
            "Concurrent update of content unit {} (version moved past {}); retry",
            previous.id,
            previous.version
        );
    }

    insert_event(
        &mut tx,
        &obs.resource_id,
        decision,
        previous.content_hash.as_deref(),
        new_fp.map(|fp| fp.content_hash.as_str()),
        serde_json::json!({ "unit_id": previous.id, "position": obs.position }),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    resource_id: &str,
    decision: &ChangeDecision,
    old_hash: Option<&str>,
    new_hash: Option<&str>,
    metadata: serde_json::Value,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO change_events
            (id, resource_id, kind, tier, similarity, old_hash, new_hash,
             metadata_json, processed, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(resource_id)
    .bind(decision.kind.as_str())
    .bind(decision.tier.as_i64())
    .bind(decision.similarity)
    .bind(old_hash)
    .bind(new_hash)
    .bind(metadata.to_string())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn load_previous_resource(
    pool: &SqlitePool,
    tenant_id: &str,
    url: &str,
) -> Result<Option<PreviousResource>> {
    let row = sqlx::query(
        "SELECT id, content_hash, simhash, embedding, version
         FROM resources WHERE tenant_id = ? AND url = ?",
    )
    .bind(tenant_id)
    .bind(url)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| PreviousResource {
        id: r.get("id"),
        content_hash: r.get("content_hash"),
        simhash: r.get("simhash"),
        embedding: r.get("embedding"),
        version: r.get("version"),
    }))
}

/// Load the full stored record of one monitored resource.
pub async fn load_resource(
    pool: &SqlitePool,
    tenant_id: &str,
    url: &str,
) -> Result<Option<MonitoredResource>> {
    let row = sqlx::query(
        "SELECT id, tenant_id, source_id, url, kind, parent_id, normalized_text,
                content_hash, simhash, embedding, last_embedding_check,
                pub_date, pub_date_provenance, pub_date_confidence,
                status, created_at, updated_at, version
         FROM resources WHERE tenant_id = ? AND url = ?",
    )
    .bind(tenant_id)
    .bind(url)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let simhash: Option<i64> = row.get("simhash");
    let embedding_blob: Option<Vec<u8>> = row.get("embedding");

    Ok(Some(MonitoredResource {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source_id: row.get("source_id"),
        url: row.get("url"),
        kind: ResourceKind::parse(&kind)?,
        parent_id: row.get("parent_id"),
        normalized_text: row.get("normalized_text"),
        content_hash: row.get("content_hash"),
        simhash: simhash.map(|s| s as u64),
        embedding: embedding_blob.map(|b| embedding::blob_to_vec(&b)),
        last_embedding_check: row.get("last_embedding_check"),
        detected_date: detected_date_from_columns(
            row.get("pub_date"),
            row.get("pub_date_provenance"),
            row.get("pub_date_confidence"),
        )?,
        status: ResourceStatus::parse(&status)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    }))
}

/// Load the full stored record of one content unit.
pub async fn load_content_unit(pool: &SqlitePool, unit_id: &str) -> Result<Option<ContentUnit>> {
    let row = sqlx::query(
        "SELECT id, tenant_id, resource_id, position, title, summary, body,
                content_hash, simhash, embedding, pub_date, pub_date_provenance,
                pub_date_confidence, status, ingested_to, created_at, updated_at,
                version
         FROM content_units WHERE id = ?",
    )
    .bind(unit_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let status: String = row.get("status");
    let simhash: i64 = row.get("simhash");
    let embedding_blob: Option<Vec<u8>> = row.get("embedding");

    Ok(Some(ContentUnit {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        resource_id: row.get("resource_id"),
        position: row.get("position"),
        title: row.get("title"),
        summary: row.get("summary"),
        body: row.get("body"),
        content_hash: row.get("content_hash"),
        simhash: simhash as u64,
        embedding: embedding_blob.map(|b| embedding::blob_to_vec(&b)),
        detected_date: detected_date_from_columns(
            row.get("pub_date"),
            row.get("pub_date_provenance"),
            row.get("pub_date_confidence"),
        )?,
        status: ResourceStatus::parse(&status)?,
        ingested_to: row.get("ingested_to"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    }))
}

fn date_columns(
    detected: Option<&DetectedDate>,
) -> (Option<String>, Option<&'static str>, Option<f64>) {
    match detected {
        Some(d) => (
            Some(d.date.format("%Y-%m-%d").to_string()),
            Some(d.provenance.as_str()),
            Some(d.confidence),
        ),
        None => (None, None, None),
    }
}

fn detected_date_from_columns(
    date: Option<String>,
    provenance: Option<String>,
    confidence: Option<f64>,
) -> Result<Option<DetectedDate>> {
    let date = match date {
        Some(d) => chrono::NaiveDate::parse_from_str(&d, "%Y-%m-%d")?,
        None => return Ok(None),
    };
    Ok(Some(DetectedDate {
        date,
        provenance: provenance
            .as_deref()
            .map(DateProvenance::parse)
            .transpose()?
            .unwrap_or(DateProvenance::Unknown),
        confidence: confidence.unwrap_or(0.0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> DetectionConfig {
        DetectionConfig {
            trivial_threshold: 0.90,
            minor_threshold: 0.50,
        }
    }

    #[test]
    fn test_first_observation_is_new_tier1() {
        let fp = Fingerprints::of("Hello world");
        let outcome = classify_cheap(None, Some(&fp), &thresholds());
        assert_eq!(
            outcome,
            CheapOutcome::Decided(ChangeDecision {
                kind: ChangeKind::New,
                tier: Tier::Exact,
                similarity: 0.0,
            })
        );
    }

    #[test]
    fn test_identical_hash_short_circuits() {
        let prev = Fingerprints::of("Hello world");
        // Same hash wins even with a wildly different simhash on the record.
        let mut new = Fingerprints::of("Hello world");
        new.simhash = !prev.simhash;
        let outcome = classify_cheap(Some(&prev), Some(&new), &thresholds());
        match outcome {
            CheapOutcome::Decided(d) => {
                assert_eq!(d.kind, ChangeKind::Identical);
                assert_eq!(d.tier, Tier::Exact);
            }
            other => panic!("expected tier-1 decision, got {:?}", other),
        }
    }

    #[test]
    fn test_whitespace_change_is_trivial_tier2() {
        let prev = Fingerprints::of("Hello world");
        let new = Fingerprints::of("Hello   world");
        assert_ne!(prev.content_hash, new.content_hash);
        match classify_cheap(Some(&prev), Some(&new), &thresholds()) {
            CheapOutcome::Decided(d) => {
                assert_eq!(d.kind, ChangeKind::Trivial);
                assert_eq!(d.tier, Tier::Fuzzy);
                assert!(d.similarity >= 0.90);
            }
            other => panic!("expected trivial, got {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_escalates_to_embedding() {
        let prev = Fingerprints::of("The council announced forest subsidies for landowners");
        let new = Fingerprints::of("Completely different topic: database index maintenance tips");
        match classify_cheap(Some(&prev), Some(&new), &thresholds()) {
            CheapOutcome::NeedsEmbedding { simhash_similarity } => {
                assert!(simhash_similarity < 0.90);
            }
            other => panic!("expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_gone_content_is_archived() {
        let prev = Fingerprints::of("Hello world");
        match classify_cheap(Some(&prev), None, &thresholds()) {
            CheapOutcome::Decided(d) => assert_eq!(d.kind, ChangeKind::Archived),
            other => panic!("expected archived, got {:?}", other),
        }
    }

    #[test]
    fn test_semantic_minor_vs_major() {
        let prev = vec![1.0f32, 0.0, 0.0];
        // ~0.894 cosine: above the 0.5 minor threshold.
        let close = vec![1.0f32, 0.5, 0.0];
        let d = classify_semantic(Some(&prev), &close, &thresholds());
        assert_eq!(d.kind, ChangeKind::MinorUpdate);
        assert_eq!(d.tier, Tier::Semantic);
        assert!(d.similarity >= 0.50);

        // Orthogonal: below the threshold.
        let far = vec![0.0f32, 0.0, 1.0];
        let d = classify_semantic(Some(&prev), &far, &thresholds());
        assert_eq!(d.kind, ChangeKind::MajorUpdate);
    }

    #[test]
    fn test_missing_previous_embedding_defaults_to_major() {
        let d = classify_semantic(None, &[1.0, 0.0], &thresholds());
        assert_eq!(d.kind, ChangeKind::MajorUpdate);
        assert_eq!(d.tier, Tier::Semantic);
        assert_eq!(d.similarity, 0.0);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let loose = DetectionConfig {
            trivial_threshold: 0.10,
            minor_threshold: 0.50,
        };
        let prev = Fingerprints::of("forest subsidies announced for rural landowners today");
        let new = Fingerprints::of("forest subsidies announced for urban landowners today");
        // With a very loose trivial threshold even real edits stay tier 2.
        match classify_cheap(Some(&prev), Some(&new), &loose) {
            CheapOutcome::Decided(d) => assert_eq!(d.kind, ChangeKind::Trivial),
            other => panic!("expected trivial under loose threshold, got {:?}", other),
        }
    }
}
