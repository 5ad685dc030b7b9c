//! End-to-end change-detection tests against a temporary SQLite store.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use ekimen::config::{Config, DbConfig, DetectionConfig, EmbeddingConfig, TenancyConfig};
use ekimen::detect::{self, Observation, UnitObservation};
use ekimen::embedding::Embedder;
use chrono::NaiveDate;
use ekimen::models::{
    ChangeKind, DateProvenance, DetectedDate, ResourceKind, ResourceStatus, Tier,
};
use ekimen::{db, events, migrate};

/// Embedder returning canned vectors keyed by a marker word in the text.
struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains("VERSION_A") {
            Ok(vec![1.0, 0.0, 0.0])
        } else if text.contains("VERSION_B") {
            // cosine vs VERSION_A: 0.55
            Ok(vec![0.55, 0.835_164_8, 0.0])
        } else {
            Ok(vec![0.0, 0.0, 1.0])
        }
    }
}

/// Embedder that must never be called; proves the cost-gating contract.
struct ForbiddenEmbedder;

#[async_trait]
impl Embedder for ForbiddenEmbedder {
    fn model_name(&self) -> &str {
        "forbidden"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        panic!("embedding requested although tiers 1-2 were conclusive");
    }
}

fn test_config(tmp: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: tmp.path().join("ekimen.sqlite"),
        },
        detection: DetectionConfig::default(),
        retrieval: Default::default(),
        embedding: EmbeddingConfig {
            dims: 3,
            ..Default::default()
        },
        tenancy: TenancyConfig::default(),
    }
}

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (tmp, config, pool)
}

fn observation(tenant: &str, url: &str, text: Option<&str>) -> Observation {
    Observation {
        tenant_id: tenant.to_string(),
        url: url.to_string(),
        kind: ResourceKind::Article,
        source_id: None,
        parent_id: None,
        text: text.map(str::to_string),
        detected_date: None,
    }
}

async fn resource_row(pool: &SqlitePool, tenant: &str, url: &str) -> (Option<String>, String, i64) {
    let row = sqlx::query(
        "SELECT content_hash, status, version FROM resources WHERE tenant_id = ? AND url = ?",
    )
    .bind(tenant)
    .bind(url)
    .fetch_one(pool)
    .await
    .unwrap();
    (row.get("content_hash"), row.get("status"), row.get("version"))
}

#[tokio::test]
async fn test_first_observation_yields_new_tier1() {
    let (_tmp, config, pool) = setup().await;

    let obs = observation("t1", "https://x.org/news", Some("Hello world"));
    let decision = detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();

    assert_eq!(decision.kind, ChangeKind::New);
    assert_eq!(decision.tier, Tier::Exact);
    assert_eq!(decision.similarity, 0.0);

    let list = events::list_events(&pool, "t1", false, 10).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].kind, ChangeKind::New);
}

#[tokio::test]
async fn test_refetch_chain_identical_trivial_major_minor() {
    let (_tmp, config, pool) = setup().await;
    let url = "https://x.org/news";

    // First fetch: new.
    let obs = observation("t1", url, Some("Hello world VERSION_A"));
    let d = detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::New);

    let (hash_after_new, _, version_after_new) = resource_row(&pool, "t1", url).await;

    // Identical refetch: tier 1, fingerprints and version untouched.
    let d = detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::Identical);
    assert_eq!(d.tier, Tier::Exact);

    let (hash_after_identical, _, version_after_identical) = resource_row(&pool, "t1", url).await;
    assert_eq!(hash_after_new, hash_after_identical);
    assert_eq!(version_after_new, version_after_identical);

    // Whitespace-only refetch: tier 2 trivial, no embedding requested.
    let obs_ws = observation("t1", url, Some("Hello   world  VERSION_A"));
    let d = detect::observe_resource(&pool, &config, &obs_ws, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::Trivial);
    assert_eq!(d.tier, Tier::Fuzzy);
    assert!(d.similarity >= 0.90);

    // Substantial rewrite: tier 3. No stored embedding yet, so the
    // conservative default applies.
    let obs_rewrite = observation(
        "t1",
        url,
        Some("Totally rewritten piece about municipal budget reform VERSION_A"),
    );
    let d = detect::observe_resource(&pool, &config, &obs_rewrite, &StubEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::MajorUpdate);
    assert_eq!(d.tier, Tier::Semantic);
    assert_eq!(d.similarity, 0.0);

    // Another rewrite: now a stored embedding exists, cosine 0.55 is at
    // or above the minor threshold (0.50).
    let obs_minor = observation(
        "t1",
        url,
        Some("Rewritten again with a related angle on the reform VERSION_B"),
    );
    let d = detect::observe_resource(&pool, &config, &obs_minor, &StubEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::MinorUpdate);
    assert_eq!(d.tier, Tier::Semantic);
    assert!((d.similarity - 0.55).abs() < 0.01);

    // One event per observation.
    let list = events::list_events(&pool, "t1", false, 10).await.unwrap();
    assert_eq!(list.len(), 5);
}

#[tokio::test]
async fn test_gone_fetch_archives_but_keeps_fingerprints() {
    let (_tmp, config, pool) = setup().await;
    let url = "https://x.org/vanishing";

    let obs = observation("t1", url, Some("Here today"));
    detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    let (hash_before, _, _) = resource_row(&pool, "t1", url).await;
    assert!(hash_before.is_some());

    let gone = observation("t1", url, None);
    let d = detect::observe_resource(&pool, &config, &gone, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::Archived);

    let (hash_after, status, _) = resource_row(&pool, "t1", url).await;
    assert_eq!(status, "archived");
    // Last known good fingerprint survives archival.
    assert_eq!(hash_before, hash_after);
}

#[tokio::test]
async fn test_empty_text_treated_as_gone() {
    let (_tmp, config, pool) = setup().await;
    let url = "https://x.org/empty";

    detect::observe_resource(
        &pool,
        &config,
        &observation("t1", url, Some("Some content")),
        &ForbiddenEmbedder,
    )
    .await
    .unwrap();

    let d = detect::observe_resource(
        &pool,
        &config,
        &observation("t1", url, Some("   \n  ")),
        &ForbiddenEmbedder,
    )
    .await
    .unwrap();
    assert_eq!(d.kind, ChangeKind::Archived);
}

#[tokio::test]
async fn test_one_resource_row_per_tenant_url() {
    let (_tmp, config, pool) = setup().await;
    let url = "https://x.org/shared-url";

    for tenant in ["t1", "t2"] {
        let d = detect::observe_resource(
            &pool,
            &config,
            &observation(tenant, url, Some("Tenant copy")),
            &ForbiddenEmbedder,
        )
        .await
        .unwrap();
        assert_eq!(d.kind, ChangeKind::New);
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE url = ?")
        .bind(url)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    // Same tenant again is an update, not a second row.
    detect::observe_resource(
        &pool,
        &config,
        &observation("t1", url, Some("Tenant copy")),
        &ForbiddenEmbedder,
    )
    .await
    .unwrap();
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE tenant_id = 't1' AND url = ?")
            .bind(url)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_empty_tenant_rejected_without_writes() {
    let (_tmp, config, pool) = setup().await;

    let obs = observation("  ", "https://x.org/a", Some("text"));
    assert!(
        detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
            .await
            .is_err()
    );

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resources")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_unit_observation_lifecycle() {
    let (_tmp, config, pool) = setup().await;

    // Parent index resource.
    let obs = Observation {
        kind: ResourceKind::Index,
        ..observation("t1", "https://x.org/news-index", Some("listing page"))
    };
    detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    let resource_id: String =
        sqlx::query_scalar("SELECT id FROM resources WHERE url = 'https://x.org/news-index'")
            .fetch_one(&pool)
            .await
            .unwrap();

    let unit_obs = UnitObservation {
        tenant_id: "t1".to_string(),
        resource_id: resource_id.clone(),
        position: 0,
        title: Some("First article".to_string()),
        summary: Some("Summary".to_string()),
        text: Some("Body of the first article".to_string()),
        detected_date: None,
    };

    let d = detect::observe_unit(&pool, &config, &unit_obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::New);

    // Identical refetch of the unit.
    let d = detect::observe_unit(&pool, &config, &unit_obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::Identical);

    // (resource, position) stays unique.
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM content_units WHERE resource_id = ?")
            .bind(&resource_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // A second position is a separate unit.
    let second = UnitObservation {
        position: 1,
        title: Some("Second article".to_string()),
        text: Some("Body of the second article".to_string()),
        ..unit_obs
    };
    let d = detect::observe_unit(&pool, &config, &second, &ForbiddenEmbedder)
        .await
        .unwrap();
    assert_eq!(d.kind, ChangeKind::New);
}

#[tokio::test]
async fn test_load_resource_maps_stored_row() {
    let (_tmp, config, pool) = setup().await;
    let url = "https://x.org/dated";

    let mut obs = observation("t1", url, Some("Dated article body"));
    obs.detected_date = Some(DetectedDate {
        date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        provenance: DateProvenance::MetaTag,
        confidence: 0.9,
    });
    detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();

    let resource = detect::load_resource(&pool, "t1", url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resource.tenant_id, "t1");
    assert_eq!(resource.url, url);
    assert_eq!(resource.kind, ResourceKind::Article);
    assert_eq!(resource.status, ResourceStatus::Active);
    assert_eq!(resource.version, 0);
    assert!(resource.content_hash.is_some());
    assert!(resource.simhash.is_some());
    assert!(resource.embedding.is_none());

    let date = resource.detected_date.unwrap();
    assert_eq!(date.date, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
    assert_eq!(date.provenance, DateProvenance::MetaTag);
    assert!((date.confidence - 0.9).abs() < 1e-9);

    assert!(detect::load_resource(&pool, "t1", "https://x.org/absent")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_load_content_unit_maps_stored_row() {
    let (_tmp, config, pool) = setup().await;

    let obs = Observation {
        kind: ResourceKind::Index,
        ..observation("t1", "https://x.org/listing", Some("listing page"))
    };
    detect::observe_resource(&pool, &config, &obs, &ForbiddenEmbedder)
        .await
        .unwrap();
    let resource_id: String =
        sqlx::query_scalar("SELECT id FROM resources WHERE url = 'https://x.org/listing'")
            .fetch_one(&pool)
            .await
            .unwrap();

    let unit_obs = UnitObservation {
        tenant_id: "t1".to_string(),
        resource_id: resource_id.clone(),
        position: 0,
        title: Some("First article".to_string()),
        summary: None,
        text: Some("Body of the first article".to_string()),
        detected_date: None,
    };
    detect::observe_unit(&pool, &config, &unit_obs, &ForbiddenEmbedder)
        .await
        .unwrap();

    let unit_id: String =
        sqlx::query_scalar("SELECT id FROM content_units WHERE resource_id = ?")
            .bind(&resource_id)
            .fetch_one(&pool)
            .await
            .unwrap();

    let unit = detect::load_content_unit(&pool, &unit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.resource_id, resource_id);
    assert_eq!(unit.position, 0);
    assert_eq!(unit.title.as_deref(), Some("First article"));
    assert_eq!(unit.body, "Body of the first article");
    assert_eq!(unit.status, ResourceStatus::Active);
    assert!(unit.detected_date.is_none());
    assert!(unit.ingested_to.is_none());

    assert!(detect::load_content_unit(&pool, "no-such-unit")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_mark_processed_is_only_event_mutation() {
    let (_tmp, config, pool) = setup().await;

    detect::observe_resource(
        &pool,
        &config,
        &observation("t1", "https://x.org/a", Some("text")),
        &ForbiddenEmbedder,
    )
    .await
    .unwrap();

    let list = events::list_events(&pool, "t1", true, 10).await.unwrap();
    assert_eq!(list.len(), 1);
    let event_id = list[0].id.clone();

    events::mark_processed(&pool, &event_id).await.unwrap();

    let unprocessed = events::list_events(&pool, "t1", true, 10).await.unwrap();
    assert!(unprocessed.is_empty());

    let all = events::list_events(&pool, "t1", false, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].processed);

    assert!(events::mark_processed(&pool, "no-such-event").await.is_err());
}
