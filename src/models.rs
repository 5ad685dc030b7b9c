//! Core data models for the ekimen engine.
//!
//! These types represent the monitored resources, extracted content units,
//! change audit records, and searchable corpus rows that flow through the
//! change-detection and retrieval pipeline.

use anyhow::{bail, Result};
use chrono::NaiveDate;

/// Kind of a monitored fetch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A listing page that yields multiple content units.
    Index,
    /// A single article page.
    Article,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Index => "index",
            ResourceKind::Article => "article",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(ResourceKind::Index),
            "article" => Ok(ResourceKind::Article),
            other => bail!("Unknown resource kind: '{}'. Use index or article.", other),
        }
    }
}

/// Operational status of a resource or content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Active,
    Archived,
    Error,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Active => "active",
            ResourceStatus::Archived => "archived",
            ResourceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ResourceStatus::Active),
            "archived" => Ok(ResourceStatus::Archived),
            "error" => Ok(ResourceStatus::Error),
            other => bail!("Unknown status: '{}'", other),
        }
    }
}

/// Classification emitted by the change detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// First-ever observation of this resource or unit.
    New,
    /// Byte-identical normalized text (hash match).
    Identical,
    /// Formatting/whitespace-level difference (simhash above threshold).
    Trivial,
    /// Meaningful but limited edit (embedding similarity above threshold).
    MinorUpdate,
    /// Substantial rewrite (embedding similarity below threshold).
    MajorUpdate,
    /// Content disappeared from the source.
    Archived,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Identical => "identical",
            ChangeKind::Trivial => "trivial",
            ChangeKind::MinorUpdate => "minor_update",
            ChangeKind::MajorUpdate => "major_update",
            ChangeKind::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(ChangeKind::New),
            "identical" => Ok(ChangeKind::Identical),
            "trivial" => Ok(ChangeKind::Trivial),
            "minor_update" => Ok(ChangeKind::MinorUpdate),
            "major_update" => Ok(ChangeKind::MajorUpdate),
            "archived" => Ok(ChangeKind::Archived),
            other => bail!("Unknown change kind: '{}'", other),
        }
    }
}

/// Comparison tier that produced a change decision.
///
/// Tiers escalate by cost: the hash comparison is free, the simhash
/// comparison is cheap, and the embedding comparison requires an external
/// provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Exact = 1,
    Fuzzy = 2,
    Semantic = 3,
}

impl Tier {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn parse(n: i64) -> Result<Self> {
        match n {
            1 => Ok(Tier::Exact),
            2 => Ok(Tier::Fuzzy),
            3 => Ok(Tier::Semantic),
            other => bail!("Unknown detection tier: {}", other),
        }
    }
}

/// Where a detected publication date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateProvenance {
    MetaTag,
    JsonLd,
    UrlPattern,
    CssSelector,
    Llm,
    Unknown,
}

impl DateProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateProvenance::MetaTag => "meta_tag",
            DateProvenance::JsonLd => "jsonld",
            DateProvenance::UrlPattern => "url_pattern",
            DateProvenance::CssSelector => "css_selector",
            DateProvenance::Llm => "llm",
            DateProvenance::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "meta_tag" => Ok(DateProvenance::MetaTag),
            "jsonld" => Ok(DateProvenance::JsonLd),
            "url_pattern" => Ok(DateProvenance::UrlPattern),
            "css_selector" => Ok(DateProvenance::CssSelector),
            "llm" => Ok(DateProvenance::Llm),
            "unknown" => Ok(DateProvenance::Unknown),
            other => bail!("Unknown date provenance: '{}'", other),
        }
    }
}

/// A publication date supplied by the fetcher, with provenance and a
/// confidence score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct DetectedDate {
    pub date: NaiveDate,
    pub provenance: DateProvenance,
    pub confidence: f64,
}

/// A tracked fetch target (one URL) with its current fingerprints.
///
/// At most one row exists per (tenant, URL). Fingerprints are overwritten
/// on every non-identical observation; the row is never hard-deleted,
/// only archived.
#[derive(Debug, Clone)]
pub struct MonitoredResource {
    pub id: String,
    pub tenant_id: String,
    pub source_id: Option<String>,
    pub url: String,
    pub kind: ResourceKind,
    pub parent_id: Option<String>,
    pub normalized_text: Option<String>,
    pub content_hash: Option<String>,
    pub simhash: Option<u64>,
    pub embedding: Option<Vec<f32>>,
    pub last_embedding_check: Option<i64>,
    pub detected_date: Option<DetectedDate>,
    pub status: ResourceStatus,
    pub created_at: i64,
    pub updated_at: i64,
    /// Monotonic row version used for compare-and-swap writes.
    pub version: i64,
}

/// One discrete piece of content extracted from a resource.
///
/// (resource_id, position) is unique: an index page listing five articles
/// yields five units at positions 0..5.
#[derive(Debug, Clone)]
pub struct ContentUnit {
    pub id: String,
    pub tenant_id: String,
    pub resource_id: String,
    pub position: i64,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub body: String,
    pub content_hash: String,
    pub simhash: u64,
    pub embedding: Option<Vec<f32>>,
    pub detected_date: Option<DetectedDate>,
    pub status: ResourceStatus,
    /// Corpus row this unit was promoted into, once ingested.
    pub ingested_to: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: i64,
}

/// Immutable audit record of one change decision.
///
/// Append-only: the only permitted mutation is flipping `processed`.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: String,
    pub resource_id: String,
    pub kind: ChangeKind,
    pub tier: Tier,
    /// Similarity that drove the decision: 0.0 at tier 1, simhash bit
    /// similarity at tier 2, embedding cosine at tier 3.
    pub similarity: f64,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub metadata_json: String,
    pub processed: bool,
    pub created_at: i64,
}

/// Canonical corpus record queried by the hybrid retriever.
#[derive(Debug, Clone)]
pub struct SearchableUnit {
    pub id: String,
    pub tenant_id: String,
    /// Pool-tenant row this unit overlays, if it was forked from one.
    pub base_id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub source_type: Option<String>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// One ranked hit returned by the hybrid retriever.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub unit_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub source_type: Option<String>,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub combined_score: f64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_roundtrip() {
        for kind in [
            ChangeKind::New,
            ChangeKind::Identical,
            ChangeKind::Trivial,
            ChangeKind::MinorUpdate,
            ChangeKind::MajorUpdate,
            ChangeKind::Archived,
        ] {
            assert_eq!(ChangeKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_tier_numbering() {
        assert_eq!(Tier::Exact.as_i64(), 1);
        assert_eq!(Tier::Fuzzy.as_i64(), 2);
        assert_eq!(Tier::Semantic.as_i64(), 3);
        assert!(Tier::parse(4).is_err());
    }

    #[test]
    fn test_unknown_change_kind_rejected() {
        assert!(ChangeKind::parse("renamed").is_err());
    }

    #[test]
    fn test_provenance_covers_fetcher_tags() {
        for tag in [
            "meta_tag",
            "jsonld",
            "url_pattern",
            "css_selector",
            "llm",
            "unknown",
        ] {
            assert!(DateProvenance::parse(tag).is_ok(), "tag {} rejected", tag);
        }
    }
}
