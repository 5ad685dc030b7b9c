use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Thresholds for the tiered change detector.
///
/// Both are operational constants tuned empirically, so they are
/// configurable rather than baked in.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// Simhash bit similarity at or above which a change is `trivial`.
    #[serde(default = "default_trivial_threshold")]
    pub trivial_threshold: f64,
    /// Embedding cosine similarity at or above which a change is a
    /// `minor_update` rather than a `major_update`.
    #[serde(default = "default_minor_threshold")]
    pub minor_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            trivial_threshold: default_trivial_threshold(),
            minor_threshold: default_minor_threshold(),
        }
    }
}

fn default_trivial_threshold() -> f64 {
    0.90
}
fn default_minor_threshold() -> f64 {
    0.50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Minimum cosine similarity for the semantic candidate set.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f64,
    /// Weight of the semantic score in the blended ranking.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    /// Weight of the keyword score in the blended ranking.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    /// Each candidate set is capped at `candidate_multiplier × limit`.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: default_semantic_threshold(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            final_limit: default_final_limit(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_semantic_threshold() -> f64 {
    0.35
}
fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_final_limit() -> i64 {
    20
}
fn default_candidate_multiplier() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Dimensionality of per-unit content embeddings.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: default_dims(),
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Tenant-boundary configuration.
///
/// The pool tenant is the single designated shared-content tenant; it is
/// an explicit configuration value passed into every query, never an
/// implicit global.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenancyConfig {
    #[serde(default)]
    pub pool_tenant: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.detection.trivial_threshold) {
        anyhow::bail!("detection.trivial_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.detection.minor_threshold) {
        anyhow::bail!("detection.minor_threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.retrieval.semantic_threshold) {
        anyhow::bail!("retrieval.semantic_threshold must be in [0.0, 1.0]");
    }
    let weight_sum = config.retrieval.semantic_weight + config.retrieval.keyword_weight;
    if (weight_sum - 1.0).abs() > 1e-9 {
        anyhow::bail!(
            "retrieval.semantic_weight + retrieval.keyword_weight must equal 1.0 (got {})",
            weight_sum
        );
    }
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
