//! # ekimen CLI
//!
//! Operational interface for the change-detection and retrieval engine.
//! The fetcher and the promotion policy live outside this repository; the
//! CLI feeds their outputs through the core.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ekimen init` | Create the SQLite database and run schema migrations |
//! | `ekimen observe` | Classify one fetched observation of a URL |
//! | `ekimen changes` | List change events for a tenant |
//! | `ekimen promote` | Promote a content unit into the searchable corpus |
//! | `ekimen search` | Hybrid semantic + keyword search |
//! | `ekimen check` | Report data-integrity warnings for a tenant |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ekimen::models::ResourceKind;
use ekimen::{config, corpus, db, detect, embedding, events, migrate, retrieve};

/// ekimen — change detection and hybrid retrieval for monitored web
/// content.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file with database, detection, retrieval, embedding, and tenancy
/// settings.
#[derive(Parser)]
#[command(
    name = "ekimen",
    about = "Change detection and hybrid retrieval engine for monitored web content",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ekimen.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// Feed one fetched observation through the change detector.
    ///
    /// Reads normalized text from `--text-file` (or marks the content
    /// gone with `--gone`), classifies it against the stored version,
    /// and prints the resulting change decision.
    Observe {
        /// Tenant that owns the resource.
        #[arg(long)]
        tenant: String,

        /// URL of the monitored resource.
        #[arg(long)]
        url: String,

        /// Resource kind: `index` or `article`.
        #[arg(long, default_value = "article")]
        kind: String,

        /// Parent resource id (an article under an index page).
        #[arg(long)]
        parent: Option<String>,

        /// File with the normalized text of this fetch.
        #[arg(long, conflicts_with = "gone")]
        text_file: Option<PathBuf>,

        /// The fetch returned empty or 404.
        #[arg(long)]
        gone: bool,
    },

    /// List change events for a tenant, newest first.
    Changes {
        #[arg(long)]
        tenant: String,

        /// Only events downstream consumers have not acknowledged.
        #[arg(long)]
        unprocessed: bool,

        /// Acknowledge this event id instead of listing.
        #[arg(long)]
        mark_processed: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Promote a content unit into the searchable corpus.
    Promote {
        /// Content unit id.
        #[arg(long)]
        unit: String,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        source_type: Option<String>,

        /// Tags attached to the corpus record (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Search the corpus with blended semantic + keyword ranking.
    ///
    /// The query is embedded with the configured provider, so an enabled
    /// embedding provider is required.
    Search {
        /// The search query string.
        query: String,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        limit: Option<i64>,

        /// Only units created within the last N days.
        #[arg(long)]
        max_age_days: Option<i64>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        source_type: Option<String>,

        /// Include the shared pool tenant's records.
        #[arg(long)]
        include_pool: bool,
    },

    /// Report data-integrity warnings for a tenant.
    Check {
        #[arg(long)]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Observe {
            tenant,
            url,
            kind,
            parent,
            text_file,
            gone,
        } => {
            let text = match (&text_file, gone) {
                (Some(path), false) => Some(std::fs::read_to_string(path)?),
                (None, true) => None,
                _ => anyhow::bail!("Provide exactly one of --text-file or --gone"),
            };

            let obs = detect::Observation {
                tenant_id: tenant,
                url,
                kind: ResourceKind::parse(&kind)?,
                source_id: None,
                parent_id: parent,
                text,
                detected_date: None,
            };

            let pool = db::connect(&cfg).await?;
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let decision = detect::observe_resource(&pool, &cfg, &obs, embedder.as_ref()).await?;
            let resource = detect::load_resource(&pool, &obs.tenant_id, &obs.url).await?;
            pool.close().await;

            println!(
                "{} (tier {}, similarity {:.2})",
                decision.kind.as_str(),
                decision.tier.as_i64(),
                decision.similarity
            );
            if let Some(resource) = resource {
                println!(
                    "resource {} status={} version={}",
                    resource.id,
                    resource.status.as_str(),
                    resource.version
                );
            }
        }
        Commands::Changes {
            tenant,
            unprocessed,
            mark_processed,
            limit,
        } => {
            let pool = db::connect(&cfg).await?;

            if let Some(event_id) = mark_processed {
                events::mark_processed(&pool, &event_id).await?;
                println!("marked {} processed", event_id);
                pool.close().await;
                return Ok(());
            }

            let list = events::list_events(&pool, &tenant, unprocessed, limit).await?;
            pool.close().await;

            if list.is_empty() {
                println!("No change events.");
                return Ok(());
            }
            for event in &list {
                let date = chrono::DateTime::from_timestamp(event.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!(
                    "{} {} tier{} sim={:.2} resource={} processed={} {}",
                    date,
                    event.kind.as_str(),
                    event.tier.as_i64(),
                    event.similarity,
                    event.resource_id,
                    event.processed,
                    event.id
                );
            }
        }
        Commands::Promote {
            unit,
            category,
            source_type,
            tags,
        } => {
            let pool = db::connect(&cfg).await?;
            let corpus_id = corpus::promote_unit(
                &pool,
                &unit,
                category.as_deref(),
                source_type.as_deref(),
                &tags,
            )
            .await?;
            pool.close().await;
            println!("promoted {} -> {}", unit, corpus_id);
        }
        Commands::Search {
            query,
            tenant,
            limit,
            max_age_days,
            category,
            source_type,
            include_pool,
        } => {
            if !cfg.embedding.is_enabled() {
                anyhow::bail!(
                    "Search requires an embedding provider. Set [embedding] provider in config."
                );
            }

            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let query_embedding = embedder.embed(&query).await?;

            let req = retrieve::SearchRequest {
                tenant_id: tenant,
                query,
                query_embedding,
                limit: limit.unwrap_or(cfg.retrieval.final_limit),
                max_age_days,
                category,
                source_type,
                include_pool,
            };

            let pool = db::connect(&cfg).await?;
            let hits = retrieve::run_search(&pool, &cfg, &req).await?;
            pool.close().await;

            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} (semantic {:.2}, keyword {:.2})",
                    i + 1,
                    hit.combined_score,
                    hit.title.as_deref().unwrap_or("(untitled)"),
                    hit.semantic_score,
                    hit.keyword_score
                );
                if let Some(summary) = &hit.summary {
                    println!("    {}", summary.replace('\n', " "));
                }
                println!("    id: {}", hit.unit_id);
            }
        }
        Commands::Check { tenant } => {
            let pool = db::connect(&cfg).await?;
            let flagged = corpus::scan_integrity(&pool, &tenant).await?;
            pool.close().await;
            if flagged == 0 {
                println!("ok");
            } else {
                println!("{} resource(s) flagged; see warnings above", flagged);
            }
        }
    }

    Ok(())
}
