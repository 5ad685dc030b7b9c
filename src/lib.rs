//! # ekimen
//!
//! Change detection and hybrid retrieval for monitored web content.
//!
//! ekimen is the engine behind a content-monitoring pipeline: an external
//! fetcher hands it normalized text for a URL (or a content unit within
//! one), and ekimen decides whether that content is new, unchanged,
//! trivially different, or a meaningful update — then lets a search-time
//! caller retrieve the promoted corpus through a blended semantic +
//! keyword ranking.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌───────────────┐
//! │ Fetcher  │──▶│  Change Detector   │──▶│    SQLite     │
//! │ (extern) │   │ hash→simhash→embed │   │ FTS5 + BLOBs  │
//! └──────────┘   └───────────────────┘   └──────┬────────┘
//!                                               │
//!                       ┌───────────────────────┤
//!                       ▼                       ▼
//!                ┌─────────────┐        ┌───────────────┐
//!                │  Promotion  │        │    Hybrid     │
//!                │  (corpus)   │        │   Retriever   │
//!                └─────────────┘        └───────────────┘
//! ```
//!
//! Detection escalates through three comparison tiers and stops at the
//! cheapest conclusive one; the embedding provider is only consulted when
//! the hash and simhash tiers cannot decide. Retrieval merges a cosine
//! similarity candidate set with an FTS5 keyword candidate set into one
//! semantic-weighted ranking.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | Content hash and simhash |
//! | [`detect`] | Tiered change detection |
//! | [`embedding`] | Embedding provider seam and vector utilities |
//! | [`retrieve`] | Hybrid semantic + keyword search |
//! | [`corpus`] | Promotion and pool overlay resolution |
//! | [`events`] | Change event listing and acknowledgement |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod corpus;
pub mod db;
pub mod detect;
pub mod embedding;
pub mod events;
pub mod fingerprint;
pub mod migrate;
pub mod models;
pub mod retrieve;
