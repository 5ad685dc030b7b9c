//! Hybrid retrieval: semantic and keyword candidates merged into one
//! ranked result set.
//!
//! Deliberately not a pure vector search. The keyword path recovers
//! exact-term queries (proper nouns, codes) that embeddings under-weight,
//! while the semantic-dominant blend (0.7/0.3 by default) keeps recall
//! driven by meaning. Both paths are scoped to the requesting tenant,
//! plus the designated pool tenant when the caller opts in.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use crate::config::Config;
use crate::embedding;
use crate::models::SearchHit;

/// One retrieval call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub tenant_id: String,
    pub query: String,
    /// Precomputed query embedding; must match the stored dimensionality.
    pub query_embedding: Vec<f32>,
    pub limit: i64,
    pub max_age_days: Option<i64>,
    pub category: Option<String>,
    pub source_type: Option<String>,
    /// Include the shared pool tenant's records.
    pub include_pool: bool,
}

/// Corpus row carried through candidate selection.
#[derive(Debug, Clone)]
struct Candidate {
    unit_id: String,
    title: Option<String>,
    summary: Option<String>,
    category: Option<String>,
    source_type: Option<String>,
    created_at: i64,
}

/// Execute one hybrid search. Read-only; empty results are a normal
/// outcome, never an error.
pub async fn run_search(
    pool: &SqlitePool,
    config: &Config,
    req: &SearchRequest,
) -> Result<Vec<SearchHit>> {
    if req.tenant_id.trim().is_empty() {
        bail!("tenant_id must not be empty");
    }
    if req.limit < 1 {
        bail!("limit must be >= 1");
    }
    // Wrong dimensionality is a caller contract violation; reject before
    // touching the store.
    embedding::ensure_dims(&req.query_embedding, config.embedding.dims)?;

    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let tenants = tenant_scope(req, config);
    let candidate_cap = req.limit * config.retrieval.candidate_multiplier;

    let semantic = fetch_semantic_candidates(pool, config, req, &tenants, candidate_cap).await?;
    let keyword = fetch_keyword_candidates(pool, req, &tenants, candidate_cap).await?;

    debug!(
        semantic_candidates = semantic.len(),
        keyword_candidates = keyword.len(),
        "hybrid candidate sets fetched"
    );

    let mut hits = merge_candidates(
        semantic,
        keyword,
        config.retrieval.semantic_weight,
        config.retrieval.keyword_weight,
    );
    hits.truncate(req.limit as usize);
    Ok(hits)
}

/// The tenants a request may read: the caller's own, plus the pool
/// tenant when configured and opted into.
fn tenant_scope(req: &SearchRequest, config: &Config) -> Vec<String> {
    let mut tenants = vec![req.tenant_id.clone()];
    if req.include_pool {
        if let Some(pool_tenant) = &config.tenancy.pool_tenant {
            if pool_tenant != &req.tenant_id {
                tenants.push(pool_tenant.clone());
            }
        }
    }
    tenants
}

// ============ Semantic candidates ============

/// Rows with an embedding whose cosine similarity to the query meets the
/// configured threshold, best first, capped at `limit`.
///
/// Overlay rows resolve against their base here: an overlay that never
/// overrode the embedding is compared through the base's vector.
async fn fetch_semantic_candidates(
    pool: &SqlitePool,
    config: &Config,
    req: &SearchRequest,
    tenants: &[String],
    limit: i64,
) -> Result<Vec<(Candidate, f64)>> {
    let mut sql = String::from(
        "SELECT c.id AS id,
                COALESCE(c.title, b.title) AS title,
                COALESCE(c.summary, b.summary) AS summary,
                COALESCE(c.category, b.category) AS category,
                COALESCE(c.source_type, b.source_type) AS source_type,
                c.created_at AS created_at,
                COALESCE(c.embedding, b.embedding) AS embedding
         FROM corpus_units c
         LEFT JOIN corpus_units b ON b.id = c.base_id
         WHERE COALESCE(c.embedding, b.embedding) IS NOT NULL",
    );
    push_scope_filters(&mut sql, tenants, req);

    let mut query = sqlx::query(&sql);
    query = bind_scope_filters(query, tenants, req);
    let rows = query.fetch_all(pool).await?;

    let threshold = config.retrieval.semantic_threshold;
    let mut candidates: Vec<(Candidate, f64)> = Vec::new();

    for row in &rows {
        let blob: Vec<u8> = row.get("embedding");
        let stored = embedding::blob_to_vec(&blob);
        if stored.len() != req.query_embedding.len() {
            // Rows written under a different model dimensionality cannot
            // be compared; skip rather than fail the whole search.
            let unit_id: String = row.get("id");
            debug!(unit_id = %unit_id, "skipping unit with mismatched embedding dims");
            continue;
        }
        let score = embedding::cosine_similarity(&req.query_embedding, &stored) as f64;
        if score >= threshold {
            candidates.push((candidate_from_row(row), score));
        }
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(limit as usize);
    Ok(candidates)
}

// ============ Keyword candidates ============

/// FTS5 matches over title+summary text, with the bm25 rank min-max
/// normalized into `[0, 1]`, best first, capped at `limit`.
async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    req: &SearchRequest,
    tenants: &[String],
    limit: i64,
) -> Result<Vec<(Candidate, f64)>> {
    let mut sql = String::from(
        "SELECT c.id AS id,
                COALESCE(c.title, b.title) AS title,
                COALESCE(c.summary, b.summary) AS summary,
                COALESCE(c.category, b.category) AS category,
                COALESCE(c.source_type, b.source_type) AS source_type,
                c.created_at AS created_at, corpus_fts.rank AS rank
         FROM corpus_fts
         JOIN corpus_units c ON c.id = corpus_fts.unit_id
         LEFT JOIN corpus_units b ON b.id = c.base_id
         WHERE corpus_fts MATCH ?",
    );
    push_scope_filters(&mut sql, tenants, req);
    sql.push_str(" ORDER BY corpus_fts.rank LIMIT ?");

    let mut query = sqlx::query(&sql).bind(fts_match_expr(&req.query));
    query = bind_scope_filters(query, tenants, req);
    query = query.bind(limit);

    let rows = match query.fetch_all(pool).await {
        Ok(rows) => rows,
        // A query full of FTS operator characters is an empty keyword
        // set, not a failed search.
        Err(sqlx::Error::Database(e)) if e.message().contains("fts5") => {
            debug!(query = %req.query, "FTS rejected query syntax; keyword set empty");
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    // bm25 rank is negative (lower = better); negate so higher = better,
    // then min-max normalize to [0, 1].
    let raw: Vec<(Candidate, f64)> = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            (candidate_from_row(row), -rank)
        })
        .collect();

    Ok(normalize_scores(raw))
}

/// Quote each whitespace token so user queries cannot inject FTS5
/// operators, joined as an implicit AND.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Min-max normalize raw scores into [0, 1]. A single candidate (or all
/// equal scores) normalizes to 1.0.
fn normalize_scores(candidates: Vec<(Candidate, f64)>) -> Vec<(Candidate, f64)> {
    if candidates.is_empty() {
        return candidates;
    }

    let s_min = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .into_iter()
        .map(|(c, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

// ============ Merge ============

/// Full outer union of the two candidate sets keyed by unit id.
///
/// A unit in both sets keeps both scores; a unit in only one set gets
/// 0.0 for the other. When both sets carry a row for the same unit the
/// semantic-path metadata wins. Ordering: combined score descending,
/// then creation time descending, then id ascending.
fn merge_candidates(
    semantic: Vec<(Candidate, f64)>,
    keyword: Vec<(Candidate, f64)>,
    semantic_weight: f64,
    keyword_weight: f64,
) -> Vec<SearchHit> {
    let keyword_scores: HashMap<String, f64> = keyword
        .iter()
        .map(|(c, s)| (c.unit_id.clone(), *s))
        .collect();
    let semantic_ids: HashMap<String, ()> = semantic
        .iter()
        .map(|(c, _)| (c.unit_id.clone(), ()))
        .collect();

    let mut hits: Vec<SearchHit> = Vec::with_capacity(semantic.len() + keyword.len());

    for (candidate, semantic_score) in semantic {
        let keyword_score = keyword_scores
            .get(&candidate.unit_id)
            .copied()
            .unwrap_or(0.0);
        hits.push(make_hit(
            candidate,
            semantic_score,
            keyword_score,
            semantic_weight,
            keyword_weight,
        ));
    }

    for (candidate, keyword_score) in keyword {
        if semantic_ids.contains_key(&candidate.unit_id) {
            continue;
        }
        hits.push(make_hit(
            candidate,
            0.0,
            keyword_score,
            semantic_weight,
            keyword_weight,
        ));
    }

    hits.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
            .then(a.unit_id.cmp(&b.unit_id))
    });

    hits
}

fn make_hit(
    candidate: Candidate,
    semantic_score: f64,
    keyword_score: f64,
    semantic_weight: f64,
    keyword_weight: f64,
) -> SearchHit {
    SearchHit {
        unit_id: candidate.unit_id,
        title: candidate.title,
        summary: candidate.summary,
        category: candidate.category,
        source_type: candidate.source_type,
        semantic_score,
        keyword_score,
        combined_score: semantic_weight * semantic_score + keyword_weight * keyword_score,
        created_at: candidate.created_at,
    }
}

// ============ Shared filter plumbing ============

fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> Candidate {
    Candidate {
        unit_id: row.get("id"),
        title: row.get("title"),
        summary: row.get("summary"),
        category: row.get("category"),
        source_type: row.get("source_type"),
        created_at: row.get("created_at"),
    }
}

/// Both candidate queries alias the scoped row as `c` and its optional
/// base as `b`, so category/source filters match the merged value an
/// overlay actually presents.
fn push_scope_filters(sql: &mut String, tenants: &[String], req: &SearchRequest) {
    let placeholders = vec!["?"; tenants.len()].join(", ");
    sql.push_str(&format!(" AND c.tenant_id IN ({})", placeholders));
    if req.category.is_some() {
        sql.push_str(" AND COALESCE(c.category, b.category) = ?");
    }
    if req.source_type.is_some() {
        sql.push_str(" AND COALESCE(c.source_type, b.source_type) = ?");
    }
    if req.max_age_days.is_some() {
        sql.push_str(" AND c.created_at >= ?");
    }
}

fn bind_scope_filters<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    tenants: &'q [String],
    req: &'q SearchRequest,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for tenant in tenants {
        query = query.bind(tenant);
    }
    if let Some(category) = &req.category {
        query = query.bind(category);
    }
    if let Some(source_type) = &req.source_type {
        query = query.bind(source_type);
    }
    if let Some(days) = req.max_age_days {
        let cutoff = chrono::Utc::now().timestamp() - days * 86_400;
        query = query.bind(cutoff);
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, created_at: i64) -> Candidate {
        Candidate {
            unit_id: id.to_string(),
            title: Some(format!("title-{}", id)),
            summary: None,
            category: None,
            source_type: None,
            created_at,
        }
    }

    #[test]
    fn test_semantic_only_unit_scores_point_seven() {
        let hits = merge_candidates(vec![(candidate("a", 0), 0.8)], vec![], 0.7, 0.3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].keyword_score, 0.0);
        assert!((hits[0].combined_score - 0.7 * 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_only_unit_scores_point_three() {
        let hits = merge_candidates(vec![], vec![(candidate("a", 0), 0.6)], 0.7, 0.3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].semantic_score, 0.0);
        assert!((hits[0].combined_score - 0.3 * 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unit_in_both_sets_keeps_both_scores() {
        let hits = merge_candidates(
            vec![(candidate("a", 0), 0.8)],
            vec![(candidate("a", 0), 0.5)],
            0.7,
            0.3,
        );
        assert_eq!(hits.len(), 1);
        assert!((hits[0].semantic_score - 0.8).abs() < 1e-9);
        assert!((hits[0].keyword_score - 0.5).abs() < 1e-9);
        assert!((hits[0].combined_score - (0.7 * 0.8 + 0.3 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_blend_ranks_semantic_match_over_keyword_match() {
        // A 0.80 semantic-only hit must rank above a 0.6 keyword-only
        // hit: 0.56 vs 0.18.
        let hits = merge_candidates(
            vec![(candidate("semantic-hit", 0), 0.80)],
            vec![(candidate("keyword-hit", 0), 0.6)],
            0.7,
            0.3,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].unit_id, "semantic-hit");
        assert!((hits[0].combined_score - 0.56).abs() < 1e-9);
        assert!((hits[1].combined_score - 0.18).abs() < 1e-9);
    }

    #[test]
    fn test_combined_score_monotonic_in_each_component() {
        let base = merge_candidates(
            vec![(candidate("a", 0), 0.5)],
            vec![(candidate("a", 0), 0.5)],
            0.7,
            0.3,
        );
        let raised_semantic = merge_candidates(
            vec![(candidate("a", 0), 0.6)],
            vec![(candidate("a", 0), 0.5)],
            0.7,
            0.3,
        );
        let raised_keyword = merge_candidates(
            vec![(candidate("a", 0), 0.5)],
            vec![(candidate("a", 0), 0.6)],
            0.7,
            0.3,
        );
        assert!(raised_semantic[0].combined_score >= base[0].combined_score);
        assert!(raised_keyword[0].combined_score >= base[0].combined_score);
    }

    #[test]
    fn test_ties_break_on_created_at_then_id() {
        let hits = merge_candidates(
            vec![
                (candidate("older", 100), 0.5),
                (candidate("newer", 200), 0.5),
            ],
            vec![],
            0.7,
            0.3,
        );
        assert_eq!(hits[0].unit_id, "newer");
        assert_eq!(hits[1].unit_id, "older");

        let same_time = merge_candidates(
            vec![(candidate("b", 100), 0.5), (candidate("a", 100), 0.5)],
            vec![],
            0.7,
            0.3,
        );
        assert_eq!(same_time[0].unit_id, "a");
    }

    #[test]
    fn test_semantic_metadata_wins_on_conflict() {
        let mut semantic_row = candidate("a", 0);
        semantic_row.title = Some("semantic title".to_string());
        let mut keyword_row = candidate("a", 0);
        keyword_row.title = Some("keyword title".to_string());

        let hits = merge_candidates(vec![(semantic_row, 0.9)], vec![(keyword_row, 0.4)], 0.7, 0.3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title.as_deref(), Some("semantic title"));
    }

    #[test]
    fn test_normalize_scores_range_and_order() {
        let raw = vec![
            (candidate("best", 0), 12.0),
            (candidate("mid", 0), 6.0),
            (candidate("worst", 0), 0.0),
        ];
        let normalized = normalize_scores(raw);
        assert!((normalized[0].1 - 1.0).abs() < 1e-9);
        assert!((normalized[1].1 - 0.5).abs() < 1e-9);
        assert!((normalized[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_single_candidate_is_one() {
        let normalized = normalize_scores(vec![(candidate("only", 0), -3.2)]);
        assert!((normalized[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fts_match_expr_quotes_tokens() {
        assert_eq!(fts_match_expr("forest subsidies"), "\"forest\" \"subsidies\"");
        assert_eq!(fts_match_expr("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_merge_empty_sets() {
        let hits = merge_candidates(vec![], vec![], 0.7, 0.3);
        assert!(hits.is_empty());
    }
}
