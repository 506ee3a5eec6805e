//! Hybrid retriever: dense and lexical candidates fused with a tunable
//! alpha weight.
//!
//! Each index contributes up to `candidate_factor * top_k` candidates. Both
//! score lists are min-max normalized over the candidate set, then combined
//! as `alpha * dense + (1 - alpha) * lexical`. A chunk present in only one
//! list scores zero on the other channel. Ties break by publication year
//! (more recent first), then document id, then chunk id, so rankings are
//! reproducible.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::lexical::LexicalIndex;
use crate::models::{Citation, SearchFilters, SearchResult};
use crate::store::DocumentStore;
use crate::vector::VectorIndex;

/// How retrieval channels are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Dense + lexical fusion (default).
    Hybrid,
    /// Local indexes only; identical retrieval, but the remote fallback is
    /// never consulted.
    Local,
    /// Local retrieval first, remote fallback permitted when the local
    /// result set is too thin.
    Openai,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "hybrid" => Some(SearchMode::Hybrid),
            "local" => Some(SearchMode::Local),
            "openai" => Some(SearchMode::Openai),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Local => "local",
            SearchMode::Openai => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f64,
    pub alpha: f64,
    pub mode: SearchMode,
    pub filters: SearchFilters,
    /// Retry with relaxed filters when the filtered search comes back empty.
    pub allow_fallback: bool,
}

pub struct Retriever {
    store: Arc<DocumentStore>,
    lexical: Arc<LexicalIndex>,
    vector: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<DocumentStore>,
        lexical: Arc<LexicalIndex>,
        vector: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            lexical,
            vector,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Ranked retrieval. Applies hard metadata pre-filters, fuses both
    /// channels, drops results under `min_score`, and truncates to `top_k`.
    /// When filters exclude everything and `allow_fallback` is set, retries
    /// once with the year bound dropped, then once more with category and
    /// section dropped as well.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            bail!("query must not be empty");
        }
        if !(0.0..=1.0).contains(&opts.alpha) {
            bail!("alpha must be in [0.0, 1.0]");
        }
        if opts.top_k == 0 {
            bail!("top_k must be >= 1");
        }

        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding backend returned no vector for query"))?;

        let results = self
            .search_filtered(query, &query_vec, opts, &opts.filters)
            .await?;
        if !results.is_empty() || !opts.allow_fallback {
            return Ok(results);
        }

        // Relaxation ladder: widen the year bound first, then drop the
        // category and section constraints.
        let mut relaxed = opts.filters.clone();
        if relaxed.min_year.is_some() {
            relaxed.min_year = None;
            tracing::debug!(query, "no results; retrying without year bound");
            let results = self
                .search_filtered(query, &query_vec, opts, &relaxed)
                .await?;
            if !results.is_empty() {
                return Ok(results);
            }
        }
        if relaxed.category.is_some() || relaxed.section.is_some() {
            relaxed.category = None;
            relaxed.section = None;
            tracing::debug!(query, "no results; retrying without metadata filters");
            return self.search_filtered(query, &query_vec, opts, &relaxed).await;
        }
        Ok(Vec::new())
    }

    async fn search_filtered(
        &self,
        query: &str,
        query_vec: &[f32],
        opts: &SearchOptions,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let allowed = self.store.filtered_document_ids(filters).await?;
        if let Some(ref ids) = allowed {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
        }

        let candidates = self.config.candidate_factor.max(1) * opts.top_k;
        let lexical_hits = self.lexical.search(query, candidates, allowed.as_ref());
        let vector_hits = self.vector.search(query_vec, candidates, allowed.as_ref());

        let lexical_norm = min_max_normalize(
            lexical_hits
                .iter()
                .map(|h| (h.chunk_id.clone(), h.score))
                .collect(),
        );
        let dense_norm = min_max_normalize(
            vector_hits
                .iter()
                .map(|h| (h.chunk_id.clone(), h.similarity))
                .collect(),
        );

        // Union of both shortlists keeps chunks strong on one channel only.
        let mut fused: HashMap<String, (f64, f64)> = HashMap::new();
        for (chunk_id, score) in &lexical_norm {
            fused.entry(chunk_id.clone()).or_insert((0.0, 0.0)).1 = *score;
        }
        for (chunk_id, score) in &dense_norm {
            fused.entry(chunk_id.clone()).or_insert((0.0, 0.0)).0 = *score;
        }

        let chunk_ids: Vec<String> = fused.keys().cloned().collect();
        let details = self.store.chunk_details(&chunk_ids).await?;
        let meta = self.store.all_document_meta().await?;

        let mut results: Vec<SearchResult> = Vec::with_capacity(fused.len());
        for (chunk_id, (dense, lexical)) in fused {
            let Some(detail) = details.get(&chunk_id) else {
                // Index entry without a store row: deleted mid-query.
                continue;
            };
            let Some(doc) = meta.get(&detail.document_id) else {
                continue;
            };
            let score = opts.alpha * dense + (1.0 - opts.alpha) * lexical;
            if score < opts.min_score {
                continue;
            }
            results.push(SearchResult {
                chunk_id,
                score,
                dense_score: dense,
                lexical_score: lexical,
                text: detail.text.clone(),
                citation: Citation {
                    document_id: doc.id.clone(),
                    filename: doc.filename.clone(),
                    section: detail
                        .section_label
                        .clone()
                        .or_else(|| doc.section.clone()),
                    category: doc.category.clone(),
                    year: doc.year,
                    chunk_index: detail.chunk_index,
                },
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.citation.year.cmp(&a.citation.year))
                .then_with(|| a.citation.document_id.cmp(&b.citation.document_id))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(opts.top_k);
        Ok(results)
    }
}

/// Min-max normalize one candidate list to [0, 1]. A single candidate (or a
/// flat list) maps to 1.0 when its raw score is positive, 0.0 otherwise.
fn min_max_normalize(scored: Vec<(String, f64)>) -> Vec<(String, f64)> {
    if scored.is_empty() {
        return scored;
    }
    let min = scored.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = scored
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    scored
        .into_iter()
        .map(|(id, s)| {
            let normalized = if range > f64::EPSILON {
                (s - min) / range
            } else if s > 0.0 {
                1.0
            } else {
                0.0
            };
            (id, normalized)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("local"), Some(SearchMode::Local));
        assert_eq!(SearchMode::parse("openai"), Some(SearchMode::Openai));
        assert_eq!(SearchMode::parse("remote"), None);
    }

    #[test]
    fn test_min_max_normalize_spreads_scores() {
        let out = min_max_normalize(vec![
            ("a".to_string(), 2.0),
            ("b".to_string(), 6.0),
            ("c".to_string(), 4.0),
        ]);
        let by_id: HashMap<_, _> = out.into_iter().collect();
        assert!((by_id["a"] - 0.0).abs() < 1e-9);
        assert!((by_id["b"] - 1.0).abs() < 1e-9);
        assert!((by_id["c"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_min_max_normalize_flat_list() {
        let out = min_max_normalize(vec![("a".to_string(), 3.0), ("b".to_string(), 3.0)]);
        assert!(out.iter().all(|(_, s)| (*s - 1.0).abs() < 1e-9));

        let out = min_max_normalize(vec![("a".to_string(), 0.0)]);
        assert!((out[0].1 - 0.0).abs() < 1e-9);
    }
}
