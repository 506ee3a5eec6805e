//! Incremental BM25 inverted index over chunks.
//!
//! Postings map each term to `(slot, term frequency)` pairs; document
//! frequencies and the running average chunk length update as chunks are
//! added, so indexing a new chunk is O(its terms), never O(corpus). Reads
//! and writes share a `RwLock` whose write sections cover only the commit of
//! a single chunk, so searches run concurrently with ingestion.
//!
//! Scoring: `score(c) = Σ_t IDF(t) · tf·(k1+1) / (tf + k1·(1-b+b·|c|/avgdl))`
//! with `k1 = 1.2`, `b = 0.75`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::embedding::tokenize;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// A scored lexical match.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw BM25 score, unbounded above.
    pub score: f64,
}

struct Entry {
    chunk_id: String,
    document_id: String,
    length: usize,
    removed: bool,
}

#[derive(Default)]
struct Inner {
    /// term -> (entry slot, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    entries: Vec<Entry>,
    slots_by_document: HashMap<String, Vec<usize>>,
    total_length: usize,
    live_count: usize,
}

pub struct LexicalIndex {
    inner: RwLock<Inner>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Index one chunk. O(chunk terms).
    pub fn add_chunk(&self, chunk_id: &str, document_id: &str, text: &str) {
        let terms = tokenize(text);
        let mut freqs: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *freqs.entry(term.clone()).or_insert(0) += 1;
        }

        let mut inner = self.inner.write().unwrap();
        let slot = inner.entries.len();
        inner.entries.push(Entry {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            length: terms.len(),
            removed: false,
        });
        inner
            .slots_by_document
            .entry(document_id.to_string())
            .or_default()
            .push(slot);
        for (term, tf) in freqs {
            inner.postings.entry(term).or_default().push((slot, tf));
        }
        inner.total_length += terms.len();
        inner.live_count += 1;
    }

    /// Drop all postings of a document (cascade delete). Slots are
    /// tombstoned; postings skip them at query time.
    pub fn remove_document(&self, document_id: &str) {
        let mut inner = self.inner.write().unwrap();
        let slots = match inner.slots_by_document.remove(document_id) {
            Some(s) => s,
            None => return,
        };
        for slot in slots {
            let entry = &mut inner.entries[slot];
            if !entry.removed {
                entry.removed = true;
                let len = entry.length;
                inner.total_length -= len;
                inner.live_count -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().live_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// BM25 search over the live corpus. `allowed_docs`, when present, is a
    /// hard pre-filter: chunks of other documents are never scored.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        allowed_docs: Option<&HashSet<String>>,
    ) -> Vec<LexicalHit> {
        let query_terms: Vec<String> = {
            let mut seen = HashSet::new();
            tokenize(query)
                .into_iter()
                .filter(|t| seen.insert(t.clone()))
                .collect()
        };
        if query_terms.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read().unwrap();
        if inner.live_count == 0 {
            return Vec::new();
        }
        let n = inner.live_count as f64;
        let avgdl = (inner.total_length as f64 / n).max(1.0);

        let mut scores: HashMap<usize, f64> = HashMap::new();
        for term in &query_terms {
            let list = match inner.postings.get(term) {
                Some(l) => l,
                None => continue,
            };
            let df = list
                .iter()
                .filter(|(slot, _)| !inner.entries[*slot].removed)
                .count() as f64;
            if df == 0.0 {
                continue;
            }
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(slot, tf) in list {
                let entry = &inner.entries[slot];
                if entry.removed {
                    continue;
                }
                if let Some(allowed) = allowed_docs {
                    if !allowed.contains(&entry.document_id) {
                        continue;
                    }
                }
                let tf = tf as f64;
                let norm = entry.length as f64 / avgdl;
                let contribution = idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * norm));
                *scores.entry(slot).or_insert(0.0) += contribution;
            }
        }

        let mut hits: Vec<LexicalHit> = scores
            .into_iter()
            .map(|(slot, score)| {
                let entry = &inner.entries[slot];
                LexicalHit {
                    chunk_id: entry.chunk_id.clone(),
                    document_id: entry.document_id.clone(),
                    score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        hits
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_index(chunks: &[(&str, &str, &str)]) -> LexicalIndex {
        let index = LexicalIndex::new();
        for (chunk_id, doc_id, text) in chunks {
            index.add_chunk(chunk_id, doc_id, text);
        }
        index
    }

    #[test]
    fn test_exact_term_ranks_first() {
        let index = build_index(&[
            ("c1", "d1", "metformin is indicated for type two diabetes"),
            ("c2", "d1", "lisinopril treats hypertension in adults"),
            ("c3", "d2", "general wellness advice for all patients"),
        ]);
        let hits = index.search("metformin diabetes", 10, None);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn test_rare_term_outweighs_common() {
        let index = build_index(&[
            ("c1", "d1", "patient patient patient treatment"),
            ("c2", "d2", "warfarin interaction with patient treatment"),
            ("c3", "d3", "patient follow up scheduled treatment"),
        ]);
        let hits = index.search("warfarin", 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[test]
    fn test_no_match_empty() {
        let index = build_index(&[("c1", "d1", "aspirin for cardiac prophylaxis")]);
        assert!(index.search("zebra", 10, None).is_empty());
        assert!(index.search("", 10, None).is_empty());
    }

    #[test]
    fn test_incremental_add_visible() {
        let index = build_index(&[("c1", "d1", "first text about insulin")]);
        assert!(index.search("statins", 10, None).is_empty());
        index.add_chunk("c2", "d2", "statins reduce cholesterol");
        let hits = index.search("statins", 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");
    }

    #[test]
    fn test_remove_document_tombstones() {
        let index = build_index(&[
            ("c1", "d1", "anticoagulant therapy overview"),
            ("c2", "d2", "anticoagulant dosing chart"),
        ]);
        index.remove_document("d1");
        let hits = index.search("anticoagulant", 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_allowed_docs_prefilter() {
        let index = build_index(&[
            ("c1", "d1", "sepsis management bundle"),
            ("c2", "d2", "sepsis antibiotic timing"),
        ]);
        let allowed: HashSet<String> = ["d2".to_string()].into_iter().collect();
        let hits = index.search("sepsis", 10, Some(&allowed));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
    }

    #[test]
    fn test_deterministic_tie_order() {
        let index = build_index(&[
            ("cb", "d1", "identical text here"),
            ("ca", "d2", "identical text here"),
        ]);
        let hits = index.search("identical text", 10, None);
        assert_eq!(hits.len(), 2);
        // Equal scores break by chunk id.
        assert_eq!(hits[0].chunk_id, "ca");
    }
}
