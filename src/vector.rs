//! In-memory exact k-nearest-neighbor index over unit vectors.
//!
//! One normalized vector per chunk; similarity is a dot product mapped from
//! [-1, 1] onto [0, 1] so it can be fused with lexical scores. Inserts are
//! incremental and removal by document id supports cascade deletes. Vectors
//! persist as BLOBs in SQLite and the index is rebuilt from them at startup.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::embedding::dot;

/// A scored dense match. `similarity` is already rescaled to [0, 1].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub similarity: f64,
}

struct VectorEntry {
    chunk_id: String,
    document_id: String,
    vector: Vec<f32>,
    removed: bool,
}

pub struct VectorIndex {
    entries: RwLock<Vec<VectorEntry>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Insert one chunk's vector. The caller guarantees unit length.
    pub fn insert(&self, chunk_id: &str, document_id: &str, vector: Vec<f32>) {
        let mut entries = self.entries.write().unwrap();
        entries.push(VectorEntry {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            vector,
            removed: false,
        });
    }

    pub fn remove_document(&self, document_id: &str) {
        let mut entries = self.entries.write().unwrap();
        for entry in entries.iter_mut() {
            if entry.document_id == document_id {
                entry.removed = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().iter().filter(|e| !e.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact top-k by dot product. `allowed_docs`, when present, is a hard
    /// pre-filter applied before scoring.
    pub fn search(
        &self,
        query_vec: &[f32],
        limit: usize,
        allowed_docs: Option<&HashSet<String>>,
    ) -> Vec<VectorHit> {
        let entries = self.entries.read().unwrap();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|e| !e.removed)
            .filter(|e| {
                allowed_docs
                    .map(|allowed| allowed.contains(&e.document_id))
                    .unwrap_or(true)
            })
            .map(|e| {
                let sim = dot(query_vec, &e.vector) as f64;
                VectorHit {
                    chunk_id: e.chunk_id.clone(),
                    document_id: e.document_id.clone(),
                    similarity: rescale(sim),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        hits
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Map cosine similarity from [-1, 1] to [0, 1], clamping float drift.
fn rescale(similarity: f64) -> f64 {
    ((similarity + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        normalize(&mut v);
        v
    }

    #[test]
    fn test_nearest_neighbor_order() {
        let index = VectorIndex::new();
        index.insert("c1", "d1", unit(vec![1.0, 0.0, 0.0]));
        index.insert("c2", "d1", unit(vec![0.9, 0.1, 0.0]));
        index.insert("c3", "d2", unit(vec![0.0, 1.0, 0.0]));

        let hits = index.search(&unit(vec![1.0, 0.0, 0.0]), 3, None);
        assert_eq!(hits[0].chunk_id, "c1");
        assert_eq!(hits[1].chunk_id, "c2");
        assert_eq!(hits[2].chunk_id, "c3");
    }

    #[test]
    fn test_similarity_in_unit_interval() {
        let index = VectorIndex::new();
        index.insert("c1", "d1", unit(vec![1.0, 0.0]));
        index.insert("c2", "d1", unit(vec![-1.0, 0.0]));

        let hits = index.search(&unit(vec![1.0, 0.0]), 2, None);
        for h in &hits {
            assert!((0.0..=1.0).contains(&h.similarity), "{}", h.similarity);
        }
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!(hits[1].similarity.abs() < 1e-6);
    }

    #[test]
    fn test_remove_document() {
        let index = VectorIndex::new();
        index.insert("c1", "d1", unit(vec![1.0, 0.0]));
        index.insert("c2", "d2", unit(vec![1.0, 0.0]));
        index.remove_document("d1");

        let hits = index.search(&unit(vec![1.0, 0.0]), 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_allowed_docs_prefilter() {
        let index = VectorIndex::new();
        index.insert("c1", "d1", unit(vec![1.0, 0.0]));
        index.insert("c2", "d2", unit(vec![1.0, 0.0]));

        let allowed: HashSet<String> = ["d2".to_string()].into_iter().collect();
        let hits = index.search(&unit(vec![1.0, 0.0]), 10, Some(&allowed));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
    }

    #[test]
    fn test_tie_breaks_by_chunk_id() {
        let index = VectorIndex::new();
        index.insert("cb", "d1", unit(vec![1.0, 0.0]));
        index.insert("ca", "d2", unit(vec![1.0, 0.0]));

        let hits = index.search(&unit(vec![1.0, 0.0]), 2, None);
        assert_eq!(hits[0].chunk_id, "ca");
    }
}
