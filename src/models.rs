//! Core data models for the knowledge base engine.
//!
//! These types represent the documents, chunks, processing jobs, and search
//! results that flow through the ingestion and retrieval pipeline. The
//! Document Store is the single owner of persisted state; everything here
//! that reaches the HTTP surface derives `Serialize`.

use serde::{Deserialize, Serialize};

/// Lifecycle of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Accepted, no chunk committed yet.
    Pending,
    /// Chunks are being committed; some may already be searchable.
    Indexing,
    /// Every chunk has both a vector and a lexical entry.
    Indexed,
    /// Processing failed partway; committed chunks remain searchable.
    Partial,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Indexing => "indexing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> DocumentStatus {
        match s {
            "indexing" => DocumentStatus::Indexing,
            "indexed" => DocumentStatus::Indexed,
            "partial" => DocumentStatus::Partial,
            _ => DocumentStatus::Pending,
        }
    }
}

/// A source document persisted in SQLite.
///
/// `content_hash` is the SHA-256 of the uploaded bytes and is UNIQUE:
/// re-uploading identical bytes is detected and reported as skipped.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content_hash: String,
    pub filename: String,
    pub category: Option<String>,
    pub section: Option<String>,
    pub year: Option<i64>,
    pub byte_size: i64,
    pub status: DocumentStatus,
    pub total_chunks: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A chunk of a document's extracted text.
///
/// Chunk indices are contiguous `0..N-1` within a document. A chunk is
/// searchable only after it has been committed to both the lexical and the
/// vector index.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub section_label: Option<String>,
}

/// Processing state of an in-flight document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Snapshot of one ProcessingJob, as returned by `GET /upload-status`.
///
/// `current_chunk` is non-decreasing over a job's lifetime and equals
/// `total_chunks` iff the job completed.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub document_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub current_chunk: i64,
    pub total_chunks: i64,
    /// `(elapsed / current_chunk) * (total_chunks - current_chunk)`.
    pub estimated_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Normalized pointer from a retrieved chunk back to its source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    pub chunk_index: i64,
}

/// A ranked search result. One shape, required fields; downstream consumers
/// never need field-presence checks.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    /// Combined hybrid score in `[0, 1]`.
    pub score: f64,
    /// Normalized dense-similarity component.
    pub dense_score: f64,
    /// Normalized lexical (BM25) component.
    pub lexical_score: f64,
    pub text: String,
    pub citation: Citation,
}

/// Hard metadata pre-filters applied before scoring.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub section: Option<String>,
    pub min_year: Option<i64>,
    /// When false (default), chunks below `min_year` are excluded outright
    /// rather than penalized.
    #[serde(default)]
    pub allow_outdated: bool,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.section.is_none() && self.min_year.is_none()
    }
}

/// Per-file outcome of a batch upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    /// `success`, `skipped`, or `error`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characters: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UploadOutcome {
    pub fn success(filename: &str, document_id: &str, chunks: i64, characters: i64) -> Self {
        Self {
            filename: filename.to_string(),
            status: "success".to_string(),
            document_id: Some(document_id.to_string()),
            chunks: Some(chunks),
            characters: Some(characters),
            reason: None,
        }
    }

    pub fn skipped(filename: &str, document_id: &str) -> Self {
        Self {
            filename: filename.to_string(),
            status: "skipped".to_string(),
            document_id: Some(document_id.to_string()),
            chunks: None,
            characters: None,
            reason: Some("duplicate content".to_string()),
        }
    }

    pub fn error(filename: &str, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.to_string(),
            status: "error".to_string(),
            document_id: None,
            chunks: None,
            characters: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Indexing,
            DocumentStatus::Indexed,
            DocumentStatus::Partial,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_upload_outcome_shapes() {
        let ok = UploadOutcome::success("a.txt", "doc1", 3, 1200);
        assert_eq!(ok.status, "success");
        assert_eq!(ok.chunks, Some(3));

        let skip = UploadOutcome::skipped("a.txt", "doc1");
        assert_eq!(skip.status, "skipped");
        assert!(skip.reason.as_deref().unwrap().contains("duplicate"));

        let err = UploadOutcome::error("b.txt", "extraction failed");
        assert_eq!(err.status, "error");
        assert!(err.document_id.is_none());
    }
}
