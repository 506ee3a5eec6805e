//! Incrementally maintained aggregate statistics.
//!
//! Counters are plain atomics updated by the ingestion queue as jobs move
//! through their state machine, so `GET /statistics` never scans the store.
//! They are seeded from SQLite once at startup.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    total_documents: AtomicI64,
    total_chunks: AtomicI64,
    jobs_queued: AtomicI64,
    jobs_processing: AtomicI64,
    jobs_completed: AtomicI64,
    jobs_failed: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub search_mode: String,
    pub knowledge_level: String,
    pub processing_queue: QueueCounts,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed document/chunk totals from persisted state at startup.
    pub fn seed(&self, documents: i64, chunks: i64) {
        self.total_documents.store(documents, Ordering::Relaxed);
        self.total_chunks.store(chunks, Ordering::Relaxed);
    }

    /// Seed terminal job counts from rows rehydrated at startup.
    pub fn seed_jobs(&self, completed: i64, failed: i64) {
        self.jobs_completed.store(completed, Ordering::Relaxed);
        self.jobs_failed.store(failed, Ordering::Relaxed);
    }

    pub fn document_added(&self) {
        self.total_documents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn document_removed(&self, chunks: i64) {
        self.total_documents.fetch_sub(1, Ordering::Relaxed);
        self.total_chunks.fetch_sub(chunks, Ordering::Relaxed);
    }

    pub fn chunk_committed(&self) {
        self.total_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_queued(&self) {
        self.jobs_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_queued.fetch_sub(1, Ordering::Relaxed);
        self.jobs_processing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_processing.fetch_sub(1, Ordering::Relaxed);
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_processing.fetch_sub(1, Ordering::Relaxed);
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, search_mode: &str) -> StatsSnapshot {
        let documents = self.total_documents.load(Ordering::Relaxed);
        let queued = self.jobs_queued.load(Ordering::Relaxed);
        let processing = self.jobs_processing.load(Ordering::Relaxed);
        let completed = self.jobs_completed.load(Ordering::Relaxed);
        let failed = self.jobs_failed.load(Ordering::Relaxed);

        StatsSnapshot {
            total_documents: documents,
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            search_mode: search_mode.to_string(),
            knowledge_level: knowledge_level(documents).to_string(),
            processing_queue: QueueCounts {
                queued,
                processing,
                completed,
                failed,
                total: queued + processing + completed + failed,
            },
        }
    }
}

/// Coarse corpus-size label surfaced to the UI.
fn knowledge_level(documents: i64) -> &'static str {
    match documents {
        0 => "empty",
        1..=9 => "building",
        10..=49 => "moderate",
        _ => "comprehensive",
    }
}
