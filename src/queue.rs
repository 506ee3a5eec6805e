//! Background ingestion queue.
//!
//! Documents are accepted at upload time (hash check, document row, job row)
//! and processed by a bounded worker pool: extract, chunk, embed in batches,
//! commit chunk by chunk. Each committed chunk becomes searchable
//! immediately, so a long document surfaces in results before its job
//! completes. Two lanes exist: a standard lane with `worker_count` workers
//! and a dedicated single-worker lane for oversized uploads with an extended
//! timeout.
//!
//! Job transitions are queued -> processing -> completed | failed, mirrored
//! to the jobs table so `GET /upload-status` survives restarts.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::chunk::chunk_document;
use crate::config::{ChunkingConfig, QueueConfig};
use crate::embedding::EmbeddingProvider;
use crate::lexical::LexicalIndex;
use crate::models::{Chunk, DocumentStatus, JobSnapshot, JobStatus};
use crate::stats::EngineStats;
use crate::store::{DocumentStore, PersistedJob};
use crate::vector::VectorIndex;

/// Which worker pool a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Standard,
    Large,
}

/// Work item carried through a lane channel. Text is extracted at accept
/// time so the upload response can report character and chunk counts and
/// reject unreadable files synchronously.
struct IngestJob {
    document_id: String,
    filename: String,
    content_hash: String,
    text: String,
    lane: Lane,
}

/// Progress event pushed to subscribers as a job advances.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub document_id: String,
    pub status: JobStatus,
    pub current_chunk: i64,
    pub total_chunks: i64,
}

/// In-memory state of one job, source of `JobSnapshot`s.
struct JobState {
    filename: String,
    status: JobStatus,
    current_chunk: i64,
    total_chunks: i64,
    started_at: Option<Instant>,
    error: Option<String>,
}

/// Everything a worker needs to run the ingest pipeline for one document.
pub struct Pipeline {
    pub store: Arc<DocumentStore>,
    pub lexical: Arc<LexicalIndex>,
    pub vector: Arc<VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chunking: ChunkingConfig,
    pub embed_batch_size: usize,
    pub stats: Arc<EngineStats>,
}

struct Registry {
    jobs: HashMap<String, JobState>,
    /// Content hashes queued or processing right now; blocks duplicate
    /// submissions that the persisted hash check cannot see yet.
    in_flight: HashSet<String>,
    /// Oldest finished jobs are evicted past the retention cap.
    finished: VecDeque<String>,
}

pub struct IngestionQueue {
    registry: Arc<RwLock<Registry>>,
    pipeline: Arc<Pipeline>,
    standard_tx: mpsc::Sender<IngestJob>,
    large_tx: mpsc::Sender<IngestJob>,
    events: broadcast::Sender<JobEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionQueue {
    /// Spawn the worker pools and return the queue handle.
    pub fn start(pipeline: Pipeline, config: &QueueConfig) -> Self {
        let (standard_tx, standard_rx) = mpsc::channel::<IngestJob>(config.capacity);
        let (large_tx, large_rx) = mpsc::channel::<IngestJob>(config.capacity);
        let (events, _) = broadcast::channel(256);

        let registry = Arc::new(RwLock::new(Registry {
            jobs: HashMap::new(),
            in_flight: HashSet::new(),
            finished: VecDeque::new(),
        }));
        let pipeline = Arc::new(pipeline);

        let mut workers = Vec::new();
        let standard_rx = Arc::new(tokio::sync::Mutex::new(standard_rx));
        for worker_id in 0..config.worker_count.max(1) {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&standard_rx),
                Arc::clone(&registry),
                Arc::clone(&pipeline),
                events.clone(),
                config.job_timeout_secs,
                config.finished_retention,
            )));
        }
        // One dedicated worker keeps oversized documents from starving the
        // standard lane.
        let large_rx = Arc::new(tokio::sync::Mutex::new(large_rx));
        workers.push(tokio::spawn(worker_loop(
            config.worker_count,
            large_rx,
            Arc::clone(&registry),
            Arc::clone(&pipeline),
            events.clone(),
            config.large_timeout_secs,
            config.finished_retention,
        )));

        Self {
            registry,
            pipeline,
            standard_tx,
            large_tx,
            events,
            workers,
        }
    }

    /// Register and enqueue a new document. The document row must already be
    /// persisted with status `pending`. Fails when the lane buffer is full or
    /// the same content is already in flight.
    pub async fn enqueue(
        &self,
        document_id: &str,
        filename: &str,
        content_hash: &str,
        text: String,
        lane: Lane,
    ) -> Result<()> {
        {
            let mut registry = self.registry.write().unwrap();
            if registry.in_flight.contains(content_hash) {
                return Err(anyhow!("identical content is already being processed"));
            }
            registry.in_flight.insert(content_hash.to_string());
            registry.jobs.insert(
                document_id.to_string(),
                JobState {
                    filename: filename.to_string(),
                    status: JobStatus::Queued,
                    current_chunk: 0,
                    total_chunks: 0,
                    started_at: None,
                    error: None,
                },
            );
        }

        self.pipeline
            .store
            .upsert_job(document_id, JobStatus::Queued, 0, 0, None)
            .await?;
        self.pipeline.stats.job_queued();
        let _ = self.events.send(JobEvent {
            document_id: document_id.to_string(),
            status: JobStatus::Queued,
            current_chunk: 0,
            total_chunks: 0,
        });

        let job = IngestJob {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            content_hash: content_hash.to_string(),
            text,
            lane,
        };
        let tx = match lane {
            Lane::Standard => &self.standard_tx,
            Lane::Large => &self.large_tx,
        };
        if let Err(e) = tx.try_send(job) {
            let mut registry = self.registry.write().unwrap();
            registry.in_flight.remove(content_hash);
            registry.jobs.remove(document_id);
            return Err(anyhow!("ingestion queue is full: {}", e));
        }
        Ok(())
    }

    /// Seed the registry with job rows persisted before a restart so
    /// `snapshots()` keeps reporting recent history. The caller has already
    /// re-marked interrupted rows as failed; everything arriving here is
    /// terminal.
    pub fn restore(&self, jobs: Vec<PersistedJob>) {
        let mut registry = self.registry.write().unwrap();
        for job in jobs {
            registry.finished.push_back(job.document_id.clone());
            registry.jobs.insert(
                job.document_id,
                JobState {
                    filename: job.filename,
                    status: job.status,
                    current_chunk: job.current_chunk,
                    total_chunks: job.total_chunks,
                    started_at: None,
                    error: job.error,
                },
            );
        }
    }

    /// Snapshot every tracked job, in-flight first, then recent finished.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let registry = self.registry.read().unwrap();
        let mut out: Vec<JobSnapshot> = registry
            .jobs
            .iter()
            .map(|(id, state)| snapshot_of(id, state))
            .collect();
        out.sort_by(|a, b| {
            let rank = |s: JobStatus| match s {
                JobStatus::Processing => 0,
                JobStatus::Queued => 1,
                JobStatus::Completed => 2,
                JobStatus::Failed => 3,
            };
            rank(a.status)
                .cmp(&rank(b.status))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// True when no job is queued or processing.
    pub fn is_idle(&self) -> bool {
        let registry = self.registry.read().unwrap();
        registry
            .jobs
            .values()
            .all(|state| state.status.is_terminal())
    }

}

impl Drop for IngestionQueue {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

fn snapshot_of(document_id: &str, state: &JobState) -> JobSnapshot {
    let progress_percent = if state.total_chunks > 0 {
        (state.current_chunk as f64 / state.total_chunks as f64) * 100.0
    } else if state.status == JobStatus::Completed {
        100.0
    } else {
        0.0
    };
    // remaining = (elapsed / done) * (total - done)
    let estimated_time_seconds = match (state.started_at, state.status) {
        (Some(started), JobStatus::Processing) if state.current_chunk > 0 => {
            let elapsed = started.elapsed().as_secs_f64();
            let remaining = (state.total_chunks - state.current_chunk).max(0) as f64;
            Some(elapsed / state.current_chunk as f64 * remaining)
        }
        _ => None,
    };
    JobSnapshot {
        document_id: document_id.to_string(),
        filename: state.filename.clone(),
        status: state.status,
        progress_percent,
        current_chunk: state.current_chunk,
        total_chunks: state.total_chunks,
        estimated_time_seconds,
        error: state.error.clone(),
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestJob>>>,
    registry: Arc<RwLock<Registry>>,
    pipeline: Arc<Pipeline>,
    events: broadcast::Sender<JobEvent>,
    timeout_secs: u64,
    finished_retention: usize,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else {
            // Channel closed: queue dropped, worker exits.
            return;
        };
        let document_id = job.document_id.clone();
        let content_hash = job.content_hash.clone();
        tracing::debug!(worker_id, document_id = %document_id, filename = %job.filename, lane = ?job.lane, "job picked up");

        mark_started(&registry, &pipeline, &events, &document_id).await;

        let committed = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            process_document(&pipeline, &registry, &events, job, Arc::clone(&committed)),
        )
        .await;

        let outcome = match result {
            Ok(Ok(total)) => Ok(total),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow!("processing timed out after {}s", timeout_secs)),
        };

        match outcome {
            Ok(total_chunks) => {
                finish_job(
                    &registry,
                    &pipeline,
                    &events,
                    &document_id,
                    &content_hash,
                    JobStatus::Completed,
                    total_chunks,
                    None,
                    finished_retention,
                )
                .await;
                tracing::info!(document_id = %document_id, total_chunks, "document indexed");
            }
            Err(e) => {
                let done = committed.load(std::sync::atomic::Ordering::Relaxed);
                finish_job(
                    &registry,
                    &pipeline,
                    &events,
                    &document_id,
                    &content_hash,
                    JobStatus::Failed,
                    done,
                    Some(e.to_string()),
                    finished_retention,
                )
                .await;
                tracing::warn!(document_id = %document_id, committed = done, error = %e, "document processing failed");
            }
        }
    }
}

async fn mark_started(
    registry: &Arc<RwLock<Registry>>,
    pipeline: &Arc<Pipeline>,
    events: &broadcast::Sender<JobEvent>,
    document_id: &str,
) {
    {
        let mut guard = registry.write().unwrap();
        if let Some(state) = guard.jobs.get_mut(document_id) {
            state.status = JobStatus::Processing;
            state.started_at = Some(Instant::now());
        }
    }
    pipeline.stats.job_started();
    if let Err(e) = pipeline
        .store
        .upsert_job(document_id, JobStatus::Processing, 0, 0, None)
        .await
    {
        tracing::error!(document_id, error = %e, "failed to persist job start");
    }
    let _ = events.send(JobEvent {
        document_id: document_id.to_string(),
        status: JobStatus::Processing,
        current_chunk: 0,
        total_chunks: 0,
    });
}

/// The ingest pipeline for one document. Returns the total chunk count on
/// success. `committed` tracks chunks that made it into the store and both
/// indexes, so a failure partway can be reported accurately.
async fn process_document(
    pipeline: &Arc<Pipeline>,
    registry: &Arc<RwLock<Registry>>,
    events: &broadcast::Sender<JobEvent>,
    job: IngestJob,
    committed: Arc<std::sync::atomic::AtomicI64>,
) -> Result<i64> {
    let chunks: Vec<Chunk> = chunk_document(&job.document_id, &job.text, &pipeline.chunking);
    if chunks.is_empty() {
        anyhow::bail!("no extractable text content");
    }
    let total = chunks.len() as i64;

    {
        let mut guard = registry.write().unwrap();
        if let Some(state) = guard.jobs.get_mut(&job.document_id) {
            state.total_chunks = total;
        }
    }
    pipeline
        .store
        .set_document_status(&job.document_id, DocumentStatus::Indexing, total)
        .await?;

    let batch_size = pipeline.embed_batch_size.max(1);
    let model = pipeline.embedder.model_name().to_string();

    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = pipeline.embedder.embed(&texts).await?;
        if vectors.len() != batch.len() {
            anyhow::bail!(
                "embedding backend returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            );
        }

        for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
            // Persist first, then publish to the indexes. A chunk is
            // searchable the moment both index inserts return.
            pipeline.store.commit_chunk(chunk, &vector, &model).await?;
            pipeline
                .lexical
                .add_chunk(&chunk.id, &chunk.document_id, &chunk.text);
            pipeline.vector.insert(&chunk.id, &chunk.document_id, vector);
            pipeline.stats.chunk_committed();

            let done = committed.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            {
                let mut guard = registry.write().unwrap();
                if let Some(state) = guard.jobs.get_mut(&job.document_id) {
                    state.current_chunk = done;
                }
            }
            let _ = events.send(JobEvent {
                document_id: job.document_id.clone(),
                status: JobStatus::Processing,
                current_chunk: done,
                total_chunks: total,
            });
        }

        // Persist progress per batch, not per chunk.
        let done = committed.load(std::sync::atomic::Ordering::Relaxed);
        if let Err(e) = pipeline
            .store
            .upsert_job(&job.document_id, JobStatus::Processing, done, total, None)
            .await
        {
            tracing::error!(document_id = %job.document_id, error = %e, "failed to persist job progress");
        }
    }

    pipeline
        .store
        .set_document_status(&job.document_id, DocumentStatus::Indexed, total)
        .await?;
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn finish_job(
    registry: &Arc<RwLock<Registry>>,
    pipeline: &Arc<Pipeline>,
    events: &broadcast::Sender<JobEvent>,
    document_id: &str,
    content_hash: &str,
    status: JobStatus,
    current_chunk: i64,
    error: Option<String>,
    finished_retention: usize,
) {
    let total_chunks = {
        let guard = registry.read().unwrap();
        guard
            .jobs
            .get(document_id)
            .map(|state| state.total_chunks.max(current_chunk))
            .unwrap_or(current_chunk)
    };

    // Rows are persisted before the registry flips to terminal: once the
    // queue reports idle, a restart rehydrates exactly this state.
    if status == JobStatus::Failed {
        // Committed chunks stay searchable; the document is marked partial.
        if let Err(e) = pipeline
            .store
            .set_document_status(document_id, DocumentStatus::Partial, total_chunks)
            .await
        {
            tracing::error!(document_id, error = %e, "failed to mark document partial");
        }
    }
    if let Err(e) = pipeline
        .store
        .upsert_job(
            document_id,
            status,
            current_chunk,
            total_chunks,
            error.as_deref(),
        )
        .await
    {
        tracing::error!(document_id, error = %e, "failed to persist job finish");
    }

    {
        let mut guard = registry.write().unwrap();
        guard.in_flight.remove(content_hash);
        if let Some(state) = guard.jobs.get_mut(document_id) {
            state.status = status;
            state.current_chunk = current_chunk;
            state.error = error.clone();
            state.total_chunks = total_chunks;
        }
        guard.finished.push_back(document_id.to_string());
        while guard.finished.len() > finished_retention {
            if let Some(evicted) = guard.finished.pop_front() {
                guard.jobs.remove(&evicted);
            }
        }
    }

    match status {
        JobStatus::Completed => pipeline.stats.job_completed(),
        JobStatus::Failed => pipeline.stats.job_failed(),
        _ => {}
    }

    let _ = events.send(JobEvent {
        document_id: document_id.to_string(),
        status,
        current_chunk,
        total_chunks,
    });
}
