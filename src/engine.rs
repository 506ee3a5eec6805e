//! Composition root: wires the store, indexes, embedding provider, queue,
//! retriever, and verifier together and exposes the operations the HTTP
//! surface and the CLI call.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::answer::{self, SynthesizedAnswer};
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::extract_text;
use crate::lexical::LexicalIndex;
use crate::migrate;
use crate::models::{
    Document, DocumentStatus, JobSnapshot, JobStatus, SearchResult, UploadOutcome,
};
use crate::queue::{IngestionQueue, Lane, Pipeline};
use crate::search::{Retriever, SearchMode, SearchOptions};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::DocumentStore;
use crate::vector::VectorIndex;
use crate::verify::{VerificationReport, Verifier};

/// Per-batch metadata attached to every file in an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub category: Option<String>,
    pub section: Option<String>,
    pub year: Option<i64>,
}

/// A fully resolved search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub options: SearchOptions,
    pub synthesize_answer: bool,
    pub verify_answer: bool,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub answer: Option<SynthesizedAnswer>,
    pub verification: Option<VerificationReport>,
    pub fallback_used: bool,
}

pub struct Engine {
    pub config: Config,
    pub store: Arc<DocumentStore>,
    pub lexical: Arc<LexicalIndex>,
    pub vector: Arc<VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub retriever: Retriever,
    pub queue: IngestionQueue,
    pub verifier: Verifier,
    pub stats: Arc<EngineStats>,
    fallback_client: reqwest::Client,
}

impl Engine {
    /// Open the database, rebuild the indexes from persisted state, and
    /// spawn the ingestion workers.
    pub async fn new(config: Config) -> Result<Arc<Engine>> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let store = Arc::new(DocumentStore::new(pool));
        let lexical = Arc::new(LexicalIndex::new());
        let vector = Arc::new(VectorIndex::new());

        let restored = store.rebuild_indexes(&lexical, &vector).await?;
        if restored > 0 {
            tracing::info!(chunks = restored, "indexes rebuilt from store");
        }

        let stats = Arc::new(EngineStats::new());
        stats.seed(store.count_documents().await?, store.count_chunks().await?);

        let embedder: Arc<dyn EmbeddingProvider> = create_provider(&config.embedding)?.into();

        let queue = IngestionQueue::start(
            Pipeline {
                store: Arc::clone(&store),
                lexical: Arc::clone(&lexical),
                vector: Arc::clone(&vector),
                embedder: Arc::clone(&embedder),
                chunking: config.chunking.clone(),
                embed_batch_size: config.embedding.batch_size,
                stats: Arc::clone(&stats),
            },
            &config.queue,
        );

        restore_jobs(&store, &queue, &stats).await?;

        let retriever = Retriever::new(
            Arc::clone(&store),
            Arc::clone(&lexical),
            Arc::clone(&vector),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        );
        let verifier = Verifier::new(&config.verifier);
        let fallback_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embedding.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Arc::new(Engine {
            config,
            store,
            lexical,
            vector,
            embedder,
            retriever,
            queue,
            verifier,
            stats,
            fallback_client,
        }))
    }

    /// Accept one uploaded file: hash, duplicate check, extraction, document
    /// row, enqueue. Extraction and chunk-boundary errors are reported in
    /// the per-file outcome instead of failing the batch.
    pub async fn ingest_file(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        meta: &UploadMeta,
    ) -> UploadOutcome {
        match self.try_ingest(filename, bytes, meta).await {
            Ok(outcome) => outcome,
            Err(e) => UploadOutcome::error(filename, e.to_string()),
        }
    }

    async fn try_ingest(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        meta: &UploadMeta,
    ) -> Result<UploadOutcome> {
        if bytes.is_empty() {
            bail!("file is empty");
        }
        let byte_size = bytes.len() as i64;
        let lane = if bytes.len() > self.config.upload.max_file_bytes {
            Lane::Large
        } else {
            Lane::Standard
        };

        let content_hash = hex_digest(&bytes);
        if let Some((existing_id, _)) = self.store.find_by_hash(&content_hash).await? {
            tracing::debug!(filename, document_id = %existing_id, "duplicate content skipped");
            return Ok(UploadOutcome::skipped(filename, &existing_id));
        }

        // Extraction is CPU-bound (PDF parsing in particular), keep it off
        // the async executor.
        let owned_name = filename.to_string();
        let text = tokio::task::spawn_blocking(move || extract_text(&bytes, &owned_name))
            .await
            .context("extraction task panicked")??;

        let document_id = Uuid::new_v4().to_string();
        let planned_chunks = chunk_document(&document_id, &text, &self.config.chunking).len() as i64;
        if planned_chunks == 0 {
            bail!("no extractable text content");
        }

        let now = chrono::Utc::now().timestamp();
        let document = Document {
            id: document_id.clone(),
            content_hash: content_hash.clone(),
            filename: filename.to_string(),
            category: meta.category.clone(),
            section: meta.section.clone(),
            year: meta.year,
            byte_size,
            status: DocumentStatus::Pending,
            total_chunks: planned_chunks,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.insert_document(&document).await {
            // Lost a race with a concurrent upload of the same bytes: the
            // UNIQUE(content_hash) insert fails, the winner's id is reported
            // as a duplicate skip.
            if let Some((existing_id, _)) = self.store.find_by_hash(&content_hash).await? {
                tracing::debug!(filename, document_id = %existing_id, "duplicate content skipped");
                return Ok(UploadOutcome::skipped(filename, &existing_id));
            }
            return Err(e);
        }
        self.stats.document_added();

        let characters = text.chars().count() as i64;
        if let Err(e) = self
            .queue
            .enqueue(&document_id, filename, &content_hash, text, lane)
            .await
        {
            // Roll the accept back so a retry is possible.
            let _ = self.store.delete_document(&document_id).await;
            self.stats.document_removed(0);
            return Err(e);
        }

        Ok(UploadOutcome::success(
            filename,
            &document_id,
            planned_chunks,
            characters,
        ))
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let results = self
            .retriever
            .search(&request.query, &request.options)
            .await?;

        let mut fallback_used = false;
        let mut answer = None;
        if request.synthesize_answer {
            answer = answer::synthesize(&request.query, &results);
        }

        // Remote fallback is consulted only in openai mode, and only when
        // the local corpus comes up short. Local results always win.
        let thin = results.len() < self.retriever.config().min_local_results;
        if request.options.mode == SearchMode::Openai && request.synthesize_answer && thin {
            let model = &self.config.retrieval.fallback_model;
            match answer::remote_fallback_answer(&self.fallback_client, model, &request.query).await
            {
                Ok(text) => {
                    answer = Some(SynthesizedAnswer {
                        text,
                        citations: Vec::new(),
                    });
                    fallback_used = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "remote fallback failed; returning local results only");
                }
            }
        }

        let mut verification = None;
        if request.verify_answer {
            if let Some(ref synthesized) = answer {
                verification = self.verifier.verify(&request.query, &synthesized.text).await;
            }
        }

        Ok(SearchOutcome {
            results,
            answer,
            verification,
            fallback_used,
        })
    }

    /// Remove a document and everything derived from it. Returns false when
    /// the id is unknown.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let chunks = self.store.count_chunks_for(document_id).await?;
        if !self.store.delete_document(document_id).await? {
            return Ok(false);
        }
        self.lexical.remove_document(document_id);
        self.vector.remove_document(document_id);
        self.stats.document_removed(chunks);
        tracing::info!(document_id, chunks, "document deleted");
        Ok(true)
    }

    pub fn job_snapshots(&self) -> Vec<JobSnapshot> {
        self.queue.snapshots()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot(self.default_mode().as_str())
    }

    /// The mode searches run in unless the request overrides it.
    pub fn default_mode(&self) -> SearchMode {
        if self.config.embedding.provider == "openai" {
            SearchMode::Openai
        } else {
            SearchMode::Hybrid
        }
    }

    pub fn default_options(&self) -> SearchOptions {
        let retrieval = &self.config.retrieval;
        SearchOptions {
            top_k: retrieval.default_top_k,
            min_score: retrieval.default_min_score,
            alpha: retrieval.default_alpha,
            mode: self.default_mode(),
            filters: Default::default(),
            allow_fallback: false,
        }
    }
}

/// Rehydrate the queue registry from persisted job rows so `/upload-status`
/// keeps reporting recent history across restarts. A job caught mid-flight
/// by the previous shutdown has no worker anymore: it is re-marked failed
/// and its document becomes partial, with committed chunks still searchable
/// through the rebuilt indexes.
async fn restore_jobs(
    store: &DocumentStore,
    queue: &IngestionQueue,
    stats: &EngineStats,
) -> Result<()> {
    let mut jobs = store.load_jobs().await?;
    if jobs.is_empty() {
        return Ok(());
    }

    let mut completed = 0i64;
    let mut failed = 0i64;
    for job in &mut jobs {
        if !job.status.is_terminal() {
            let committed = store.count_chunks_for(&job.document_id).await?;
            tracing::warn!(
                document_id = %job.document_id,
                committed,
                total = job.total_chunks,
                "job interrupted by restart; marking failed"
            );
            job.status = JobStatus::Failed;
            job.current_chunk = committed;
            job.error = Some("interrupted by restart".to_string());
            store
                .upsert_job(
                    &job.document_id,
                    JobStatus::Failed,
                    committed,
                    job.total_chunks,
                    job.error.as_deref(),
                )
                .await?;
            store
                .set_document_status(&job.document_id, DocumentStatus::Partial, committed)
                .await?;
        }
        match job.status {
            JobStatus::Completed => completed += 1,
            _ => failed += 1,
        }
    }

    stats.seed_jobs(completed, failed);
    let count = jobs.len();
    queue.restore(jobs);
    tracing::info!(jobs = count, "job history rehydrated");
    Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
