//! End-to-end engine tests: ingest through the queue, search through the
//! retriever, all against a temporary SQLite database and the local
//! deterministic embedding provider.

use std::time::Duration;

use medkb::config::{Config, DbConfig, ServerConfig};
use medkb::engine::{Engine, SearchRequest, UploadMeta};
use medkb::models::{Document, DocumentStatus, JobStatus};
use medkb::search::SearchMode;

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("medkb.sqlite"),
        },
        chunking: Default::default(),
        retrieval: Default::default(),
        embedding: Default::default(),
        queue: Default::default(),
        upload: Default::default(),
        verifier: Default::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn wait_for_idle(engine: &Engine) {
    for _ in 0..200 {
        if engine.queue.is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("ingestion queue did not drain");
}

fn meta(category: &str, year: i64) -> UploadMeta {
    UploadMeta {
        category: Some(category.to_string()),
        section: None,
        year: Some(year),
    }
}

/// Roughly three pages of prose, split into paragraphs, so the default
/// fixed-size chunker produces several chunks.
fn long_document(topic: &str) -> Vec<u8> {
    let mut text = String::new();
    for i in 0..12 {
        text.push_str(&format!(
            "Paragraph {} discusses {topic} management in detail. Clinical guidance \
             recommends careful monitoring of the patient and staged escalation of \
             therapy. Evidence from recent trials supports early intervention and \
             structured follow-up for {topic} in most adult populations.\n\n",
            i + 1,
        ));
    }
    text.into_bytes()
}

fn basic_request(engine: &Engine, query: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        options: engine.default_options(),
        synthesize_answer: false,
        verify_answer: false,
    }
}

#[tokio::test]
async fn ingest_completes_and_chunks_are_searchable() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    let outcome = engine
        .ingest_file(
            "hypertension.txt",
            long_document("hypertension"),
            &meta("cardiology", 2023),
        )
        .await;
    assert_eq!(outcome.status, "success");
    assert!(outcome.chunks.unwrap() >= 2, "expected multiple chunks");
    wait_for_idle(&engine).await;

    let jobs = engine.job_snapshots();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].current_chunk, jobs[0].total_chunks);
    assert!((jobs[0].progress_percent - 100.0).abs() < 1e-9);

    let results = engine
        .search(&basic_request(&engine, "hypertension management"))
        .await
        .unwrap();
    assert!(!results.results.is_empty());
    assert_eq!(results.results[0].citation.filename, "hypertension.txt");
}

#[tokio::test]
async fn duplicate_upload_is_skipped_and_stats_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();
    let bytes = long_document("sepsis");

    let first = engine
        .ingest_file("sepsis.txt", bytes.clone(), &meta("icu", 2022))
        .await;
    assert_eq!(first.status, "success");
    wait_for_idle(&engine).await;
    let before = engine.statistics();

    // Same bytes under a different name still dedupe on content.
    let second = engine
        .ingest_file("sepsis_copy.txt", bytes, &meta("icu", 2022))
        .await;
    assert_eq!(second.status, "skipped");
    assert_eq!(second.document_id, first.document_id);
    wait_for_idle(&engine).await;

    let after = engine.statistics();
    assert_eq!(after.total_documents, before.total_documents);
    assert_eq!(after.total_chunks, before.total_chunks);
}

#[tokio::test]
async fn progress_events_are_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    let mut events = engine.queue.subscribe();
    let outcome = engine
        .ingest_file(
            "copd.txt",
            long_document("copd"),
            &meta("pulmonology", 2024),
        )
        .await;
    assert_eq!(outcome.status, "success");
    wait_for_idle(&engine).await;

    let mut last_chunk = 0i64;
    let mut saw_terminal = false;
    while let Ok(event) = events.try_recv() {
        assert!(
            event.current_chunk >= last_chunk,
            "progress went backwards: {} -> {}",
            last_chunk,
            event.current_chunk
        );
        last_chunk = event.current_chunk;
        if event.status.is_terminal() {
            assert_eq!(event.status, JobStatus::Completed);
            assert_eq!(event.current_chunk, event.total_chunks);
            saw_terminal = true;
        }
    }
    assert!(saw_terminal, "no terminal event observed");
}

#[tokio::test]
async fn chunk_indices_are_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file("copd.txt", long_document("copd"), &meta("pulmonology", 2021))
        .await;
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "copd therapy escalation");
    request.options.top_k = 50;
    let outcome = engine.search(&request).await.unwrap();

    let mut indices: Vec<i64> = outcome
        .results
        .iter()
        .map(|r| r.citation.chunk_index)
        .collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices[0], 0);
    for pair in indices.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "chunk indices must be contiguous");
    }
}

#[tokio::test]
async fn scores_are_bounded_and_alpha_endpoints_hold() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file(
            "anticoagulation.txt",
            long_document("anticoagulation"),
            &meta("cardiology", 2024),
        )
        .await;
    engine
        .ingest_file(
            "asthma.txt",
            long_document("asthma"),
            &meta("pulmonology", 2020),
        )
        .await;
    wait_for_idle(&engine).await;

    for alpha in [0.0, 0.5, 1.0] {
        let mut request = basic_request(&engine, "anticoagulation monitoring");
        request.options.alpha = alpha;
        request.options.top_k = 10;
        let outcome = engine.search(&request).await.unwrap();
        assert!(!outcome.results.is_empty());
        for result in &outcome.results {
            assert!((0.0..=1.0).contains(&result.score), "score out of bounds");
            if alpha == 0.0 {
                assert!((result.score - result.lexical_score).abs() < 1e-9);
            }
            if alpha == 1.0 {
                assert!((result.score - result.dense_score).abs() < 1e-9);
            }
        }
    }
}

#[tokio::test]
async fn min_year_filter_excludes_older_documents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file(
            "diabetes_2015.txt",
            long_document("diabetes"),
            &meta("endocrinology", 2015),
        )
        .await;
    let mut newer = long_document("diabetes");
    newer.extend_from_slice(b"Updated recommendations follow current consensus.\n");
    engine
        .ingest_file("diabetes_2024.txt", newer, &meta("endocrinology", 2024))
        .await;
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "diabetes management");
    request.options.top_k = 20;
    request.options.filters.min_year = Some(2020);
    let outcome = engine.search(&request).await.unwrap();

    assert!(!outcome.results.is_empty());
    for result in &outcome.results {
        assert_eq!(result.citation.year, Some(2024));
    }
}

#[tokio::test]
async fn fallback_relaxes_filters_when_nothing_matches() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file(
            "stroke.txt",
            long_document("stroke"),
            &meta("neurology", 2018),
        )
        .await;
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "stroke intervention");
    request.options.filters.min_year = Some(2023);
    request.options.filters.category = Some("cardiology".to_string());

    // Hard filters exclude everything.
    let strict = engine.search(&request).await.unwrap();
    assert!(strict.results.is_empty());

    // Relaxation ladder finds the document.
    request.options.allow_fallback = true;
    let relaxed = engine.search(&request).await.unwrap();
    assert!(!relaxed.results.is_empty());
}

#[tokio::test]
async fn ranking_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    for name in ["a", "b", "c"] {
        engine
            .ingest_file(
                &format!("renal_{}.txt", name),
                format!(
                    "Renal dosing of antibiotics requires adjustment ({} cohort). \
                     Monitor creatinine clearance and adjust dosing intervals.",
                    name
                )
                .into_bytes(),
                &meta("nephrology", 2022),
            )
            .await;
    }
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "renal dosing antibiotics");
    request.options.top_k = 10;
    let first = engine.search(&request).await.unwrap();
    let second = engine.search(&request).await.unwrap();

    let ids = |outcome: &medkb::engine::SearchOutcome| {
        outcome
            .results
            .iter()
            .map(|r| r.chunk_id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn hybrid_union_keeps_single_channel_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    // Keyword-strong: mentions the rare exact term.
    engine
        .ingest_file(
            "keyword.txt",
            b"Dabigatran etexilate reversal uses idarucizumab in emergencies.".to_vec(),
            &meta("pharmacy", 2023),
        )
        .await;
    // Dense-leaning: shares vocabulary and context but not the rare term.
    engine
        .ingest_file(
            "dense.txt",
            b"Anticoagulant reversal strategies in emergencies depend on the agent \
              involved and available reversal drugs."
                .to_vec(),
            &meta("pharmacy", 2023),
        )
        .await;
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "idarucizumab reversal emergencies");
    request.options.top_k = 10;
    let outcome = engine.search(&request).await.unwrap();

    let files: Vec<&str> = outcome
        .results
        .iter()
        .map(|r| r.citation.filename.as_str())
        .collect();
    assert!(files.contains(&"keyword.txt"));
    assert!(files.contains(&"dense.txt"));
}

#[tokio::test]
async fn synthesized_answer_cites_ranked_sources() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file(
            "warfarin.txt",
            b"Warfarin requires regular INR monitoring. Dose adjustments follow the \
              measured INR value."
                .to_vec(),
            &meta("pharmacy", 2022),
        )
        .await;
    wait_for_idle(&engine).await;

    let mut request = basic_request(&engine, "warfarin INR monitoring");
    request.synthesize_answer = true;
    let outcome = engine.search(&request).await.unwrap();

    let answer = outcome.answer.expect("answer expected");
    assert!(answer.text.contains("[1]"));
    assert!(!answer.citations.is_empty());
    assert_eq!(answer.citations[0].filename, "warfarin.txt");
    assert!(!outcome.fallback_used);
}

#[tokio::test]
async fn delete_document_removes_it_from_search() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    let outcome = engine
        .ingest_file(
            "gout.txt",
            long_document("gout"),
            &meta("rheumatology", 2021),
        )
        .await;
    let document_id = outcome.document_id.unwrap();
    wait_for_idle(&engine).await;

    let before = engine
        .search(&basic_request(&engine, "gout management"))
        .await
        .unwrap();
    assert!(!before.results.is_empty());

    assert!(engine.delete_document(&document_id).await.unwrap());
    let after = engine
        .search(&basic_request(&engine, "gout management"))
        .await
        .unwrap();
    assert!(after.results.is_empty());

    // Deleting again reports not found.
    assert!(!engine.delete_document(&document_id).await.unwrap());
}

#[tokio::test]
async fn indexes_rebuild_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    {
        let engine = Engine::new(config.clone()).await.unwrap();
        engine
            .ingest_file(
                "pneumonia.txt",
                long_document("pneumonia"),
                &meta("pulmonology", 2023),
            )
            .await;
        wait_for_idle(&engine).await;
    }

    // Fresh engine over the same database file.
    let engine = Engine::new(config).await.unwrap();
    let outcome = engine
        .search(&basic_request(&engine, "pneumonia management"))
        .await
        .unwrap();
    assert!(!outcome.results.is_empty());

    let stats = engine.statistics();
    assert_eq!(stats.total_documents, 1);
    assert!(stats.total_chunks >= 2);
}

#[tokio::test]
async fn job_snapshots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    {
        let engine = Engine::new(config.clone()).await.unwrap();
        engine
            .ingest_file(
                "bronchitis.txt",
                long_document("bronchitis"),
                &meta("pulmonology", 2022),
            )
            .await;
        wait_for_idle(&engine).await;
    }

    let engine = Engine::new(config).await.unwrap();
    let jobs = engine.job_snapshots();
    assert_eq!(jobs.len(), 1, "persisted job history must be rehydrated");
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].filename, "bronchitis.txt");
    assert_eq!(jobs[0].current_chunk, jobs[0].total_chunks);

    let stats = engine.statistics();
    assert_eq!(stats.processing_queue.completed, 1);
    assert_eq!(stats.processing_queue.processing, 0);
}

#[tokio::test]
async fn interrupted_jobs_fail_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    // A document caught mid-indexing by a shutdown: its job row still says
    // processing but no worker will ever resume it.
    {
        let engine = Engine::new(config.clone()).await.unwrap();
        let doc = Document {
            id: "doc-interrupted".to_string(),
            content_hash: "a".repeat(64),
            filename: "stroke_protocol.txt".to_string(),
            category: None,
            section: None,
            year: None,
            byte_size: 64,
            status: DocumentStatus::Indexing,
            total_chunks: 4,
            created_at: 0,
            updated_at: 0,
        };
        engine.store.insert_document(&doc).await.unwrap();
        engine
            .store
            .upsert_job("doc-interrupted", JobStatus::Processing, 1, 4, None)
            .await
            .unwrap();
    }

    let engine = Engine::new(config).await.unwrap();
    let jobs = engine.job_snapshots();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.as_deref().unwrap().contains("restart"));

    let (_, status) = engine
        .store
        .find_by_hash(&"a".repeat(64))
        .await
        .unwrap()
        .expect("document row must survive");
    assert_eq!(status, DocumentStatus::Partial);
    assert_eq!(engine.statistics().processing_queue.failed, 1);
}

#[tokio::test]
async fn concurrent_duplicate_uploads_yield_one_success() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();
    let bytes = long_document("stroke");

    let meta_a = meta("neurology", 2023);
    let meta_b = meta("neurology", 2023);
    let (a, b) = tokio::join!(
        engine.ingest_file("stroke_a.txt", bytes.clone(), &meta_a),
        engine.ingest_file("stroke_b.txt", bytes, &meta_b),
    );
    let statuses = [a.status.as_str(), b.status.as_str()];
    assert!(statuses.contains(&"success"), "statuses: {:?}", statuses);
    assert!(statuses.contains(&"skipped"), "statuses: {:?}", statuses);
    wait_for_idle(&engine).await;
    assert_eq!(engine.statistics().total_documents, 1);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    let mut request = basic_request(&engine, "   ");
    request.options.mode = SearchMode::Local;
    assert!(engine.search(&request).await.is_err());
}

#[tokio::test]
async fn statistics_reflect_queue_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(test_config(&dir)).await.unwrap();

    engine
        .ingest_file(
            "migraine.txt",
            long_document("migraine"),
            &meta("neurology", 2022),
        )
        .await;
    wait_for_idle(&engine).await;

    let stats = engine.statistics();
    assert_eq!(stats.total_documents, 1);
    assert_eq!(stats.processing_queue.completed, 1);
    assert_eq!(stats.processing_queue.queued, 0);
    assert_eq!(stats.processing_queue.processing, 0);
    assert_eq!(stats.knowledge_level, "building");
}
