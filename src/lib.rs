//! # MedKB
//!
//! A retrieval engine for a clinical knowledge base: document ingestion
//! (extraction, chunking, embedding, indexing) behind a bounded background
//! queue, hybrid dense+lexical search with tunable weighting, extractive
//! cited answers, and an optional literature cross-check.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌────────────────┐
//! │  Upload   │──▶│ Ingestion     │──▶│  SQLite         │
//! │ txt/pdf/  │   │ queue: chunk  │   │  documents /    │
//! │ docx/md   │   │ embed, commit │   │  chunks / jobs  │
//! └──────────┘   └──────┬────────┘   └───────┬────────┘
//!                       │ per chunk          │ rebuild at startup
//!                       ▼                    ▼
//!              ┌─────────────────────────────────┐
//!              │  BM25 postings  +  vector index  │
//!              └───────────────┬─────────────────┘
//!                              ▼
//!              ┌─────────────────────────────────┐
//!              │ hybrid retriever → cited answer  │
//!              └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction (txt, markdown, pdf, docx) |
//! | [`chunk`] | Deterministic text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`lexical`] | Incremental BM25 inverted index |
//! | [`vector`] | In-memory k-NN vector index |
//! | [`store`] | Document Store over SQLite |
//! | [`queue`] | Background ingestion queue |
//! | [`search`] | Hybrid retriever |
//! | [`answer`] | Extractive answer synthesis |
//! | [`verify`] | External literature verifier |
//! | [`stats`] | Aggregate statistics |
//! | [`engine`] | Composition root |
//! | [`server`] | HTTP server |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod lexical;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod vector;
pub mod verify;
