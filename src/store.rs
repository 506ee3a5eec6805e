//! Document Store: the single source of truth for Document, Chunk, and
//! ProcessingJob state.
//!
//! All mutation flows through the ingestion queue's state-machine
//! transitions; search only reads. Vectors are persisted as BLOBs next to
//! their chunks so the in-memory indexes can be rebuilt after a restart.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::lexical::LexicalIndex;
use crate::models::{Chunk, Document, DocumentStatus, JobStatus, SearchFilters};
use crate::vector::VectorIndex;

/// Lightweight document metadata used for filtering and citations.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub id: String,
    pub filename: String,
    pub category: Option<String>,
    pub section: Option<String>,
    pub year: Option<i64>,
    pub status: DocumentStatus,
}

/// A job row read back from the `jobs` table, used to rehydrate the
/// in-memory registry after a restart.
#[derive(Debug, Clone)]
pub struct PersistedJob {
    pub document_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub current_chunk: i64,
    pub total_chunks: i64,
    pub error: Option<String>,
}

/// Chunk fields needed to build a search result.
#[derive(Debug, Clone)]
pub struct ChunkDetail {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub section_label: Option<String>,
}

pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============ Documents ============

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, content_hash, filename, category, section, year,
                 byte_size, status, total_chunks, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.content_hash)
        .bind(&doc.filename)
        .bind(&doc.category)
        .bind(&doc.section)
        .bind(doc.year)
        .bind(doc.byte_size)
        .bind(doc.status.as_str())
        .bind(doc.total_chunks)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Content-hash duplicate lookup. Returns `(document_id, status)`.
    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<(String, DocumentStatus)>> {
        let row = sqlx::query("SELECT id, status FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let status: String = r.get("status");
            (r.get("id"), DocumentStatus::parse(&status))
        }))
    }

    pub async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        total_chunks: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE documents SET status = ?, total_chunks = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(total_chunks)
        .bind(now)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_document_meta(&self) -> Result<HashMap<String, DocumentMeta>> {
        let rows =
            sqlx::query("SELECT id, filename, category, section, year, status FROM documents")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let meta = row_to_meta(r);
                (meta.id.clone(), meta)
            })
            .collect())
    }

    /// Hard metadata pre-filter: the set of document ids matching `filters`.
    /// Returns `None` when no filter is active (everything allowed).
    pub async fn filtered_document_ids(
        &self,
        filters: &SearchFilters,
    ) -> Result<Option<HashSet<String>>> {
        if filters.is_empty() {
            return Ok(None);
        }

        let mut sql = String::from("SELECT id FROM documents WHERE 1=1");
        if filters.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if filters.section.is_some() {
            sql.push_str(" AND section = ?");
        }
        if filters.min_year.is_some() && !filters.allow_outdated {
            sql.push_str(" AND year IS NOT NULL AND year >= ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref category) = filters.category {
            query = query.bind(category);
        }
        if let Some(ref section) = filters.section {
            query = query.bind(section);
        }
        if let Some(min_year) = filters.min_year {
            if !filters.allow_outdated {
                query = query.bind(min_year);
            }
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(Some(rows.into_iter().map(|r| r.get("id")).collect()))
    }

    /// Cascade delete a document with its chunks, vectors, and job row.
    /// Returns false when the document does not exist.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Chunks ============

    /// Commit one chunk and its vector in a single transaction. The caller
    /// commits the in-memory index entries right after this returns.
    pub async fn commit_chunk(&self, chunk: &Chunk, vector: &[f32], model: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, section_label) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.section_label)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, embedding, dims, model) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(model)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn chunk_details(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashMap<String, ChunkDetail>> {
        let mut out = HashMap::with_capacity(chunk_ids.len());
        // Batched to stay under SQLite's bind-variable cap.
        for batch in chunk_ids.chunks(500) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT id, document_id, chunk_index, text, section_label FROM chunks WHERE id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for chunk_id in batch {
                query = query.bind(chunk_id);
            }
            for r in query.fetch_all(&self.pool).await? {
                let detail = ChunkDetail {
                    chunk_id: r.get("id"),
                    document_id: r.get("document_id"),
                    chunk_index: r.get("chunk_index"),
                    text: r.get("text"),
                    section_label: r.get("section_label"),
                };
                out.insert(detail.chunk_id.clone(), detail);
            }
        }
        Ok(out)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_chunks_for(&self, document_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    // ============ Jobs ============

    pub async fn upsert_job(
        &self,
        document_id: &str,
        status: JobStatus,
        current_chunk: i64,
        total_chunks: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO jobs (document_id, status, current_chunk, total_chunks, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                status = excluded.status,
                current_chunk = excluded.current_chunk,
                total_chunks = excluded.total_chunks,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document_id)
        .bind(status.as_str())
        .bind(current_chunk)
        .bind(total_chunks)
        .bind(error)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All persisted job rows, oldest update first. Read at startup to
    /// rehydrate the queue registry.
    pub async fn load_jobs(&self) -> Result<Vec<PersistedJob>> {
        let rows = sqlx::query(
            r#"
            SELECT j.document_id, d.filename, j.status, j.current_chunk, j.total_chunks, j.error
            FROM jobs j
            JOIN documents d ON d.id = j.document_id
            ORDER BY j.updated_at, j.document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let status: String = r.get("status");
                PersistedJob {
                    document_id: r.get("document_id"),
                    filename: r.get("filename"),
                    status: JobStatus::parse(&status),
                    current_chunk: r.get("current_chunk"),
                    total_chunks: r.get("total_chunks"),
                    error: r.get("error"),
                }
            })
            .collect())
    }

    // ============ Index rebuild ============

    /// Rebuild both in-memory indexes from persisted chunks and vectors, in
    /// document + chunk order. Used at startup and after index corruption.
    pub async fn rebuild_indexes(
        &self,
        lexical: &LexicalIndex,
        vector: &VectorIndex,
    ) -> Result<usize> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.text, cv.embedding
            FROM chunks c
            JOIN chunk_vectors cv ON cv.chunk_id = c.id
            ORDER BY c.document_id, c.chunk_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut restored = 0usize;
        for row in rows {
            let chunk_id: String = row.get("id");
            let document_id: String = row.get("document_id");
            let text: String = row.get("text");
            let blob: Vec<u8> = row.get("embedding");

            lexical.add_chunk(&chunk_id, &document_id, &text);
            vector.insert(&chunk_id, &document_id, blob_to_vec(&blob));
            restored += 1;
        }
        Ok(restored)
    }
}

fn row_to_meta(r: sqlx::sqlite::SqliteRow) -> DocumentMeta {
    let status: String = r.get("status");
    DocumentMeta {
        id: r.get("id"),
        filename: r.get("filename"),
        category: r.get("category"),
        section: r.get("section"),
        year: r.get("year"),
        status: DocumentStatus::parse(&status),
    }
}
