//! Per-entity semantic index management.
//!
//! [`SemanticIndexManager`] owns the only persistent shared state in the
//! system: one SQLite bundle per tracked entity (company ticker) plus the
//! ingestion ledger. Indexing is a monotonic, idempotent set-union over
//! time — the ledger gate runs before any embedding work because embedding
//! is the expensive, rate-limited step.
//!
//! Sources are marked in the ledger only after their chunks and vectors
//! are committed, so a partial embedding failure never falsely marks a
//! source as indexed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::context::expand_windows;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::IndexError;
use crate::ledger::IngestionLedger;
use crate::migrate;
use crate::models::{Chunk, DocumentMeta, SourceDocument};
use crate::normalize::normalize_text;

/// Counters reported back to the caller after an add batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddSummary {
    pub sources_seen: u64,
    pub sources_skipped: u64,
    pub sources_indexed: u64,
    pub sources_failed: u64,
    pub chunks_written: u64,
}

pub struct SemanticIndexManager {
    index_dir: PathBuf,
    chunk_chars: usize,
    overlap_chars: usize,
    batch_size: usize,
    embedder: Arc<dyn Embedder>,
    ledger: IngestionLedger,
    entities: HashMap<String, SqlitePool>,
}

impl SemanticIndexManager {
    /// Build a manager from configuration, opening the ledger eagerly
    /// (corrupt ledger state must fail before any ingestion starts).
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let ledger = IngestionLedger::open(&config.store.ledger)?;
        Ok(Self {
            index_dir: config.store.index_dir.clone(),
            chunk_chars: config.chunking.chunk_chars,
            overlap_chars: config.chunking.overlap_chars,
            batch_size: config.embedding.batch_size,
            embedder,
            ledger,
            entities: HashMap::new(),
        })
    }

    pub fn ledger(&self) -> &IngestionLedger {
        &self.ledger
    }

    /// Path of an entity's index bundle on disk.
    pub fn bundle_path(&self, entity: &str) -> PathBuf {
        let safe: String = entity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.index_dir.join(format!("{}.sqlite", safe))
    }

    /// Lazily open an entity's bundle. A bundle that does not exist yet is
    /// created empty; an empty bundle and one with zero vectors are the
    /// same state.
    pub async fn load(&mut self, entity: &str) -> Result<()> {
        if self.entities.contains_key(entity) {
            return Ok(());
        }
        let path = self.bundle_path(entity);
        let pool = db::open_bundle(&path)
            .await
            .with_context(|| format!("failed to open index bundle {}", path.display()))?;
        migrate::ensure_schema(&pool).await?;
        self.entities.insert(entity.to_string(), pool);
        Ok(())
    }

    /// Ingest a batch of documents for one entity under the given `kind`
    /// (a filing form type, or `"press release"`).
    ///
    /// Per source: ledger gate, normalize, split, embed, transactional
    /// write, then ledger mark. A source whose embedding fails is logged
    /// and left unmarked so the next run retries it; the batch continues.
    pub async fn add_documents(
        &mut self,
        entity: &str,
        documents: &[SourceDocument],
        kind: &str,
    ) -> Result<AddSummary> {
        self.load(entity).await?;
        let pool = self.pool(entity)?.clone();

        let model = self.embedder.model_name().to_string();
        let dims = self.embedder.dims();
        let mut summary = AddSummary::default();

        for doc in documents {
            let meta = &doc.meta;
            summary.sources_seen += 1;

            if self.ledger.is_indexed(&meta.source_id, kind, &meta.timestamp) {
                tracing::info!(
                    entity,
                    source_id = %meta.source_id,
                    "source already indexed, skipping"
                );
                summary.sources_skipped += 1;
                continue;
            }

            let text = normalize_text(&doc.text);
            let chunks = chunk_document(meta, &text, self.chunk_chars, self.overlap_chars);

            if !chunks.is_empty() {
                let vectors = match self.embed_chunks(&chunks).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            entity,
                            source_id = %meta.source_id,
                            error = %e,
                            "embedding failed, source left unmarked for retry"
                        );
                        summary.sources_failed += 1;
                        continue;
                    }
                };
                write_chunks(&pool, &meta.source_id, &chunks, &vectors, &model, dims).await?;
                summary.chunks_written += chunks.len() as u64;
            }

            // Mark only after the bundle write committed.
            self.ledger
                .mark_indexed(&meta.source_id, kind, &meta.timestamp)?;
            summary.sources_indexed += 1;
        }

        // Zero new chunks: no-op, the bundle is not re-persisted.
        if summary.chunks_written > 0 {
            self.save(entity).await?;
        }

        Ok(summary)
    }

    /// Explicit persist of an entity's bundle: checkpoint the WAL into the
    /// main database file so the bundle is self-contained on disk.
    pub async fn save(&self, entity: &str) -> Result<()> {
        let pool = self.pool(entity)?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Top-k chunks by embedding similarity to `query`, ranked descending
    /// with a deterministic tie-break on `(source_id, chunk_index)`.
    ///
    /// Fails with [`IndexError::NotInitialized`] if the entity has never
    /// been loaded or built — callers must be able to tell "no index"
    /// apart from "no matches".
    pub async fn similarity_search(
        &self,
        entity: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<Chunk>> {
        let pool = self.pool(entity)?;
        let query_vec = self.embedder.embed_query(query).await?;

        let rows = sqlx::query(
            r#"
            SELECT c.source_id, c.chunk_index, c.text, c.meta_json, v.embedding
            FROM chunks c
            JOIN chunk_vectors v
              ON v.source_id = c.source_id AND v.chunk_index = c.chunk_index
            "#,
        )
        .fetch_all(pool)
        .await?;

        let mut scored: Vec<(f32, Chunk)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
            scored.push((score, row_to_chunk(row)?));
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.source_id.cmp(&b.1.source_id))
                .then_with(|| a.1.chunk_index.cmp(&b.1.chunk_index))
        });
        scored.truncate(k);

        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Primary retrieval entry point: top-k search expanded into ±`window`
    /// neighborhoods, deduplicated and ordered by `(source_id,
    /// chunk_index)` ascending.
    pub async fn similarity_search_with_context(
        &self,
        entity: &str,
        query: &str,
        k: usize,
        window: usize,
    ) -> Result<Vec<Chunk>> {
        let hits = self.similarity_search(entity, query, k).await?;
        let corpus = self.all_chunks(entity).await?;
        Ok(expand_windows(&hits, &corpus, window))
    }

    /// All chunks in an entity's index, ordered by `(source_id,
    /// chunk_index)`.
    pub async fn all_chunks(&self, entity: &str) -> Result<Vec<Chunk>> {
        let pool = self.pool(entity)?;
        let rows = sqlx::query(
            "SELECT source_id, chunk_index, text, meta_json FROM chunks \
             ORDER BY source_id, chunk_index",
        )
        .fetch_all(pool)
        .await?;

        rows.iter().map(row_to_chunk).collect()
    }

    /// Chunk and vector counts for one loaded entity.
    pub async fn counts(&self, entity: &str) -> Result<(i64, i64)> {
        let pool = self.pool(entity)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(pool)
            .await?;
        Ok((chunks, vectors))
    }

    fn pool(&self, entity: &str) -> Result<&SqlitePool> {
        self.entities.get(entity).ok_or_else(|| {
            IndexError::NotInitialized {
                entity: entity.to_string(),
            }
            .into()
        })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let mut batch_vectors = self.embedder.embed_batch(&texts).await?;
            vectors.append(&mut batch_vectors);
        }
        Ok(vectors)
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let source_id: String = row.get("source_id");
    let chunk_index: i64 = row.get("chunk_index");
    let meta_json: String = row.get("meta_json");
    let meta: DocumentMeta =
        serde_json::from_str(&meta_json).map_err(|e| IndexError::CorruptIndex {
            source_id: source_id.clone(),
            chunk_index,
            reason: e.to_string(),
        })?;
    Ok(Chunk {
        source_id,
        chunk_index,
        text: row.get("text"),
        meta,
    })
}

/// Replace a source's rows in one transaction. A re-ingested revision
/// (same `source_id`, new ledger fingerprint) may produce fewer chunks
/// than the version it supersedes, so the old rows must go first or
/// stale trailing chunks would break the gapless-index invariant.
async fn write_chunks(
    pool: &SqlitePool,
    source_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    model: &str,
    dims: usize,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE source_id = ?")
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        let meta_json = serde_json::to_string(&chunk.meta)?;
        sqlx::query(
            "INSERT INTO chunks (source_id, chunk_index, text, meta_json) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.source_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&meta_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (source_id, chunk_index, embedding, model, dims, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.source_id)
        .bind(chunk.chunk_index)
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(dims as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, Config, RetrievalConfig, StoreConfig};
    use crate::embedding::HashEmbedder;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            store: StoreConfig {
                index_dir: tmp.path().join("indexes"),
                ledger: tmp.path().join("indexes").join("indexed_sources.json"),
            },
            chunking: ChunkingConfig {
                chunk_chars: 40,
                overlap_chars: 0,
            },
            retrieval: RetrievalConfig::default(),
            embedding: Default::default(),
            extraction: Default::default(),
        }
    }

    fn manager(tmp: &TempDir) -> SemanticIndexManager {
        let config = test_config(tmp);
        SemanticIndexManager::new(&config, Arc::new(HashEmbedder::new(64))).unwrap()
    }

    fn doc(source_id: &str, timestamp: &str, text: &str) -> SourceDocument {
        SourceDocument {
            text: text.to_string(),
            meta: DocumentMeta {
                source_id: source_id.to_string(),
                timestamp: timestamp.to_string(),
                fields: BTreeMap::new(),
            },
        }
    }

    // Three 30-byte paragraphs split into three chunks at chunk_chars=40.
    const ACC1_TEXT: &str =
        "alpha bravo charlie delta echo\n\nfoxtrot golf hotel india juliet\n\nkilo lima mike november oscar";
    const ACC2_TEXT: &str =
        "papa quebec romeo sierra tango\n\nuniform victor whiskey xray yankee";

    #[tokio::test]
    async fn test_search_before_load_is_not_initialized() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let err = mgr.similarity_search("PRAX", "anything", 5).await.unwrap_err();
        let index_err = err.downcast_ref::<IndexError>().expect("typed error");
        assert!(matches!(index_err, IndexError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_bundle_yields_empty_index() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        mgr.load("PRAX").await.unwrap();
        let results = mgr.similarity_search("PRAX", "anything", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_add_then_search_returns_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let summary = mgr
            .add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
            .await
            .unwrap();
        assert_eq!(summary.sources_indexed, 1);
        assert_eq!(summary.chunks_written, 3);

        let hits = mgr
            .similarity_search("PRAX", "foxtrot golf hotel india juliet", 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, "ACC-1");
        assert_eq!(hits[0].chunk_index, 1);
    }

    #[tokio::test]
    async fn test_ingestion_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let docs = vec![
            doc("ACC-1", "2025-03-01", ACC1_TEXT),
            doc("ACC-2", "2025-04-01", ACC2_TEXT),
        ];

        let first = mgr.add_documents("PRAX", &docs, "10-Q").await.unwrap();
        assert_eq!(first.sources_indexed, 2);
        let (chunks_after_first, vectors_after_first) = mgr.counts("PRAX").await.unwrap();

        let second = mgr.add_documents("PRAX", &docs, "10-Q").await.unwrap();
        assert_eq!(second.sources_indexed, 0);
        assert_eq!(second.sources_skipped, 2);
        assert_eq!(second.chunks_written, 0);

        let (chunks_after_second, vectors_after_second) = mgr.counts("PRAX").await.unwrap();
        assert_eq!(chunks_after_first, chunks_after_second);
        assert_eq!(vectors_after_first, vectors_after_second);
    }

    #[tokio::test]
    async fn test_amended_source_replaces_stale_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        mgr.add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
            .await
            .unwrap();
        let (chunks, _) = mgr.counts("PRAX").await.unwrap();
        assert_eq!(chunks, 3);

        // Amended filing: same accession, new date, shorter text. The new
        // fingerprint passes the ledger gate and the revision fully
        // replaces the original rows.
        let summary = mgr
            .add_documents("PRAX", &[doc("ACC-1", "2025-03-02", "zulu amended filing")], "10-Q/A")
            .await
            .unwrap();
        assert_eq!(summary.sources_indexed, 1);

        let all = mgr.all_chunks("PRAX").await.unwrap();
        let keys: Vec<(String, i64)> = all
            .iter()
            .map(|c| (c.source_id.clone(), c.chunk_index))
            .collect();
        assert_eq!(keys, vec![("ACC-1".to_string(), 0)]);
        assert_eq!(all[0].text, "zulu amended filing");

        let (chunks, vectors) = mgr.counts("PRAX").await.unwrap();
        assert_eq!(chunks, 1);
        assert_eq!(vectors, 1);
    }

    #[tokio::test]
    async fn test_ledger_survives_manager_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let mut mgr = manager(&tmp);
            mgr.add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
                .await
                .unwrap();
        }
        let mut mgr = manager(&tmp);
        let summary = mgr
            .add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
            .await
            .unwrap();
        assert_eq!(summary.sources_skipped, 1);
        assert_eq!(summary.chunks_written, 0);
    }

    #[tokio::test]
    async fn test_context_expansion_pulls_neighbors_of_top_hit() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        mgr.add_documents(
            "PRAX",
            &[
                doc("ACC-1", "2025-03-01", ACC1_TEXT),
                doc("ACC-2", "2025-04-01", ACC2_TEXT),
            ],
            "10-Q",
        )
        .await
        .unwrap();

        // Top-1 hit is ("ACC-1", 1); window 1 pulls the whole document.
        let expanded = mgr
            .similarity_search_with_context("PRAX", "foxtrot golf hotel india juliet", 1, 1)
            .await
            .unwrap();
        let keys: Vec<(String, i64)> = expanded
            .iter()
            .map(|c| (c.source_id.clone(), c.chunk_index))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("ACC-1".to_string(), 0),
                ("ACC-1".to_string(), 1),
                ("ACC-1".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_window_zero_returns_only_hits() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        mgr.add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
            .await
            .unwrap();

        let plain = mgr
            .similarity_search("PRAX", "kilo lima mike november oscar", 1)
            .await
            .unwrap();
        let expanded = mgr
            .similarity_search_with_context("PRAX", "kilo lima mike november oscar", 1, 0)
            .await
            .unwrap();
        assert_eq!(plain, expanded);
    }

    #[tokio::test]
    async fn test_case_variant_metadata_still_skips() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        mgr.add_documents("PRAX", &[doc("ACC-1", "2025-03-01", ACC1_TEXT)], "10-Q")
            .await
            .unwrap();
        let summary = mgr
            .add_documents("PRAX", &[doc("acc-1", "2025-03-01", ACC1_TEXT)], "10-q")
            .await
            .unwrap();
        assert_eq!(summary.sources_skipped, 1);
    }

    #[tokio::test]
    async fn test_empty_document_is_marked_without_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp);
        let summary = mgr
            .add_documents("PRAX", &[doc("ACC-3", "2025-05-01", "   \n\n  ")], "8-K")
            .await
            .unwrap();
        assert_eq!(summary.sources_indexed, 1);
        assert_eq!(summary.chunks_written, 0);
        assert!(mgr.ledger().is_indexed("ACC-3", "8-K", "2025-05-01"));
    }
}
