//! Typed failures for the index and ledger layer.
//!
//! Most of the crate reports errors through `anyhow` with context, but a
//! few conditions must be distinguishable by callers: a search against an
//! entity that was never loaded is not the same as a search with no
//! matches, and corrupt on-disk state must never be mistaken for a cold
//! start.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    /// Similarity search was attempted before any documents were loaded or
    /// added for this entity. Recoverable: load or add documents first.
    #[error("semantic index for '{entity}' has not been loaded or built")]
    NotInitialized { entity: String },

    /// The ledger file exists but cannot be parsed. Treating it as empty
    /// would silently re-embed every source, so this is fatal.
    #[error("ingestion ledger {path} is unreadable: {reason}")]
    CorruptLedger { path: PathBuf, reason: String },

    /// The ledger could not be persisted after a mark. Continuing would
    /// risk duplicate embedding on the next run, so the run must stop.
    #[error("failed to persist ingestion ledger {path}: {reason}")]
    LedgerPersist { path: PathBuf, reason: String },

    /// An index bundle row failed to decode. The bundle was written by
    /// this tool, so unreadable rows mean on-disk corruption.
    #[error("index bundle row ({source_id}, {chunk_index}) is unreadable: {reason}")]
    CorruptIndex {
        source_id: String,
        chunk_index: i64,
        reason: String,
    },
}
