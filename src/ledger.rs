//! Ingestion ledger: the durable set of source fingerprints.
//!
//! A fingerprint present in the ledger means the corresponding source has
//! already been embedded and must never be re-embedded. The set is
//! rewritten in full after every mark (simple overwrite, not a log): a
//! crash between add and persist loses at most that one mark, which only
//! causes a redundant re-ingestion, never data loss.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::error::IndexError;

/// Durable membership set keyed by `(source_id, kind, timestamp)`
/// fingerprints, persisted as a JSON list of hex digests.
#[derive(Debug)]
pub struct IngestionLedger {
    path: PathBuf,
    hashes: HashSet<String>,
}

impl IngestionLedger {
    /// Open the ledger at `path`.
    ///
    /// A missing file is a normal cold start and yields an empty set. An
    /// existing file that cannot be parsed is fatal: treating corrupt
    /// state as empty would silently re-embed every source.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hashes = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let list: Vec<String> = serde_json::from_str(&content).map_err(|e| {
                    IndexError::CorruptLedger {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                list.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(IndexError::CorruptLedger {
                    path,
                    reason: e.to_string(),
                }
                .into())
            }
        };
        Ok(Self { path, hashes })
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Deterministic fingerprint over the three identifying fields,
    /// lower-cased and pipe-joined. Case differences in any field produce
    /// the same fingerprint.
    pub fn fingerprint(source_id: &str, kind: &str, timestamp: &str) -> String {
        let key = format!("{}|{}|{}", source_id, kind, timestamp).to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Pure lookup; an absent fingerprint is `false`, never an error.
    pub fn is_indexed(&self, source_id: &str, kind: &str, timestamp: &str) -> bool {
        self.hashes
            .contains(&Self::fingerprint(source_id, kind, timestamp))
    }

    /// Add a fingerprint and immediately persist the full set.
    ///
    /// A persist failure is fatal to the run: continuing without the mark
    /// on disk would re-embed the source on the next run.
    pub fn mark_indexed(&mut self, source_id: &str, kind: &str, timestamp: &str) -> Result<()> {
        let inserted = self
            .hashes
            .insert(Self::fingerprint(source_id, kind, timestamp));
        if inserted {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.persist_error(&self.path, e))?;
        }
        let mut list: Vec<&String> = self.hashes.iter().collect();
        list.sort();
        let json = serde_json::to_string(&list)?;
        std::fs::write(&self.path, json).map_err(|e| self.persist_error(&self.path, e))?;
        Ok(())
    }

    fn persist_error(&self, path: &Path, e: std::io::Error) -> anyhow::Error {
        IndexError::LedgerPersist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    }
}
