//! Append-only, hash-chained audit record of every attempted action.
//!
//! Each entry's hash is `sha256("{action_id}:{command_text}:{result}:{prev_hash}")` in hex,
//! where `result` is the status label and the first entry chains from [`GENESIS`]. Editing
//! entry *k* changes every hash recomputed from genesis at or after *k*.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::info;

use crate::commands::ActionStatus;

/// `prev_hash` of the first entry.
pub const GENESIS: &str = "genesis";

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Action identifier.
    pub action_id: String,
    /// Source text of the command.
    pub command_text: String,
    /// Terminal status.
    pub result: ActionStatus,
    /// End-to-end latency.
    pub latency_ms: u64,
    /// Explanation recorded with the status.
    pub rationale: String,
    /// Component that wrote the entry.
    pub signer: String,
    /// Hash of the previous entry or [`GENESIS`].
    pub prev_hash: String,
    /// Hash of this entry.
    pub hash: String,
    /// Append time. Not covered by the hash.
    pub timestamp: DateTime<Utc>,
}

/// Chain hash for the given fields.
#[must_use]
pub fn compute_hash(
    action_id: &str,
    command_text: &str,
    result: ActionStatus,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{action_id}:{command_text}:{result}:{prev_hash}").as_bytes());
    hex::encode(hasher.finalize())
}

impl LedgerEntry {
    /// Hash recomputed from this entry's fields and `prev_hash`.
    #[must_use]
    pub fn expected_hash(&self, prev_hash: &str) -> String {
        compute_hash(&self.action_id, &self.command_text, self.result, prev_hash)
    }

    /// First twelve hash characters, as quoted in queue receipts.
    #[must_use]
    pub fn short_hash(&self) -> &str {
        self.hash.get(..12).unwrap_or(&self.hash)
    }
}

/// Ledger storage failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage could not be read or written.
    #[error("ledger io error at {path}: {source}")]
    Io {
        /// Backing file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A stored entry could not be decoded.
    #[error("corrupt ledger entry at line {line}: {reason}")]
    Corrupt {
        /// One-based line number.
        line: usize,
        /// Decoder message.
        reason: String,
    },
    /// Entry could not be encoded.
    #[error("encoding ledger entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only storage for ledger entries.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Persists `entry` after every previously appended entry.
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;
    /// All entries in append order.
    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Volatile sink for tests and single-run tools.
#[derive(Debug, Default)]
pub struct MemoryLedgerSink {
    entries: SyncMutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl LedgerSink for MemoryLedgerSink {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.snapshot())
    }
}

/// JSON-lines file sink, one entry per line.
#[derive(Debug, Clone)]
pub struct JsonlLedgerSink {
    path: PathBuf,
}

impl JsonlLedgerSink {
    /// Uses `path`, creating it on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Decodes JSON-lines ledger content.
pub fn parse_entries(content: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|err| LedgerError::Corrupt {
                line: index + 1,
                reason: err.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl LedgerSink for JsonlLedgerSink {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut data = serde_json::to_vec(entry)?;
        data.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        file.write_all(&data).await.map_err(|err| self.io_error(err))?;
        file.flush().await.map_err(|err| self.io_error(err))
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_entries(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}

/// Single-writer ledger tracking the chain head.
pub struct Ledger {
    sink: Arc<dyn LedgerSink>,
    head: Mutex<String>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    /// Opens a ledger over `sink`, resuming from its last stored hash.
    pub async fn open(sink: Arc<dyn LedgerSink>) -> Result<Self, LedgerError> {
        let head = sink
            .entries()
            .await?
            .last()
            .map_or_else(|| GENESIS.to_string(), |entry| entry.hash.clone());
        Ok(Self {
            sink,
            head: Mutex::new(head),
        })
    }

    /// Fresh in-memory ledger; the sink is returned for inspection.
    #[must_use]
    pub fn in_memory() -> (Self, Arc<MemoryLedgerSink>) {
        let sink = Arc::new(MemoryLedgerSink::new());
        let ledger = Self {
            sink: sink.clone(),
            head: Mutex::new(GENESIS.to_string()),
        };
        (ledger, sink)
    }

    /// Current chain head.
    pub async fn head(&self) -> String {
        self.head.lock().await.clone()
    }

    /// Stored entries.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.sink.entries().await
    }

    /// Appends one entry and returns it. The head only advances once the sink accepted it.
    pub async fn append(
        &self,
        action_id: &str,
        command_text: &str,
        result: ActionStatus,
        latency_ms: u64,
        rationale: &str,
        signer: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut head = self.head.lock().await;
        let hash = compute_hash(action_id, command_text, result, &head);
        let entry = LedgerEntry {
            action_id: action_id.to_string(),
            command_text: command_text.to_string(),
            result,
            latency_ms,
            rationale: rationale.to_string(),
            signer: signer.to_string(),
            prev_hash: head.clone(),
            hash: hash.clone(),
            timestamp: Utc::now(),
        };
        self.sink.append(&entry).await?;
        *head = hash;
        info!(action_id, result = %result, hash = entry.short_hash(), "ledger entry appended");
        Ok(entry)
    }
}

/// Outcome of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    /// Whether every entry verified.
    pub valid: bool,
    /// Entries examined.
    pub total_entries: usize,
    /// Entries verified before the first failure.
    pub verified_entries: usize,
    /// Index of the first invalid entry.
    pub first_invalid_index: Option<usize>,
    /// Description of the first failure.
    pub error_message: Option<String>,
}

/// Walks `entries` from genesis, checking each link and recomputed hash.
#[must_use]
pub fn verify_chain(entries: &[LedgerEntry]) -> ChainVerification {
    let mut report = ChainVerification {
        valid: true,
        total_entries: entries.len(),
        verified_entries: 0,
        first_invalid_index: None,
        error_message: None,
    };
    let mut expected_prev = GENESIS;
    for (index, entry) in entries.iter().enumerate() {
        let failure = if entry.prev_hash != expected_prev {
            Some(format!(
                "entry {index} ({}) links to {} but the previous hash is {expected_prev}",
                entry.action_id, entry.prev_hash
            ))
        } else if entry.expected_hash(expected_prev) != entry.hash {
            Some(format!("entry {index} ({}) has an invalid hash", entry.action_id))
        } else {
            None
        };
        if let Some(message) = failure {
            report.valid = false;
            report.first_invalid_index = Some(index);
            report.error_message = Some(message);
            return report;
        }
        report.verified_entries = index + 1;
        expected_prev = &entry.hash;
    }
    report
}

/// Indices whose stored hash differs from the chain recomputed from genesis.
#[must_use]
pub fn recomputed_mismatches(entries: &[LedgerEntry]) -> Vec<usize> {
    let mut prev = GENESIS.to_string();
    let mut mismatches = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let recomputed = entry.expected_hash(&prev);
        if recomputed != entry.hash {
            mismatches.push(index);
        }
        prev = recomputed;
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn seeded(count: usize) -> (Ledger, Arc<MemoryLedgerSink>) {
        let (ledger, sink) = Ledger::in_memory();
        for i in 0..count {
            ledger
                .append(
                    &format!("a{i}"),
                    &format!("SCAN_SITE domain=site{i}.com"),
                    ActionStatus::Success,
                    5,
                    "Action completed successfully",
                    "command_poller",
                )
                .await
                .unwrap();
        }
        (ledger, sink)
    }

    #[tokio::test]
    async fn chain_links_from_genesis() {
        let (ledger, sink) = seeded(3).await;
        let entries = sink.snapshot();
        assert_eq!(entries[0].prev_hash, GENESIS);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(ledger.head().await, entries[2].hash);
        assert_eq!(
            entries[0].hash,
            compute_hash("a0", "SCAN_SITE domain=site0.com", ActionStatus::Success, GENESIS)
        );
        let report = verify_chain(&entries);
        assert!(report.valid);
        assert_eq!(report.verified_entries, 3);
        assert!(recomputed_mismatches(&entries).is_empty());
    }

    #[tokio::test]
    async fn tampering_invalidates_every_later_hash() {
        let (_, sink) = seeded(5).await;
        let mut entries = sink.snapshot();
        entries[2].result = ActionStatus::Failed;
        assert_eq!(recomputed_mismatches(&entries), vec![2, 3, 4]);
        let report = verify_chain(&entries);
        assert!(!report.valid);
        assert_eq!(report.first_invalid_index, Some(2));
        assert_eq!(report.verified_entries, 2);
    }

    #[tokio::test]
    async fn jsonl_ledger_resumes_its_head() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        let first = Ledger::open(Arc::new(JsonlLedgerSink::new(&path))).await.unwrap();
        assert_eq!(first.head().await, GENESIS);
        let entry = first
            .append("a", "SCAN_SITE domain=x.io", ActionStatus::Success, 1, "ok", "command_poller")
            .await
            .unwrap();
        drop(first);

        let reopened = Ledger::open(Arc::new(JsonlLedgerSink::new(&path))).await.unwrap();
        assert_eq!(reopened.head().await, entry.hash);
        reopened
            .append("b", "SCAN_SITE domain=y.io", ActionStatus::Blocked, 1, "no", "command_poller")
            .await
            .unwrap();
        let entries = reopened.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(verify_chain(&entries).valid);
    }

    #[test]
    fn corrupt_lines_are_reported() {
        let err = parse_entries("\n{not json}\n").unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { line: 2, .. }));
    }
}
