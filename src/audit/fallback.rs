//! Fallback Buffer
//!
//! Append-only JSONL file holding entries captured while the audit store
//! was unreachable. Entries are unchained (their real predecessor cannot
//! be known offline) and stay here until reconciliation links them into
//! the main chain.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::audit::entry::EntryContent;
use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    Unchained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackState {
    PendingFallback,
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub local_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub chain_state: ChainState,
    pub state: FallbackState,
    pub content: EntryContent,
}

struct BufferState {
    entries: Vec<FallbackEntry>,
    next_sequence: u64,
}

pub struct FallbackRecorder {
    path: PathBuf,
    buffer: Mutex<BufferState>,
    reconcile_lock: Mutex<()>,
}

impl FallbackRecorder {
    /// Open (or create) the buffer at `path`, loading any pending entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| AuditError::fallback("failed to create buffer directory", e))?;
        }

        let entries = if path.exists() {
            load_buffer(&path)?
        } else {
            Vec::new()
        };
        let next_sequence = entries.iter().map(|e| e.local_sequence).max().unwrap_or(0) + 1;

        if !entries.is_empty() {
            warn!(
                "Fallback buffer {} holds {} unreconciled entries",
                path.display(),
                entries.len()
            );
        }

        Ok(Self {
            path,
            buffer: Mutex::new(BufferState {
                entries,
                next_sequence,
            }),
            reconcile_lock: Mutex::new(()),
        })
    }

    /// Durably capture `content`; returns its local sequence number.
    pub async fn record(&self, content: EntryContent) -> Result<u64, AuditError> {
        let mut buffer = self.buffer.lock().await;

        let entry = FallbackEntry {
            local_sequence: buffer.next_sequence,
            captured_at: Utc::now().trunc_subsecs(6),
            chain_state: ChainState::Unchained,
            state: FallbackState::PendingFallback,
            content,
        };
        let line = serde_json::to_string(&entry)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::fallback("failed to open buffer", e))?;
        writeln!(file, "{}", line).map_err(|e| AuditError::fallback("failed to write buffer", e))?;
        file.flush()
            .map_err(|e| AuditError::fallback("failed to flush buffer", e))?;
        file.sync_data()
            .map_err(|e| AuditError::fallback("failed to sync buffer", e))?;

        buffer.next_sequence += 1;
        let local_sequence = entry.local_sequence;
        buffer.entries.push(entry);

        warn!(
            local_sequence,
            "Audit store unavailable, entry captured in fallback buffer"
        );
        Ok(local_sequence)
    }

    /// Pending entries in capture order.
    pub async fn pending(&self) -> Vec<FallbackEntry> {
        let buffer = self.buffer.lock().await;
        let mut entries = buffer.entries.clone();
        entries.sort_by_key(|e| e.local_sequence);
        entries
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop a reconciled entry from the buffer. The file is rewritten
    /// through a temporary file and renamed into place.
    pub async fn remove(&self, local_sequence: u64) -> Result<Option<FallbackEntry>, AuditError> {
        let mut buffer = self.buffer.lock().await;
        let Some(index) = buffer
            .entries
            .iter()
            .position(|e| e.local_sequence == local_sequence)
        else {
            return Ok(None);
        };

        let remaining: Vec<&FallbackEntry> = buffer
            .entries
            .iter()
            .filter(|e| e.local_sequence != local_sequence)
            .collect();
        rewrite_buffer(&self.path, &remaining)?;

        let mut removed = buffer.entries.remove(index);
        removed.state = FallbackState::Reconciled;
        debug!(local_sequence, "Fallback entry reconciled and removed");
        Ok(Some(removed))
    }

    /// Held for the duration of one reconciliation pass.
    pub async fn reconcile_guard(&self) -> MutexGuard<'_, ()> {
        self.reconcile_lock.lock().await
    }
}

fn load_buffer(path: &Path) -> Result<Vec<FallbackEntry>, AuditError> {
    let file = File::open(path).map_err(|e| AuditError::fallback("failed to open buffer", e))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| AuditError::fallback("failed to read buffer", e))?;
        if line.trim().is_empty() {
            continue;
        }
        // A malformed line is never skipped: that would silently lose an entry.
        let entry: FallbackEntry = serde_json::from_str(&line).map_err(|e| {
            AuditError::fallback(&format!("malformed buffer line {}", line_num + 1), e)
        })?;
        entries.push(entry);
    }

    info!("Loaded {} fallback entries from {}", entries.len(), path.display());
    Ok(entries)
}

fn rewrite_buffer(path: &Path, entries: &[&FallbackEntry]) -> Result<(), AuditError> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file =
            File::create(&tmp).map_err(|e| AuditError::fallback("failed to create temp buffer", e))?;
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{}", line)
                .map_err(|e| AuditError::fallback("failed to write temp buffer", e))?;
        }
        file.sync_all()
            .map_err(|e| AuditError::fallback("failed to sync temp buffer", e))?;
    }
    fs::rename(&tmp, path).map_err(|e| AuditError::fallback("failed to replace buffer", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActionType, Actor, LogRequest, Operation};
    use tempfile::tempdir;

    fn content(resource_id: &str) -> EntryContent {
        LogRequest::new(
            Actor::new("u-8", "Clerk", "CLERK", "payments"),
            ActionType::PaymentOrdered,
            "payment",
            resource_id,
            Operation::Create,
        )
        .into_content()
    }

    #[tokio::test]
    async fn test_record_assigns_increasing_sequences() {
        let dir = tempdir().unwrap();
        let recorder = FallbackRecorder::open(dir.path().join("buffer.jsonl")).unwrap();

        assert_eq!(recorder.record(content("p-1")).await.unwrap(), 1);
        assert_eq!(recorder.record(content("p-2")).await.unwrap(), 2);

        let pending = recorder.pending().await;
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|e| e.chain_state == ChainState::Unchained
                && e.state == FallbackState::PendingFallback));
    }

    #[tokio::test]
    async fn test_buffer_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let captured = content("p-1");
        {
            let recorder = FallbackRecorder::open(&path).unwrap();
            recorder.record(captured.clone()).await.unwrap();
            recorder.record(content("p-2")).await.unwrap();
        }

        let reopened = FallbackRecorder::open(&path).unwrap();
        let pending = reopened.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].content, captured);
        assert_eq!(reopened.record(content("p-3")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remove_rewrites_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        let recorder = FallbackRecorder::open(&path).unwrap();
        for i in 0..3 {
            recorder.record(content(&format!("p-{}", i))).await.unwrap();
        }

        let removed = recorder.remove(1).await.unwrap().unwrap();
        assert_eq!(removed.state, FallbackState::Reconciled);
        assert!(recorder.remove(1).await.unwrap().is_none());

        let reopened = FallbackRecorder::open(&path).unwrap();
        let sequences: Vec<u64> = reopened
            .pending()
            .await
            .iter()
            .map(|e| e.local_sequence)
            .collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.jsonl");
        fs::write(&path, "{not json}\n").unwrap();

        assert!(matches!(
            FallbackRecorder::open(&path),
            Err(AuditError::Fallback(_))
        ));
    }
}
