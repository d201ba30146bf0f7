//! Audit Log Verification
//!
//! Replays a stored or exported chain and reports every break.
//!
//! Cascade policy: after a break the walker resets its baseline to the
//! stored hash of the offending entry. A deleted entry therefore shows up
//! as exactly one chain break (at its successor) and an edited entry as
//! exactly one content break, instead of flagging the whole remainder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::canonical::canonicalize;
use crate::audit::chain::{compute_hash, is_valid_digest};
use crate::audit::entry::{AuditLogEntry, GENESIS_HASH};
use crate::database::{bounded, AuditStore};
use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakKind {
    /// Stored hash does not match the recomputed one: the entry was edited.
    Content,
    /// previous_hash does not match the predecessor: deletion, insertion or reordering.
    Chain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub sequence: i64,
    pub entry_id: Uuid,
    pub kind: BreakKind,
    pub expected: String,
    pub actual: String,
}

/// Inclusive bounds on store sequence numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl SequenceRange {
    pub fn between(from: i64, to: i64) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub is_valid: bool,
    pub broken_links: Vec<BrokenLink>,
    pub total_checked: u64,
    pub first_sequence: Option<i64>,
    pub last_sequence: Option<i64>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn ensure_valid(&self) -> Result<(), AuditError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(AuditError::IntegrityViolation {
                broken_links: self.broken_links.len(),
                total_checked: self.total_checked,
            })
        }
    }

    /// Stable identity of the set of breaks, used to avoid opening the same
    /// incident twice.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for link in &self.broken_links {
            hasher.update(link.sequence.to_le_bytes());
            hasher.update(link.entry_id.as_bytes());
            hasher.update([link.kind as u8]);
            hasher.update(link.actual.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn summary(&self) -> String {
        if self.is_valid {
            format!("Audit chain is valid ({} entries)", self.total_checked)
        } else {
            format!(
                "Audit chain is BROKEN: {} broken link(s) in {} entries",
                self.broken_links.len(),
                self.total_checked
            )
        }
    }
}

/// Walks entries in ascending order, recording every break.
pub struct ChainWalker {
    expected_previous: String,
    broken_links: Vec<BrokenLink>,
    total_checked: u64,
    first_sequence: Option<i64>,
    last_sequence: Option<i64>,
}

impl ChainWalker {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            expected_previous: seed.into(),
            broken_links: Vec::new(),
            total_checked: 0,
            first_sequence: None,
            last_sequence: None,
        }
    }

    pub fn from_genesis() -> Self {
        Self::new(GENESIS_HASH)
    }

    pub fn check(&mut self, entry: &AuditLogEntry) {
        if entry.previous_hash != self.expected_previous {
            self.broken_links.push(BrokenLink {
                sequence: entry.sequence,
                entry_id: entry.entry_id(),
                kind: BreakKind::Chain,
                expected: self.expected_previous.clone(),
                actual: entry.previous_hash.clone(),
            });
        }

        let recomputed = match canonicalize(&entry.content) {
            Ok(bytes) => compute_hash(&bytes, &entry.previous_hash),
            Err(e) => format!("<not canonicalizable: {}>", e),
        };
        if recomputed != entry.hash {
            self.broken_links.push(BrokenLink {
                sequence: entry.sequence,
                entry_id: entry.entry_id(),
                kind: BreakKind::Content,
                expected: recomputed,
                actual: entry.hash.clone(),
            });
        }

        self.expected_previous = entry.hash.clone();
        self.total_checked += 1;
        self.first_sequence.get_or_insert(entry.sequence);
        self.last_sequence = Some(entry.sequence);
    }

    pub fn finish(self) -> VerificationReport {
        VerificationReport {
            is_valid: self.broken_links.is_empty(),
            broken_links: self.broken_links,
            total_checked: self.total_checked,
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
            verified_at: Utc::now(),
        }
    }
}

/// Verify a complete chain held in memory, starting from genesis.
pub fn verify_entries(entries: &[AuditLogEntry]) -> VerificationReport {
    let mut walker = ChainWalker::from_genesis();
    for entry in entries {
        walker.check(entry);
    }
    walker.finish()
}

/// Load an exported chain (one JSON entry per line).
pub fn load_export(path: &Path) -> Result<Vec<AuditLogEntry>, AuditError> {
    let file = File::open(path)
        .map_err(|e| AuditError::NotFound(format!("{}: {}", path.display(), e)))?;

    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            AuditError::serialization(format!("failed to read line {}: {}", line_num + 1, e))
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: AuditLogEntry = serde_json::from_str(&line).map_err(|e| {
            AuditError::serialization(format!("failed to parse line {}: {}", line_num + 1, e))
        })?;
        let digests = [
            ("hash", &entry.hash),
            ("previous_hash", &entry.previous_hash),
            ("idempotency_key", &entry.idempotency_key),
        ];
        if let Some((field, _)) = digests.iter().find(|(_, v)| !is_valid_digest(v)) {
            return Err(AuditError::serialization(format!(
                "line {}: {} is not a SHA-256 hex digest",
                line_num + 1,
                field
            )));
        }
        entries.push(entry);
    }

    debug!("Loaded {} entries from {}", entries.len(), path.display());
    Ok(entries)
}

/// Verifies the chain held by an [`AuditStore`], page by page.
#[derive(Clone)]
pub struct IntegrityVerifier {
    store: Arc<dyn AuditStore>,
    page_size: u64,
    timeout: Duration,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn AuditStore>, page_size: u64, timeout: Duration) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            timeout,
        }
    }

    pub async fn verify(
        &self,
        range: Option<SequenceRange>,
    ) -> Result<VerificationReport, AuditError> {
        let range = range.unwrap_or_default();

        // A window that starts mid-chain is seeded from the entry just before it.
        let (seed, mut cursor) = match range.from {
            Some(from) if from > 1 => {
                let before = bounded(self.timeout, self.store.entry_before(from)).await?;
                let seed = before
                    .map(|e| e.hash)
                    .unwrap_or_else(|| GENESIS_HASH.to_string());
                (seed, from - 1)
            }
            _ => (GENESIS_HASH.to_string(), 0),
        };

        let mut walker = ChainWalker::new(seed);
        loop {
            let page = bounded(
                self.timeout,
                self.store.scan(cursor, range.to, self.page_size),
            )
            .await?;

            let Some(last) = page.last() else { break };
            cursor = last.sequence;
            for entry in &page {
                walker.check(entry);
            }
            if (page.len() as u64) < self.page_size {
                break;
            }
        }

        let report = walker.finish();
        if report.is_valid {
            info!("Audit chain verified: {} entries", report.total_checked);
        } else {
            warn!(
                broken = report.broken_links.len(),
                checked = report.total_checked,
                "Audit chain verification found breaks"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::PreparedEntry;
    use crate::audit::entry::{ActionType, Actor, ChainLink, LogRequest, Operation};
    use crate::database::{AuditStore, InsertOutcome, MemoryAuditStore};
    use serde_json::json;

    fn build_chain(len: usize) -> Vec<AuditLogEntry> {
        let mut entries = Vec::new();
        let mut prev = GENESIS_HASH.to_string();
        for i in 0..len {
            let content = LogRequest::new(
                Actor::new("u-9", "Controller", "CONTROLLER", "finance"),
                ActionType::ExpenditureApproved,
                "expenditure",
                format!("exp-{}", i),
                Operation::Approve,
            )
            .new_values(&json!({"amount": 100 * (i + 1)}))
            .unwrap()
            .into_content();
            let prepared = PreparedEntry::prepare(content).unwrap();
            let link = ChainLink {
                hash: prepared.hash_after(&prev),
                content: prepared.content,
                idempotency_key: prepared.idempotency_key,
                previous_hash: prev.clone(),
            };
            prev = link.hash.clone();
            entries.push(link.into_entry(i as i64 + 1));
        }
        entries
    }

    #[test]
    fn test_intact_chain_is_valid() {
        let report = verify_entries(&build_chain(6));
        assert!(report.is_valid);
        assert_eq!(report.total_checked, 6);
        assert_eq!(report.first_sequence, Some(1));
        assert_eq!(report.last_sequence, Some(6));
        assert!(report.ensure_valid().is_ok());
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let report = verify_entries(&[]);
        assert!(report.is_valid);
        assert_eq!(report.total_checked, 0);
    }

    #[test]
    fn test_edit_reports_single_content_break() {
        let mut entries = build_chain(5);
        entries[2].content.new_values = Some(json!({"amount": 999_999}));

        let report = verify_entries(&entries);
        assert!(!report.is_valid);
        assert_eq!(report.broken_links.len(), 1);
        let link = &report.broken_links[0];
        assert_eq!(link.sequence, 3);
        assert_eq!(link.kind, BreakKind::Content);
        assert_eq!(link.actual, entries[2].hash);
    }

    #[test]
    fn test_deletion_resets_baseline() {
        let mut entries = build_chain(6);
        let removed = entries.remove(2); // sequence 3

        let report = verify_entries(&entries);
        assert_eq!(report.broken_links.len(), 1);
        let link = &report.broken_links[0];
        assert_eq!(link.sequence, 4);
        assert_eq!(link.kind, BreakKind::Chain);
        assert_eq!(link.expected, entries[1].hash);
        assert_eq!(link.actual, removed.hash);
        assert!(matches!(
            report.ensure_valid(),
            Err(AuditError::IntegrityViolation { broken_links: 1, .. })
        ));
    }

    #[test]
    fn test_swapped_entries_are_flagged() {
        let mut entries = build_chain(4);
        entries.swap(1, 2);

        let report = verify_entries(&entries);
        assert!(!report.is_valid);
        assert!(report
            .broken_links
            .iter()
            .all(|l| l.kind == BreakKind::Chain));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let mut entries = build_chain(3);
        entries[1].content.changes_summary = "rewritten".to_string();
        let a = verify_entries(&entries);
        let b = verify_entries(&entries);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    fn write_export(dir: &tempfile::TempDir, entries: &[AuditLogEntry]) -> std::path::PathBuf {
        let path = dir.path().join("export.jsonl");
        let lines: Vec<String> = entries
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn test_export_loads_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let entries = build_chain(4);
        let loaded = load_export(&write_export(&dir, &entries)).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!(verify_entries(&loaded).is_valid);
    }

    #[test]
    fn test_export_with_malformed_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = build_chain(3);
        entries[1].previous_hash = entries[1].previous_hash.to_uppercase();
        entries[2].hash.truncate(40);

        let err = load_export(&write_export(&dir, &entries)).unwrap_err();
        match err {
            AuditError::Serialization(msg) => {
                assert!(msg.contains("line 2"), "{}", msg);
                assert!(msg.contains("previous_hash"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_export_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_export(&dir.path().join("absent.jsonl")),
            Err(AuditError::NotFound(_))
        ));
    }

    async fn store_with(entries: &[AuditLogEntry]) -> Arc<MemoryAuditStore> {
        let store = Arc::new(MemoryAuditStore::new());
        for entry in entries {
            let link = ChainLink {
                content: entry.content.clone(),
                idempotency_key: entry.idempotency_key.clone(),
                previous_hash: entry.previous_hash.clone(),
                hash: entry.hash.clone(),
            };
            assert!(matches!(
                store.insert(&link).await.unwrap(),
                InsertOutcome::Appended(_)
            ));
        }
        store
    }

    #[tokio::test]
    async fn test_store_verification_pages_through_chain() {
        let store = store_with(&build_chain(7)).await;
        let verifier = IntegrityVerifier::new(store, 3, Duration::from_secs(1));

        let report = verifier.verify(None).await.unwrap();
        assert!(report.is_valid);
        assert_eq!(report.total_checked, 7);
    }

    #[tokio::test]
    async fn test_bounded_range_is_seeded_from_predecessor() {
        let store = store_with(&build_chain(8)).await;
        let verifier = IntegrityVerifier::new(store, 2, Duration::from_secs(1));

        let report = verifier
            .verify(Some(SequenceRange::between(4, 6)))
            .await
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.total_checked, 3);
        assert_eq!(report.first_sequence, Some(4));
        assert_eq!(report.last_sequence, Some(6));
    }

    #[tokio::test]
    async fn test_store_tampering_is_detected() {
        let store = store_with(&build_chain(5)).await;
        store
            .tamper(|rows| rows[1].content.resource_id = "exp-forged".to_string())
            .await;
        let verifier = IntegrityVerifier::new(store, 10, Duration::from_secs(1));

        let report = verifier.verify(None).await.unwrap();
        assert_eq!(report.broken_links.len(), 1);
        assert_eq!(report.broken_links[0].sequence, 2);
        assert_eq!(report.broken_links[0].kind, BreakKind::Content);
    }
}
