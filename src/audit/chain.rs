//! Hash-chain primitives.
//!
//! Hash input layout: canonical content bytes followed by the previous
//! entry's hash as 64 ASCII hex characters. The stored `hash` field is
//! never part of its own input.

use sha2::{Digest, Sha256};

use crate::audit::canonical::canonicalize;
use crate::audit::entry::EntryContent;
use crate::error::AuditError;

/// SHA-256 over `canonical || previous_hash`, lowercase hex.
pub fn compute_hash(canonical: &[u8], previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of the content alone, used as the insert idempotency key.
pub fn content_digest(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

/// 64 lowercase hex characters.
pub fn is_valid_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Content that has been canonicalized once and can be chained any number
/// of times (each retry re-links it to a freshly read tail).
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub content: EntryContent,
    pub canonical: Vec<u8>,
    pub idempotency_key: String,
}

impl PreparedEntry {
    pub fn prepare(content: EntryContent) -> Result<Self, AuditError> {
        let canonical = canonicalize(&content)?;
        let idempotency_key = content_digest(&canonical);
        Ok(Self {
            content,
            canonical,
            idempotency_key,
        })
    }

    pub fn hash_after(&self, previous_hash: &str) -> String {
        compute_hash(&self.canonical, previous_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActionType, Actor, LogRequest, Operation, GENESIS_HASH};

    #[test]
    fn test_hash_is_deterministic() {
        let a = compute_hash(b"{\"k\":1}", GENESIS_HASH);
        let b = compute_hash(b"{\"k\":1}", GENESIS_HASH);
        assert_eq!(a, b);
        assert!(is_valid_digest(&a));
    }

    #[test]
    fn test_hash_depends_on_previous() {
        let other_prev = "f".repeat(64);
        assert_ne!(
            compute_hash(b"payload", GENESIS_HASH),
            compute_hash(b"payload", &other_prev)
        );
    }

    #[test]
    fn test_hash_matches_concatenation() {
        let mut joined = b"abc".to_vec();
        joined.extend_from_slice(GENESIS_HASH.as_bytes());
        assert_eq!(compute_hash(b"abc", GENESIS_HASH), content_digest(&joined));
    }

    #[test]
    fn test_genesis_is_valid_digest() {
        assert!(is_valid_digest(GENESIS_HASH));
        assert!(!is_valid_digest("ABCDEF"));
        assert!(!is_valid_digest(&"G".repeat(64)));
    }

    #[test]
    fn test_prepared_entry_key_is_content_only() {
        let content = LogRequest::new(
            Actor::new("u-3", "Auditor", "AUDITOR", "control"),
            ActionType::ReportExported,
            "report",
            "r-2024",
            Operation::Export,
        )
        .into_content();

        let prepared = PreparedEntry::prepare(content.clone()).unwrap();
        let again = PreparedEntry::prepare(content).unwrap();
        assert_eq!(prepared.idempotency_key, again.idempotency_key);
        assert_ne!(
            prepared.hash_after(GENESIS_HASH),
            prepared.hash_after(&"1".repeat(64))
        );
    }
}
