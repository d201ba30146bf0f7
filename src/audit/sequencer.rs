//! Serialized appends onto the chain tail.
//!
//! The store only accepts an insert whose `previous_hash` is still the
//! tail, so writers in other processes cannot fork the chain. Callers in
//! this process additionally queue on `append_lock`.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::audit::chain::PreparedEntry;
use crate::audit::entry::{AuditLogEntry, ChainLink, GENESIS_HASH};
use crate::database::{bounded, AuditStore, InsertOutcome};
use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSettings {
    pub store_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for AppendSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            max_retries: 5,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Clone)]
pub struct SequenceCoordinator {
    store: Arc<dyn AuditStore>,
    settings: AppendSettings,
    append_lock: Arc<Mutex<()>>,
}

impl SequenceCoordinator {
    pub fn new(store: Arc<dyn AuditStore>, settings: AppendSettings) -> Self {
        Self {
            store,
            settings,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Chain `prepared` onto the current tail and persist it.
    ///
    /// The work runs in its own task: dropping the returned future does not
    /// abort an insert that is already in flight.
    pub async fn append(&self, prepared: PreparedEntry) -> Result<AuditLogEntry, AuditError> {
        let this = self.clone();
        tokio::spawn(async move { this.append_serialized(prepared).await })
            .await
            .map_err(|e| AuditError::Interrupted(e.to_string()))?
    }

    async fn append_serialized(&self, prepared: PreparedEntry) -> Result<AuditLogEntry, AuditError> {
        let _guard = self.append_lock.lock().await;
        let attempts = self.settings.max_retries.max(1);

        for attempt in 1..=attempts {
            // Never trust a cached tail.
            let tail = bounded(self.settings.store_timeout, self.store.last_entry()).await?;
            let previous_hash = tail
                .map(|e| e.hash)
                .unwrap_or_else(|| GENESIS_HASH.to_string());

            let link = ChainLink {
                hash: prepared.hash_after(&previous_hash),
                content: prepared.content.clone(),
                idempotency_key: prepared.idempotency_key.clone(),
                previous_hash,
            };

            match bounded(self.settings.store_timeout, self.store.insert(&link)).await? {
                InsertOutcome::Appended(entry) => {
                    debug!("Appended audit entry: {}", entry.summary());
                    return Ok(entry);
                }
                InsertOutcome::Duplicate(entry) => {
                    debug!(
                        sequence = entry.sequence,
                        "Idempotency key already stored, returning existing entry"
                    );
                    return Ok(entry);
                }
                InsertOutcome::Conflict { tail_hash } => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        tail = %tail_hash,
                        "Lost race for chain tail, retrying"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(AuditError::WriteConflict { attempts })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_backoff.as_millis() as u64 * u64::from(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
        Duration::from_millis(base + jitter)
    }
}
