//! Audit store adapter.
//!
//! The persistent log is reached through [`AuditStore`]. The store only
//! appends and reads; there is deliberately no update or delete call.

pub mod memory;
pub mod models;
pub mod queries;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::audit::entry::{ActionType, AuditLogEntry, ChainLink, Severity, Status};
use chrono::{DateTime, SubsecRound, Utc};

pub use memory::MemoryAuditStore;
pub use models::{Incident, NewIncident};
pub use queries::SqliteAuditStore;

/// Largest page a single query may return.
pub const MAX_PAGE_SIZE: u64 = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Backend(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => Self::Unavailable(format!("I/O error: {}", e)),
            sqlx::Error::Tls(e) => Self::Unavailable(format!("TLS error: {}", e)),
            sqlx::Error::PoolTimedOut => Self::Unavailable("connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Unavailable("connection pool closed".to_string()),
            sqlx::Error::WorkerCrashed => Self::Unavailable("database worker crashed".to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Await a store call with an upper bound.
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Result of a conditional insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Linked onto the tail and persisted.
    Appended(AuditLogEntry),
    /// The idempotency key was already stored; nothing new was written.
    Duplicate(AuditLogEntry),
    /// `previous_hash` no longer names the tail.
    Conflict { tail_hash: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters for browsing the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCriteria {
    pub actor_id: Option<String>,
    pub action_type: Option<ActionType>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<Status>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: u64,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            actor_id: None,
            action_type: None,
            resource_type: None,
            resource_id: None,
            severity: None,
            status: None,
            from: None,
            to: None,
            order: SortOrder::Desc,
            offset: 0,
            limit: 50,
        }
    }
}

impl SearchCriteria {
    pub fn effective_limit(&self) -> u64 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// Same filters, different window.
    pub fn page(&self, order: SortOrder, offset: u64, limit: u64) -> Self {
        Self {
            order,
            offset,
            limit,
            ..self.clone()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        let c = &entry.content;
        self.actor_id.as_ref().map_or(true, |v| &c.actor.user_id == v)
            && self.action_type.map_or(true, |v| c.action_type == v)
            && self.resource_type.as_ref().map_or(true, |v| &c.resource_type == v)
            && self.resource_id.as_ref().map_or(true, |v| &c.resource_id == v)
            && self.severity.map_or(true, |v| c.severity == v)
            && self.status.map_or(true, |v| c.status == v)
            && self.from.map_or(true, |v| c.timestamp >= v.trunc_subsecs(6))
            && self.to.map_or(true, |v| c.timestamp <= v.trunc_subsecs(6))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Cheap round trip used to confirm connectivity before reconciliation.
    async fn ping(&self) -> StoreResult<()>;

    /// Entry with the greatest sequence, or `None` for an empty chain.
    async fn last_entry(&self) -> StoreResult<Option<AuditLogEntry>>;

    /// Persist `link` only if its `previous_hash` is the current tail.
    /// Deduplicated by `idempotency_key`.
    async fn insert(&self, link: &ChainLink) -> StoreResult<InsertOutcome>;

    /// Greatest entry strictly before `sequence`.
    async fn entry_before(&self, sequence: i64) -> StoreResult<Option<AuditLogEntry>>;

    /// Ascending entries with `sequence > after_sequence`, optionally capped
    /// at `until_sequence` (inclusive).
    async fn scan(
        &self,
        after_sequence: i64,
        until_sequence: Option<i64>,
        limit: u64,
    ) -> StoreResult<Vec<AuditLogEntry>>;

    async fn query(&self, criteria: &SearchCriteria) -> StoreResult<Page<AuditLogEntry>>;

    /// Open an incident, or return the pending one with the same fingerprint.
    async fn open_incident(&self, incident: NewIncident) -> StoreResult<Incident>;

    async fn pending_incidents(&self) -> StoreResult<Vec<Incident>>;

    /// Returns `None` when no pending incident has this id.
    async fn acknowledge_incident(
        &self,
        id: i64,
        acknowledged_by: &str,
        note: &str,
    ) -> StoreResult<Option<Incident>>;
}
