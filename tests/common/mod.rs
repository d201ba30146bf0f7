#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use fiscal_audit::audit::alert::{Alert, AlertError, AlertSink};
use fiscal_audit::audit::entry::{ActionType, Actor, AuditLogEntry, ChainLink, LogRequest, Operation, Severity};
use fiscal_audit::audit::{AlertDispatcher, AuditTrail, FallbackRecorder};
use fiscal_audit::config::AuditSettings;
use fiscal_audit::database::{
    AuditStore, Incident, InsertOutcome, NewIncident, Page, SearchCriteria, SqliteAuditStore,
    StoreError, StoreResult,
};

/// Migrated private in-memory SQLite store.
pub async fn sqlite_store() -> SqliteAuditStore {
    let store = SqliteAuditStore::connect_in_memory()
        .await
        .expect("Failed to create test database");
    store.run_migrations().await.expect("Failed to migrate test database");
    store
}

pub fn clerk() -> Actor {
    Actor::new("u-17", "Ana Ruiz", "BUDGET_OFFICER", "finance/budget")
}

pub fn budget_request(resource_id: &str, operation: Operation) -> LogRequest {
    LogRequest::new(clerk(), ActionType::BudgetModified, "budget", resource_id, operation)
}

pub fn test_settings() -> AuditSettings {
    AuditSettings {
        store_timeout_ms: 1_000,
        max_append_retries: 32,
        retry_backoff_ms: 1,
        verify_page_size: 7,
        report_max_entries: 10_000,
    }
}

/// Forwards every alert into a channel.
pub struct RecordingSink(pub mpsc::UnboundedSender<Alert>);

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let _ = self.0.send(alert.clone());
        Ok(())
    }
}

pub fn recording_dispatcher(
    min_severity: Severity,
) -> (AlertDispatcher, mpsc::UnboundedReceiver<Alert>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = AlertDispatcher::new(min_severity, Duration::from_secs(1))
        .with_sink(Arc::new(RecordingSink(tx)));
    (dispatcher, rx)
}

/// Wraps a store and fails every call while switched off.
pub struct FlakyStore<S> {
    pub inner: S,
    available: AtomicBool,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl<S: AuditStore> AuditStore for FlakyStore<S> {
    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.ping().await
    }

    async fn last_entry(&self) -> StoreResult<Option<AuditLogEntry>> {
        self.check()?;
        self.inner.last_entry().await
    }

    async fn insert(&self, link: &ChainLink) -> StoreResult<InsertOutcome> {
        self.check()?;
        self.inner.insert(link).await
    }

    async fn entry_before(&self, sequence: i64) -> StoreResult<Option<AuditLogEntry>> {
        self.check()?;
        self.inner.entry_before(sequence).await
    }

    async fn scan(
        &self,
        after_sequence: i64,
        until_sequence: Option<i64>,
        limit: u64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        self.check()?;
        self.inner.scan(after_sequence, until_sequence, limit).await
    }

    async fn query(&self, criteria: &SearchCriteria) -> StoreResult<Page<AuditLogEntry>> {
        self.check()?;
        self.inner.query(criteria).await
    }

    async fn open_incident(&self, incident: NewIncident) -> StoreResult<Incident> {
        self.check()?;
        self.inner.open_incident(incident).await
    }

    async fn pending_incidents(&self) -> StoreResult<Vec<Incident>> {
        self.check()?;
        self.inner.pending_incidents().await
    }

    async fn acknowledge_incident(
        &self,
        id: i64,
        acknowledged_by: &str,
        note: &str,
    ) -> StoreResult<Option<Incident>> {
        self.check()?;
        self.inner.acknowledge_incident(id, acknowledged_by, note).await
    }
}

/// Trail over `store` with a fallback buffer in a fresh temp dir.
pub struct Harness {
    pub trail: Arc<AuditTrail>,
    pub dir: TempDir,
}

pub fn harness(store: Arc<dyn AuditStore>, alerts: AlertDispatcher) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let fallback = Arc::new(
        FallbackRecorder::open(dir.path().join("fallback.jsonl"))
            .expect("Failed to open fallback buffer"),
    );
    let trail = Arc::new(AuditTrail::new(store, fallback, alerts, &test_settings()));
    Harness { trail, dir }
}

pub fn silent_alerts() -> AlertDispatcher {
    AlertDispatcher::new(Severity::Critical, Duration::from_secs(1))
}
