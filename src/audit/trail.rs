//! Audit Trail facade
//!
//! The single write path (`log`) plus the read, verification,
//! reconciliation and incident operations built on top of the store.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::alert::AlertDispatcher;
use crate::audit::chain::PreparedEntry;
use crate::audit::entry::{ActionType, Actor, AuditLogEntry, LogRequest, Operation};
use crate::audit::fallback::{FallbackEntry, FallbackRecorder};
use crate::audit::report::{AuditReport, Reporter};
use crate::audit::sequencer::SequenceCoordinator;
use crate::audit::verify::{IntegrityVerifier, SequenceRange, VerificationReport};
use crate::config::AuditSettings;
use crate::database::{bounded, AuditStore, Incident, NewIncident, Page, SearchCriteria};
use crate::error::AuditError;

/// What `log` did with an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LogOutcome {
    Recorded(AuditLogEntry),
    /// The store was unreachable; the entry waits in the fallback buffer.
    Degraded { local_sequence: u64 },
}

impl LogOutcome {
    pub fn entry(&self) -> Option<&AuditLogEntry> {
        match self {
            Self::Recorded(entry) => Some(entry),
            Self::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledEntry {
    pub local_sequence: u64,
    pub sequence: i64,
    pub entry_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub reconciled: Vec<ReconciledEntry>,
    pub remaining: usize,
    /// Why the pass stopped early, if it did.
    pub error: Option<String>,
}

pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    coordinator: SequenceCoordinator,
    verifier: IntegrityVerifier,
    reporter: Reporter,
    fallback: Arc<FallbackRecorder>,
    alerts: AlertDispatcher,
    store_timeout: Duration,
}

impl AuditTrail {
    pub fn new(
        store: Arc<dyn AuditStore>,
        fallback: Arc<FallbackRecorder>,
        alerts: AlertDispatcher,
        settings: &AuditSettings,
    ) -> Self {
        let store_timeout = settings.store_timeout();
        Self {
            coordinator: SequenceCoordinator::new(store.clone(), settings.append_settings()),
            verifier: IntegrityVerifier::new(store.clone(), settings.verify_page_size, store_timeout),
            reporter: Reporter::new(store.clone(), store_timeout, settings.report_max_entries),
            store,
            fallback,
            alerts,
            store_timeout,
        }
    }

    /// Record an auditable operation.
    ///
    /// Content that cannot be canonicalized is rejected outright. A store
    /// outage is absorbed by the fallback buffer and reported as
    /// [`LogOutcome::Degraded`]; every other failure is returned.
    pub async fn log(&self, request: LogRequest) -> Result<LogOutcome, AuditError> {
        let prepared = PreparedEntry::prepare(request.into_content())?;

        match self.coordinator.append(prepared.clone()).await {
            Ok(entry) => {
                self.alerts.notify_appended(&entry);
                Ok(LogOutcome::Recorded(entry))
            }
            Err(e) if e.is_unavailable() => {
                warn!("Audit store unavailable ({}), switching to degraded mode", e);
                let local_sequence = self.fallback.record(prepared.content).await?;
                Ok(LogOutcome::Degraded { local_sequence })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Page<AuditLogEntry>, AuditError> {
        self.reporter.search(criteria).await
    }

    pub async fn generate_report(&self, criteria: SearchCriteria) -> Result<AuditReport, AuditError> {
        self.reporter.generate_report(criteria).await
    }

    /// Verify the stored chain. A failed verification opens an incident
    /// (or reuses the pending one for the same breaks) and raises a
    /// CRITICAL alert; the report is returned either way.
    pub async fn verify_integrity(
        &self,
        range: Option<SequenceRange>,
    ) -> Result<VerificationReport, AuditError> {
        let report = self.verifier.verify(range).await?;
        if report.is_valid {
            return Ok(report);
        }

        for link in &report.broken_links {
            error!(
                sequence = link.sequence,
                entry_id = %link.entry_id,
                kind = ?link.kind,
                expected = %link.expected,
                actual = %link.actual,
                "Audit chain integrity violation"
            );
        }

        let incident = bounded(
            self.store_timeout,
            self.store.open_incident(NewIncident::from_report(&report)),
        )
        .await?;
        error!(
            incident = incident.id,
            "{} (pending acknowledgement)",
            report.summary()
        );
        self.alerts.notify_violation(&report);

        Ok(report)
    }

    /// Chain buffered entries into the store, oldest first. Stops at the
    /// first failure; whatever is left stays buffered for the next pass.
    pub async fn reconcile_fallback(&self) -> Result<ReconcileReport, AuditError> {
        let _guard = self.fallback.reconcile_guard().await;
        let pending = self.fallback.pending().await;
        if pending.is_empty() {
            return Ok(ReconcileReport::default());
        }

        bounded(self.store_timeout, self.store.ping()).await?;
        info!("Reconciling {} fallback entries", pending.len());

        let mut report = ReconcileReport::default();
        for buffered in pending {
            let local_sequence = buffered.local_sequence;
            let outcome = match PreparedEntry::prepare(buffered.content) {
                Ok(prepared) => self.coordinator.append(prepared).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(entry) => {
                    self.fallback.remove(local_sequence).await?;
                    self.alerts.notify_appended(&entry);
                    report.reconciled.push(ReconciledEntry {
                        local_sequence,
                        sequence: entry.sequence,
                        entry_id: entry.entry_id(),
                    });
                }
                Err(e) => {
                    warn!(local_sequence, "Reconciliation stopped: {}", e);
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.remaining = self.fallback.len().await;
        info!(
            reconciled = report.reconciled.len(),
            remaining = report.remaining,
            "Fallback reconciliation pass finished"
        );
        Ok(report)
    }

    pub async fn pending_fallback(&self) -> Vec<FallbackEntry> {
        self.fallback.pending().await
    }

    pub async fn pending_incidents(&self) -> Result<Vec<Incident>, AuditError> {
        Ok(bounded(self.store_timeout, self.store.pending_incidents()).await?)
    }

    /// Close a pending incident. The acknowledgement is itself chained.
    pub async fn acknowledge_incident(
        &self,
        id: i64,
        actor: Actor,
        note: &str,
    ) -> Result<Incident, AuditError> {
        let incident = bounded(
            self.store_timeout,
            self.store.acknowledge_incident(id, &actor.user_id, note),
        )
        .await?
        .ok_or_else(|| AuditError::NotFound(format!("no pending integrity incident {}", id)))?;

        let request = LogRequest::new(
            actor,
            ActionType::IntegrityIncidentAcknowledged,
            "integrity_incident",
            id.to_string(),
            Operation::Approve,
        )
        .summary(format!(
            "acknowledged {} broken link(s): {}",
            incident.broken_links.len(),
            note
        ))
        .metadata("fingerprint", incident.fingerprint.clone())
        .metadata("total_checked", incident.total_checked);
        self.log(request).await?;

        info!(incident = id, "Integrity incident acknowledged");
        Ok(incident)
    }

    pub async fn export_chain<W: Write>(
        &self,
        writer: &mut W,
        range: Option<SequenceRange>,
    ) -> Result<u64, AuditError> {
        self.reporter.export_chain(writer, range).await
    }
}
