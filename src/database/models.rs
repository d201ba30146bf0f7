use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::StoreError;
use crate::audit::entry::{parse_label, Actor, AuditLogEntry, EntryContent};
use crate::audit::verify::{BrokenLink, VerificationReport};

/// Fixed-width UTC text, so lexical order equals time order in SQL.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditLogRow {
    pub sequence: i64,
    pub entry_id: String,
    pub idempotency_key: String,
    pub timestamp: String,
    pub actor_user_id: String,
    pub actor_name: String,
    pub actor_role: String,
    pub actor_org_unit: String,
    pub action_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: String,
    pub old_values: Option<String>,
    pub new_values: Option<String>,
    pub changes_summary: String,
    pub severity: String,
    pub status: String,
    pub error_message: Option<String>,
    pub metadata: String,
    pub previous_hash: String,
    pub hash: String,
}

fn corrupt(field: &str, sequence: i64, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("entry #{} field {}: {}", sequence, field, err))
}

fn parse_json(raw: Option<&str>, field: &str, sequence: i64) -> Result<Option<Value>, StoreError> {
    raw.map(|text| serde_json::from_str(text).map_err(|e| corrupt(field, sequence, e)))
        .transpose()
}

impl TryFrom<AuditLogRow> for AuditLogEntry {
    type Error = StoreError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        let seq = row.sequence;
        let metadata: Map<String, Value> =
            serde_json::from_str(&row.metadata).map_err(|e| corrupt("metadata", seq, e))?;

        let content = EntryContent {
            entry_id: Uuid::parse_str(&row.entry_id).map_err(|e| corrupt("entry_id", seq, e))?,
            timestamp: parse_timestamp(&row.timestamp)?,
            actor: Actor {
                user_id: row.actor_user_id,
                name: row.actor_name,
                role: row.actor_role,
                org_unit: row.actor_org_unit,
            },
            action_type: parse_label(&row.action_type)
                .map_err(|e| corrupt("action_type", seq, e))?,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            operation: parse_label(&row.operation).map_err(|e| corrupt("operation", seq, e))?,
            old_values: parse_json(row.old_values.as_deref(), "old_values", seq)?,
            new_values: parse_json(row.new_values.as_deref(), "new_values", seq)?,
            changes_summary: row.changes_summary,
            severity: parse_label(&row.severity).map_err(|e| corrupt("severity", seq, e))?,
            status: parse_label(&row.status).map_err(|e| corrupt("status", seq, e))?,
            error_message: row.error_message,
            metadata,
        };

        Ok(AuditLogEntry {
            sequence: seq,
            content,
            idempotency_key: row.idempotency_key,
            previous_hash: row.previous_hash,
            hash: row.hash,
        })
    }
}

/// A failed verification waiting for a human to acknowledge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub total_checked: u64,
    pub broken_links: Vec<BrokenLink>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Incident {
    pub fn is_pending(&self) -> bool {
        self.acknowledged_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub total_checked: u64,
    pub broken_links: Vec<BrokenLink>,
}

impl NewIncident {
    pub fn from_report(report: &VerificationReport) -> Self {
        Self {
            fingerprint: report.fingerprint(),
            detected_at: report.verified_at,
            total_checked: report.total_checked,
            broken_links: report.broken_links.clone(),
        }
    }

    pub fn into_incident(self, id: i64) -> Incident {
        Incident {
            id,
            fingerprint: self.fingerprint,
            detected_at: self.detected_at,
            total_checked: self.total_checked,
            broken_links: self.broken_links,
            acknowledged_by: None,
            acknowledged_at: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IncidentRow {
    pub id: i64,
    pub fingerprint: String,
    pub detected_at: String,
    pub total_checked: i64,
    pub broken_links: String,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<String>,
    pub note: Option<String>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = StoreError;

    fn try_from(row: IncidentRow) -> Result<Self, Self::Error> {
        let broken_links = serde_json::from_str(&row.broken_links)
            .map_err(|e| StoreError::Corrupt(format!("incident {} broken_links: {}", row.id, e)))?;

        Ok(Incident {
            id: row.id,
            fingerprint: row.fingerprint,
            detected_at: parse_timestamp(&row.detected_at)?,
            total_checked: row.total_checked.max(0) as u64,
            broken_links,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at.as_deref().map(parse_timestamp).transpose()?,
            note: row.note,
        })
    }
}
