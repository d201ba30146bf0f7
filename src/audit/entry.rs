//! Audit Log Entry
//!
//! Defines the structure for tamper-evident audit log entries and the
//! request type callers hand to the single `log()` entry point.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AuditError;

/// Previous hash of the first entry ever written to a chain.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Domain actions that must leave an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    // Budgets
    BudgetCreated,
    BudgetModified,
    BudgetApproved,
    BudgetRejected,

    // Expenditures
    ExpenditureCommitted,
    ExpenditureApproved,
    ExpenditureRejected,

    // Payments and treasury
    PaymentOrdered,
    PaymentExecuted,
    PaymentCancelled,
    TreasuryTransfer,
    BankReconciliation,

    // Fiscal exercise
    ExerciseClosed,
    ExerciseReopened,

    // Reporting
    ReportGenerated,
    ReportExported,

    // Backups
    BackupCreated,
    BackupRestored,

    // Security
    UserLogin,
    UserLoginFailed,
    PermissionChanged,
    FraudSuspected,
    SecurityEvent,

    // Audit trail itself
    IntegrityIncidentAcknowledged,
}

impl ActionType {
    /// Severity applied when the caller does not pick one.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::BudgetCreated
            | Self::BudgetModified
            | Self::ExpenditureCommitted
            | Self::ReportGenerated
            | Self::UserLogin => Severity::Low,
            Self::BudgetRejected
            | Self::ExpenditureRejected
            | Self::PaymentCancelled
            | Self::BankReconciliation
            | Self::ReportExported
            | Self::BackupCreated
            | Self::UserLoginFailed => Severity::Medium,
            Self::BudgetApproved
            | Self::ExpenditureApproved
            | Self::PaymentOrdered
            | Self::PaymentExecuted
            | Self::TreasuryTransfer
            | Self::ExerciseReopened
            | Self::PermissionChanged
            | Self::IntegrityIncidentAcknowledged => Severity::High,
            Self::ExerciseClosed
            | Self::BackupRestored
            | Self::FraudSuspected
            | Self::SecurityEvent => Severity::Critical,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&label(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Approve,
    Reject,
    Export,
    Print,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&label(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
    Partial,
}

/// Stored label of a unit enum (`"PAYMENT_EXECUTED"`, `"HIGH"`).
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

/// Parse a stored label back into its enum.
pub fn parse_label<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::String(raw.to_string()))
}

/// Who performed the audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub org_unit: String,
}

impl Actor {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        org_unit: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role: role.into(),
            org_unit: org_unit.into(),
        }
    }

    /// Actor used for entries the audit trail writes about itself.
    pub fn system() -> Self {
        Self::new("system", "Audit Trail", "SYSTEM", "internal-control")
    }
}

/// Every field that goes into the canonical form, and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryContent {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub action_type: ActionType,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Value>,
    pub changes_summary: String,
    pub severity: Severity,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EntryContent {
    pub fn summary(&self) -> String {
        format!(
            "{} {} {}:{} by {} ({})",
            self.action_type,
            label(&self.operation),
            self.resource_type,
            self.resource_id,
            self.actor.user_id,
            self.severity
        )
    }
}

/// A persisted, chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: i64,
    #[serde(flatten)]
    pub content: EntryContent,
    pub idempotency_key: String,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditLogEntry {
    pub fn entry_id(&self) -> Uuid {
        self.content.entry_id
    }

    pub fn severity(&self) -> Severity {
        self.content.severity
    }

    pub fn summary(&self) -> String {
        format!("#{} {}", self.sequence, self.content.summary())
    }
}

/// An entry ready for insertion: content plus its computed chain link.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub content: EntryContent,
    pub idempotency_key: String,
    pub previous_hash: String,
    pub hash: String,
}

impl ChainLink {
    pub fn into_entry(self, sequence: i64) -> AuditLogEntry {
        AuditLogEntry {
            sequence,
            content: self.content,
            idempotency_key: self.idempotency_key,
            previous_hash: self.previous_hash,
            hash: self.hash,
        }
    }
}

/// Inbound request to the sole write path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    pub actor: Actor,
    pub action_type: ActionType,
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub old_values: Option<Value>,
    #[serde(default)]
    pub new_values: Option<Value>,
    #[serde(default)]
    pub changes_summary: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_status() -> Status {
    Status::Success
}

impl LogRequest {
    pub fn new(
        actor: Actor,
        action_type: ActionType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            actor,
            action_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            operation,
            old_values: None,
            new_values: None,
            changes_summary: None,
            severity: None,
            status: Status::Success,
            error_message: None,
            metadata: Map::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.status = Status::Failure;
        self.error_message = Some(error_message.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.changes_summary = Some(summary.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Snapshot of the resource before the operation.
    pub fn old_values<T: Serialize>(mut self, snapshot: &T) -> Result<Self, AuditError> {
        self.old_values = Some(snapshot_value(snapshot)?);
        Ok(self)
    }

    /// Snapshot of the resource after the operation.
    pub fn new_values<T: Serialize>(mut self, snapshot: &T) -> Result<Self, AuditError> {
        self.new_values = Some(snapshot_value(snapshot)?);
        Ok(self)
    }

    /// Stamp the request into entry content.
    pub fn into_content(self) -> EntryContent {
        let severity = self
            .severity
            .unwrap_or_else(|| self.action_type.default_severity());
        let changes_summary = match self.changes_summary {
            Some(summary) => summary,
            None => summarize_changes(self.old_values.as_ref(), self.new_values.as_ref()),
        };

        EntryContent {
            entry_id: Uuid::new_v4(),
            // Microsecond precision survives the RFC 3339 round trip through the store.
            timestamp: Utc::now().trunc_subsecs(6),
            actor: self.actor,
            action_type: self.action_type,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            operation: self.operation,
            // An explicit null snapshot is the same as no snapshot.
            old_values: self.old_values.filter(|v| !v.is_null()),
            new_values: self.new_values.filter(|v| !v.is_null()),
            changes_summary,
            severity,
            status: self.status,
            error_message: self.error_message,
            metadata: self.metadata,
        }
    }
}

fn snapshot_value<T: Serialize>(snapshot: &T) -> Result<Value, AuditError> {
    serde_json::to_value(snapshot)
        .map_err(|e| AuditError::serialization(format!("snapshot is not representable: {}", e)))
}

/// Describe which top-level fields changed between two snapshots.
pub fn summarize_changes(old: Option<&Value>, new: Option<&Value>) -> String {
    match (old, new) {
        (None, None) => String::new(),
        (None, Some(_)) => "created".to_string(),
        (Some(_), None) => "removed".to_string(),
        (Some(Value::Object(before)), Some(Value::Object(after))) => {
            let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
            keys.sort();
            keys.dedup();

            let changes: Vec<String> = keys
                .into_iter()
                .filter_map(|key| {
                    let from = before.get(key).unwrap_or(&Value::Null);
                    let to = after.get(key).unwrap_or(&Value::Null);
                    (from != to).then(|| format!("{}: {} -> {}", key, from, to))
                })
                .collect();

            if changes.is_empty() {
                "no changes".to_string()
            } else {
                changes.join("; ")
            }
        }
        (Some(before), Some(after)) if before == after => "no changes".to_string(),
        (Some(before), Some(after)) => format!("{} -> {}", before, after),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clerk() -> Actor {
        Actor::new("u-17", "Ana Ruiz", "BUDGET_OFFICER", "finance/budget")
    }

    #[test]
    fn test_request_defaults_severity_from_action() {
        let content = LogRequest::new(
            clerk(),
            ActionType::PaymentExecuted,
            "payment",
            "pay-9",
            Operation::Approve,
        )
        .into_content();

        assert_eq!(content.severity, Severity::High);
        assert_eq!(content.status, Status::Success);
        assert_eq!(content.timestamp.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_explicit_severity_wins() {
        let content = LogRequest::new(
            clerk(),
            ActionType::BudgetCreated,
            "budget",
            "budget-42",
            Operation::Create,
        )
        .severity(Severity::Critical)
        .into_content();

        assert_eq!(content.severity, Severity::Critical);
    }

    #[test]
    fn test_changes_summary_lists_changed_fields() {
        let old = json!({"amount": 100, "currency": "EUR", "note": "draft"});
        let new = json!({"amount": 250, "currency": "EUR"});

        let summary = summarize_changes(Some(&old), Some(&new));
        assert_eq!(summary, "amount: 100 -> 250; note: \"draft\" -> null");
    }

    #[test]
    fn test_snapshot_with_non_string_keys_is_rejected() {
        let mut snapshot = std::collections::HashMap::new();
        snapshot.insert((1, 2), "tuple key");

        let result = LogRequest::new(
            clerk(),
            ActionType::BudgetModified,
            "budget",
            "budget-1",
            Operation::Update,
        )
        .new_values(&snapshot);

        assert!(matches!(result, Err(AuditError::Serialization(_))));
    }

    #[test]
    fn test_labels_round_trip() {
        assert_eq!(label(&ActionType::ExerciseClosed), "EXERCISE_CLOSED");
        assert_eq!(label(&Severity::Critical), "CRITICAL");
        let parsed: Operation = parse_label("APPROVE").unwrap();
        assert_eq!(parsed, Operation::Approve);
        assert!(parse_label::<Severity>("SEVERE").is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }
}
