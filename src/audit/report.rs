//! Compliance reporting over the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::entry::{label, AuditLogEntry};
use crate::audit::verify::SequenceRange;
use crate::database::{bounded, AuditStore, Page, SearchCriteria, SortOrder, MAX_PAGE_SIZE};
use crate::error::AuditError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub total: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_user: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

impl ReportStatistics {
    pub fn record(&mut self, entry: &AuditLogEntry) {
        let c = &entry.content;
        self.total += 1;
        *self.by_action.entry(label(&c.action_type)).or_default() += 1;
        *self.by_user.entry(c.actor.user_id.clone()).or_default() += 1;
        *self.by_severity.entry(label(&c.severity)).or_default() += 1;
        *self.by_status.entry(label(&c.status)).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub criteria: SearchCriteria,
    pub entries: Page<AuditLogEntry>,
    pub statistics: ReportStatistics,
    /// Statistics stopped at the entry cap before covering every match.
    pub truncated: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Reporter {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
    max_entries: u64,
}

impl Reporter {
    pub fn new(store: Arc<dyn AuditStore>, timeout: Duration, max_entries: u64) -> Self {
        Self {
            store,
            timeout,
            max_entries: max_entries.max(1),
        }
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Page<AuditLogEntry>, AuditError> {
        Ok(bounded(self.timeout, self.store.query(criteria)).await?)
    }

    /// The requested page plus statistics over every matching entry, up to
    /// the configured cap.
    pub async fn generate_report(&self, criteria: SearchCriteria) -> Result<AuditReport, AuditError> {
        let entries = self.search(&criteria).await?;

        let mut statistics = ReportStatistics::default();
        let mut offset = 0;
        loop {
            let window = criteria.page(SortOrder::Asc, offset, MAX_PAGE_SIZE);
            let page = bounded(self.timeout, self.store.query(&window)).await?;
            for entry in &page.items {
                if statistics.total >= self.max_entries {
                    break;
                }
                statistics.record(entry);
            }
            offset += page.items.len() as u64;
            if page.items.is_empty() || offset >= page.total || statistics.total >= self.max_entries {
                break;
            }
        }

        let truncated = statistics.total < entries.total;
        if truncated {
            warn!(
                matched = entries.total,
                counted = statistics.total,
                "Report statistics truncated at entry cap"
            );
        }
        debug!("Generated audit report over {} entries", statistics.total);

        Ok(AuditReport {
            criteria,
            entries,
            statistics,
            truncated,
            generated_at: Utc::now(),
        })
    }

    /// Write the chain as JSONL in sequence order, optionally limited to an
    /// inclusive window. A window starting past sequence 1 links to an
    /// entry outside the export.
    pub async fn export_chain<W: Write>(
        &self,
        writer: &mut W,
        range: Option<SequenceRange>,
    ) -> Result<u64, AuditError> {
        let range = range.unwrap_or_default();
        let mut cursor = range.from.map_or(0, |from| (from - 1).max(0));
        let mut written = 0;
        loop {
            let page =
                bounded(self.timeout, self.store.scan(cursor, range.to, MAX_PAGE_SIZE)).await?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence;

            for entry in &page {
                let line = serde_json::to_string(entry)?;
                writeln!(writer, "{}", line)
                    .map_err(|e| AuditError::Store(format!("export write failed: {}", e)))?;
                written += 1;
            }
            if (page.len() as u64) < MAX_PAGE_SIZE {
                break;
            }
        }
        writer
            .flush()
            .map_err(|e| AuditError::Store(format!("export flush failed: {}", e)))?;

        info!("Exported {} audit entries", written);
        Ok(written)
    }
}
