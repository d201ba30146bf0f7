//! In-process audit store with the same append semantics as the SQL one.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    AuditStore, Incident, InsertOutcome, NewIncident, Page, SearchCriteria, SortOrder,
    StoreResult,
};
use crate::audit::entry::{AuditLogEntry, ChainLink, GENESIS_HASH};

#[derive(Default)]
struct MemoryState {
    entries: Vec<AuditLogEntry>,
    last_sequence: i64,
    incidents: Vec<Incident>,
}

#[derive(Default)]
pub struct MemoryAuditStore {
    state: RwLock<MemoryState>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Out-of-band access to the stored rows, bypassing the append-only API.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<AuditLogEntry>),
    {
        f(&mut self.state.write().await.entries);
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn last_entry(&self) -> StoreResult<Option<AuditLogEntry>> {
        Ok(self.state.read().await.entries.last().cloned())
    }

    async fn insert(&self, link: &ChainLink) -> StoreResult<InsertOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .entries
            .iter()
            .find(|e| e.idempotency_key == link.idempotency_key)
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let tail_hash = state
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let already_linked = state
            .entries
            .iter()
            .any(|e| e.previous_hash == link.previous_hash);

        if tail_hash != link.previous_hash || already_linked {
            return Ok(InsertOutcome::Conflict { tail_hash });
        }

        state.last_sequence += 1;
        let entry = link.clone().into_entry(state.last_sequence);
        state.entries.push(entry.clone());
        Ok(InsertOutcome::Appended(entry))
    }

    async fn entry_before(&self, sequence: i64) -> StoreResult<Option<AuditLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .rev()
            .find(|e| e.sequence < sequence)
            .cloned())
    }

    async fn scan(
        &self,
        after_sequence: i64,
        until_sequence: Option<i64>,
        limit: u64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .filter(|e| until_sequence.map_or(true, |until| e.sequence <= until))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn query(&self, criteria: &SearchCriteria) -> StoreResult<Page<AuditLogEntry>> {
        let state = self.state.read().await;
        let limit = criteria.effective_limit();

        let mut matching: Vec<&AuditLogEntry> =
            state.entries.iter().filter(|e| criteria.matches(e)).collect();
        if criteria.order == SortOrder::Desc {
            matching.reverse();
        }

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(criteria.offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            offset: criteria.offset,
            limit,
        })
    }

    async fn open_incident(&self, incident: NewIncident) -> StoreResult<Incident> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .incidents
            .iter()
            .find(|i| i.is_pending() && i.fingerprint == incident.fingerprint)
        {
            return Ok(existing.clone());
        }

        let opened = incident.into_incident(state.incidents.len() as i64 + 1);
        state.incidents.push(opened.clone());
        Ok(opened)
    }

    async fn pending_incidents(&self) -> StoreResult<Vec<Incident>> {
        let state = self.state.read().await;
        Ok(state
            .incidents
            .iter()
            .filter(|i| i.is_pending())
            .cloned()
            .collect())
    }

    async fn acknowledge_incident(
        &self,
        id: i64,
        acknowledged_by: &str,
        note: &str,
    ) -> StoreResult<Option<Incident>> {
        let mut state = self.state.write().await;
        let Some(incident) = state
            .incidents
            .iter_mut()
            .find(|i| i.id == id && i.is_pending())
        else {
            return Ok(None);
        };

        incident.acknowledged_by = Some(acknowledged_by.to_string());
        incident.acknowledged_at = Some(Utc::now());
        incident.note = Some(note.to_string());
        Ok(Some(incident.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::PreparedEntry;
    use crate::audit::entry::{ActionType, Actor, LogRequest, Operation};

    fn link_after(previous_hash: &str, resource_id: &str) -> ChainLink {
        let content = LogRequest::new(
            Actor::new("u-5", "Treasurer", "TREASURER", "treasury"),
            ActionType::PaymentOrdered,
            "payment",
            resource_id,
            Operation::Create,
        )
        .into_content();
        let prepared = PreparedEntry::prepare(content).unwrap();
        ChainLink {
            hash: prepared.hash_after(previous_hash),
            content: prepared.content,
            idempotency_key: prepared.idempotency_key,
            previous_hash: previous_hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_requires_current_tail() {
        let store = MemoryAuditStore::new();
        let first = link_after(GENESIS_HASH, "p-1");
        let InsertOutcome::Appended(stored) = store.insert(&first).await.unwrap() else {
            panic!("first insert should append");
        };
        assert_eq!(stored.sequence, 1);

        // A second writer that still believes the chain is empty loses.
        let stale = link_after(GENESIS_HASH, "p-2");
        match store.insert(&stale).await.unwrap() {
            InsertOutcome::Conflict { tail_hash } => assert_eq!(tail_hash, stored.hash),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_not_relinked() {
        let store = MemoryAuditStore::new();
        let link = link_after(GENESIS_HASH, "p-1");
        store.insert(&link).await.unwrap();

        let outcome = store.insert(&link).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Duplicate(e) if e.sequence == 1));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_query_pages_descending() {
        let store = MemoryAuditStore::new();
        let mut prev = GENESIS_HASH.to_string();
        for i in 0..5 {
            let link = link_after(&prev, &format!("p-{}", i));
            prev = link.hash.clone();
            store.insert(&link).await.unwrap();
        }

        let criteria = SearchCriteria {
            limit: 2,
            offset: 1,
            ..SearchCriteria::default()
        };
        let page = store.query(&criteria).await.unwrap();
        assert_eq!(page.total, 5);
        let sequences: Vec<i64> = page.items.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![4, 3]);
    }
}
