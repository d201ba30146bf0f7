use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::models::{format_timestamp, AuditLogRow, IncidentRow};
use super::schema::MIGRATOR;
use super::{
    AuditStore, Incident, InsertOutcome, NewIncident, Page, SearchCriteria, SortOrder,
    StoreError, StoreResult,
};
use crate::audit::entry::{label, AuditLogEntry, ChainLink, GENESIS_HASH};
use chrono::Utc;

const SELECT_ENTRY: &str = "SELECT * FROM audit_log";

// A single statement, so the tail comparison and the insert are atomic.
const INSERT_IF_TAIL: &str = r#"
    INSERT INTO audit_log (
        entry_id, idempotency_key, timestamp,
        actor_user_id, actor_name, actor_role, actor_org_unit,
        action_type, resource_type, resource_id, operation,
        old_values, new_values, changes_summary,
        severity, status, error_message, metadata,
        previous_hash, hash
    )
    SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
    WHERE COALESCE(
        (SELECT hash FROM audit_log ORDER BY sequence DESC LIMIT 1),
        ?
    ) = ?
"#;

/// SQLite-backed audit store.
#[derive(Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open the store, creating the database file if it does not exist.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        Self::connect_with(database_url, max_connections, true).await
    }

    /// Open a database that must already exist.
    pub async fn open_existing(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        Self::connect_with(database_url, max_connections, false).await
    }

    async fn connect_with(
        database_url: &str,
        max_connections: u32,
        create_if_missing: bool,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(create_if_missing)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!("Connected audit store at {}", database_url);
        Ok(Self { pool })
    }

    /// Private in-memory database. One connection that is never recycled,
    /// since closing it would discard the data.
    pub async fn connect_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;
        debug!("Audit store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_by_key(&self, idempotency_key: &str) -> StoreResult<Option<AuditLogEntry>> {
        let row: Option<AuditLogRow> =
            sqlx::query_as(&format!("{} WHERE idempotency_key = ?", SELECT_ENTRY))
                .bind(idempotency_key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(AuditLogEntry::try_from).transpose()
    }

    async fn tail_hash(&self) -> StoreResult<String> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash.unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    async fn incident_by_id(&self, id: i64) -> StoreResult<Option<Incident>> {
        let row: Option<IncidentRow> =
            sqlx::query_as("SELECT * FROM integrity_incidents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Incident::try_from).transpose()
    }
}

fn to_json_text(value: &Option<serde_json::Value>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(|e| StoreError::Backend(e.to_string())))
        .transpose()
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, criteria: &SearchCriteria) {
    qb.push(" WHERE 1 = 1");
    if let Some(actor_id) = &criteria.actor_id {
        qb.push(" AND actor_user_id = ").push_bind(actor_id.clone());
    }
    if let Some(action_type) = &criteria.action_type {
        qb.push(" AND action_type = ").push_bind(label(action_type));
    }
    if let Some(resource_type) = &criteria.resource_type {
        qb.push(" AND resource_type = ").push_bind(resource_type.clone());
    }
    if let Some(resource_id) = &criteria.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(severity) = &criteria.severity {
        qb.push(" AND severity = ").push_bind(label(severity));
    }
    if let Some(status) = &criteria.status {
        qb.push(" AND status = ").push_bind(label(status));
    }
    if let Some(from) = &criteria.from {
        qb.push(" AND timestamp >= ").push_bind(format_timestamp(from));
    }
    if let Some(to) = &criteria.to {
        qb.push(" AND timestamp <= ").push_bind(format_timestamp(to));
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn last_entry(&self) -> StoreResult<Option<AuditLogEntry>> {
        let row: Option<AuditLogRow> =
            sqlx::query_as(&format!("{} ORDER BY sequence DESC LIMIT 1", SELECT_ENTRY))
                .fetch_optional(&self.pool)
                .await?;
        row.map(AuditLogEntry::try_from).transpose()
    }

    async fn insert(&self, link: &ChainLink) -> StoreResult<InsertOutcome> {
        if let Some(existing) = self.find_by_key(&link.idempotency_key).await? {
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let c = &link.content;
        let result = sqlx::query(INSERT_IF_TAIL)
            .bind(c.entry_id.to_string())
            .bind(&link.idempotency_key)
            .bind(format_timestamp(&c.timestamp))
            .bind(&c.actor.user_id)
            .bind(&c.actor.name)
            .bind(&c.actor.role)
            .bind(&c.actor.org_unit)
            .bind(label(&c.action_type))
            .bind(&c.resource_type)
            .bind(&c.resource_id)
            .bind(label(&c.operation))
            .bind(to_json_text(&c.old_values)?)
            .bind(to_json_text(&c.new_values)?)
            .bind(&c.changes_summary)
            .bind(label(&c.severity))
            .bind(label(&c.status))
            .bind(&c.error_message)
            .bind(
                serde_json::to_string(&c.metadata)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
            )
            .bind(&link.previous_hash)
            .bind(&link.hash)
            .bind(GENESIS_HASH)
            .bind(&link.previous_hash)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                let sequence = done.last_insert_rowid();
                Ok(InsertOutcome::Appended(link.clone().into_entry(sequence)))
            }
            Ok(_) => Ok(InsertOutcome::Conflict {
                tail_hash: self.tail_hash().await?,
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Either a concurrent retry stored the same key, or another
                // writer already used this previous_hash.
                match self.find_by_key(&link.idempotency_key).await? {
                    Some(existing) => Ok(InsertOutcome::Duplicate(existing)),
                    None => Ok(InsertOutcome::Conflict {
                        tail_hash: self.tail_hash().await?,
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn entry_before(&self, sequence: i64) -> StoreResult<Option<AuditLogEntry>> {
        let row: Option<AuditLogRow> = sqlx::query_as(&format!(
            "{} WHERE sequence < ? ORDER BY sequence DESC LIMIT 1",
            SELECT_ENTRY
        ))
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AuditLogEntry::try_from).transpose()
    }

    async fn scan(
        &self,
        after_sequence: i64,
        until_sequence: Option<i64>,
        limit: u64,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let rows: Vec<AuditLogRow> = sqlx::query_as(&format!(
            "{} WHERE sequence > ? AND (? IS NULL OR sequence <= ?) ORDER BY sequence ASC LIMIT ?",
            SELECT_ENTRY
        ))
        .bind(after_sequence)
        .bind(until_sequence)
        .bind(until_sequence)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AuditLogEntry::try_from).collect()
    }

    async fn query(&self, criteria: &SearchCriteria) -> StoreResult<Page<AuditLogEntry>> {
        let limit = criteria.effective_limit();

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_log");
        push_filters(&mut count, criteria);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_ENTRY);
        push_filters(&mut select, criteria);
        select.push(match criteria.order {
            SortOrder::Asc => " ORDER BY sequence ASC",
            SortOrder::Desc => " ORDER BY sequence DESC",
        });
        select.push(" LIMIT ").push_bind(limit as i64);
        select.push(" OFFSET ").push_bind(criteria.offset as i64);

        let rows: Vec<AuditLogRow> = select.build_query_as::<AuditLogRow>().fetch_all(&self.pool).await?;
        let items = rows
            .into_iter()
            .map(AuditLogEntry::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            offset: criteria.offset,
            limit,
        })
    }

    async fn open_incident(&self, incident: NewIncident) -> StoreResult<Incident> {
        let existing: Option<IncidentRow> = sqlx::query_as(
            "SELECT * FROM integrity_incidents \
             WHERE fingerprint = ? AND acknowledged_at IS NULL \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(&incident.fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return Incident::try_from(row);
        }

        let broken_links = serde_json::to_string(&incident.broken_links)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let done = sqlx::query(
            "INSERT INTO integrity_incidents (fingerprint, detected_at, total_checked, broken_links) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&incident.fingerprint)
        .bind(format_timestamp(&incident.detected_at))
        .bind(incident.total_checked as i64)
        .bind(broken_links)
        .execute(&self.pool)
        .await?;

        Ok(incident.into_incident(done.last_insert_rowid()))
    }

    async fn pending_incidents(&self) -> StoreResult<Vec<Incident>> {
        let rows: Vec<IncidentRow> = sqlx::query_as(
            "SELECT * FROM integrity_incidents WHERE acknowledged_at IS NULL ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Incident::try_from).collect()
    }

    async fn acknowledge_incident(
        &self,
        id: i64,
        acknowledged_by: &str,
        note: &str,
    ) -> StoreResult<Option<Incident>> {
        let done = sqlx::query(
            "UPDATE integrity_incidents \
             SET acknowledged_by = ?, acknowledged_at = ?, note = ? \
             WHERE id = ? AND acknowledged_at IS NULL",
        )
        .bind(acknowledged_by)
        .bind(format_timestamp(&Utc::now()))
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.incident_by_id(id).await
    }
}
