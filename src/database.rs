#[cfg(feature = "database")]
use anyhow::Result;
#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use chrono::{DateTime, Utc};
#[cfg(feature = "database")]
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, SqlitePool};
#[cfg(feature = "database")]
use tracing::info;

#[cfg(feature = "database")]
use crate::domain::{ActionType, WorkflowLogEntry};
#[cfg(feature = "database")]
use crate::errors::WorkflowError;
#[cfg(feature = "database")]
use crate::idempotency::IdempotencyRecord;
#[cfg(feature = "database")]
use crate::store::IdempotencyStore;

#[cfg(feature = "database")]
/// SQLite-backed idempotency records and workflow audit trail
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl DatabaseManager {
    /// Initialize database with automatic migrations
    pub async fn new(database_url: &str, max_connections: u32, auto_migrate: bool) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        if auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    /// Append one workflow log entry to the audit table
    pub async fn record_audit(
        &self,
        proposal_id: &str,
        entry: &WorkflowLogEntry,
    ) -> Result<(), WorkflowError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_audit
                (proposal_id, action, actor_id, actor_role, from_state, to_state, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(proposal_id)
        .bind(entry.action.as_str())
        .bind(&entry.actor_id)
        .bind(entry.actor_role.as_str())
        .bind(entry.from_state.as_str())
        .bind(entry.to_state.as_str())
        .bind(entry.reason.as_deref())
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<IdempotencyRecord, WorkflowError> {
    let action: String = row.get("action");
    let result: String = row.get("result");
    let created_at: String = row.get("created_at");
    Ok(IdempotencyRecord {
        key: row.get("key"),
        proposal_id: row.get("proposal_id"),
        action: serde_json::from_value::<ActionType>(serde_json::Value::String(action))?,
        result: serde_json::from_str(&result)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| WorkflowError::Storage(format!("bad timestamp '{created_at}': {e}")))?
            .with_timezone(&Utc),
    })
}

#[cfg(feature = "database")]
#[async_trait]
impl IdempotencyStore for DatabaseManager {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, WorkflowError> {
        let row = sqlx::query(
            r#"
            SELECT key, proposal_id, action, result, created_at
            FROM idempotency_records
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    async fn insert(&self, record: IdempotencyRecord) -> Result<(), WorkflowError> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO idempotency_records (key, proposal_id, action, result, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&record.key)
        .bind(&record.proposal_id)
        .bind(record.action.as_str())
        .bind(serde_json::to_string(&record.result)?)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(WorkflowError::invalid_field(
                "idempotency_key",
                format!("key '{}' is already recorded", record.key),
            ));
        }
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, WorkflowError> {
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE created_at <= ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn list(&self) -> Result<Vec<IdempotencyRecord>, WorkflowError> {
        let rows = sqlx::query(
            "SELECT key, proposal_id, action, result, created_at FROM idempotency_records ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(record_from_row).collect()
    }
}
