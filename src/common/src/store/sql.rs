use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, query};

use super::{StoreError, StoreResult, TestStore};
use crate::model::{Test, TestFilter, TestId, TestStatus, TestUpdate};

const SELECT_COLUMNS: &str = r#"
    SELECT id, owner, log_rate, metrics_rate, trace_rate, log_size, duration_secs,
           destinations, status, created_at, updated_at, scheduled_time, completed_at,
           emitted, run_count
    FROM tests"#;

/// SQLite-backed test store
#[derive(Clone)]
pub struct SqlTestStore {
    pool: SqlitePool,
}

impl SqlTestStore {
    /// Connect and initialize the schema.
    pub async fn new(dsn: &str) -> StoreResult<Self> {
        log::info!("Connecting to test store with DSN: {dsn}");

        let connected = if dsn.contains(":memory:") {
            // every connection to :memory: is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(dsn)
                .await
        } else {
            // Add mode=rwc to create database file if it doesn't exist
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };
            SqlitePool::connect(&dsn_with_create).await
        };

        let pool = connected.map_err(|e| {
            log::error!("Failed to connect to SQLite database with DSN '{dsn}': {e}");
            e
        })?;

        let store = Self { pool };
        store.init().await.map_err(|e| {
            log::error!("Failed to initialize test store schema: {e}");
            e
        })?;
        log::info!("Test store schema initialized successfully");
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        let create_tests = r#"
        CREATE TABLE IF NOT EXISTS tests (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            log_rate REAL,
            metrics_rate REAL,
            trace_rate REAL,
            log_size INTEGER NOT NULL,
            duration_secs INTEGER NOT NULL,
            destinations TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            scheduled_time TEXT,
            completed_at TEXT,
            emitted TEXT NOT NULL,
            run_count INTEGER NOT NULL
        )"#;
        query(create_tests).execute(&self.pool).await?;

        let create_status_index = r#"
        CREATE INDEX IF NOT EXISTS tests_status_idx ON tests (status)"#;
        query(create_status_index).execute(&self.pool).await?;

        Ok(())
    }

    async fn insert_row(&self, test: &Test, id: &TestId) -> StoreResult<()> {
        let stmt = r#"
            INSERT INTO tests (id, owner, log_rate, metrics_rate, trace_rate, log_size,
                               duration_secs, destinations, status, created_at, updated_at,
                               scheduled_time, completed_at, emitted, run_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#;

        query(stmt)
            .bind(id.to_string())
            .bind(&test.owner)
            .bind(test.log_rate)
            .bind(test.metrics_rate)
            .bind(test.trace_rate)
            .bind(test.log_size as i64)
            .bind(test.duration_secs as i64)
            .bind(serde_json::to_string(&test.destinations)?)
            .bind(test.status.as_str())
            .bind(test.created_at.to_rfc3339())
            .bind(test.updated_at.to_rfc3339())
            .bind(test.scheduled_time.map(|t| t.to_rfc3339()))
            .bind(test.completed_at.map(|t| t.to_rfc3339()))
            .bind(serde_json::to_string(&test.emitted)?)
            .bind(test.run_count as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Single `UPDATE` touching only the fields the update carries
fn update_statement(
    id: &TestId,
    update: &TestUpdate,
) -> StoreResult<QueryBuilder<'static, Sqlite>> {
    let mut builder = QueryBuilder::new("UPDATE tests SET updated_at = ");
    builder.push_bind(update.updated_at.to_rfc3339());

    if let Some(status) = update.status {
        builder.push(", status = ").push_bind(status.as_str());
    }
    if let Some(scheduled_time) = update.scheduled_time {
        builder
            .push(", scheduled_time = ")
            .push_bind(scheduled_time.map(|t| t.to_rfc3339()));
    }
    if let Some(completed_at) = update.completed_at {
        builder
            .push(", completed_at = ")
            .push_bind(completed_at.map(|t| t.to_rfc3339()));
    }
    if let Some(log_rate) = update.log_rate {
        builder.push(", log_rate = ").push_bind(log_rate);
    }
    if let Some(metrics_rate) = update.metrics_rate {
        builder.push(", metrics_rate = ").push_bind(metrics_rate);
    }
    if let Some(trace_rate) = update.trace_rate {
        builder.push(", trace_rate = ").push_bind(trace_rate);
    }
    if let Some(duration_secs) = update.duration_secs {
        builder
            .push(", duration_secs = ")
            .push_bind(duration_secs as i64);
    }
    if let Some(emitted) = &update.emitted {
        builder
            .push(", emitted = ")
            .push_bind(serde_json::to_string(emitted)?);
    }
    if let Some(run_count) = update.run_count {
        builder.push(", run_count = ").push_bind(run_count as i64);
    }

    builder.push(" WHERE id = ").push_bind(id.to_string());
    Ok(builder)
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp '{value}': {e}")))
}

fn parse_optional_timestamp(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn row_to_test(row: &SqliteRow) -> StoreResult<Test> {
    let id: String = row.try_get("id")?;
    let id = id
        .parse::<TestId>()
        .map_err(|e| StoreError::Backend(format!("invalid test id '{id}': {e}")))?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<TestStatus>()
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let destinations: String = row.try_get("destinations")?;
    let emitted: String = row.try_get("emitted")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let log_size: i64 = row.try_get("log_size")?;
    let duration_secs: i64 = row.try_get("duration_secs")?;
    let run_count: i64 = row.try_get("run_count")?;

    Ok(Test {
        id: Some(id),
        owner: row.try_get("owner")?,
        log_rate: row.try_get("log_rate")?,
        metrics_rate: row.try_get("metrics_rate")?,
        trace_rate: row.try_get("trace_rate")?,
        log_size: log_size as usize,
        duration_secs: duration_secs as u64,
        destinations: serde_json::from_str(&destinations)?,
        status,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        scheduled_time: parse_optional_timestamp(row.try_get("scheduled_time")?)?,
        completed_at: parse_optional_timestamp(row.try_get("completed_at")?)?,
        emitted: serde_json::from_str(&emitted)?,
        run_count: run_count as u32,
    })
}

#[async_trait]
impl TestStore for SqlTestStore {
    async fn insert(&self, test: &Test) -> StoreResult<TestId> {
        let id = test.id.clone().unwrap_or_default();
        self.insert_row(test, &id).await?;
        Ok(id)
    }

    async fn find_by_id(&self, id: &TestId) -> StoreResult<Option<Test>> {
        let stmt = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row = query(&stmt)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_test).transpose()
    }

    async fn update_fields(&self, id: &TestId, update: &TestUpdate) -> StoreResult<()> {
        let result = update_statement(id, update)?
            .build()
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn find_all(&self, filter: &TestFilter) -> StoreResult<Vec<Test>> {
        let mut stmt = format!("{SELECT_COLUMNS} WHERE 1 = 1");
        if filter.owner.is_some() {
            stmt.push_str(" AND owner = ?");
        }
        if filter.status.is_some() {
            stmt.push_str(" AND status = ?");
        }
        stmt.push_str(" ORDER BY created_at ASC");

        let mut q = query(&stmt);
        if let Some(owner) = &filter.owner {
            q = q.bind(owner);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_test).collect()
    }
}
