mod messages;
mod postgres;
mod runs;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::RunError;
use crate::core::model::{
    Message, MessageType, NewMessage, Run, RunFilters, RunStatus, SortOrder, can_transition,
};

pub use self::postgres::PostgresRunStore;

/// Durable record of runs and their messages.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a run in `scheduled` with task status `unknown`.
    async fn create_run(&self) -> Result<Run, RunError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError>;

    async fn get_runs(
        &self,
        limit: u32,
        offset: u64,
        order: SortOrder,
        filters: &RunFilters,
    ) -> Result<Vec<Run>, RunError>;

    async fn get_runs_count(&self, filters: &RunFilters) -> Result<u64, RunError>;

    /// Applies a status change. Re-applying the current status is a no-op.
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError>;

    async fn update_run_task_status(
        &self,
        run_id: &str,
        task_status: &str,
        reason: Option<&str>,
    ) -> Result<Run, RunError>;

    /// Validates then appends the whole batch atomically, returning the new ids in input order.
    async fn insert_messages(
        &self,
        run_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<String>, RunError>;

    async fn get_all_messages(&self, run_id: &str) -> Result<Vec<Message>, RunError>;

    async fn get_message(&self, run_id: &str, message_id: &str) -> Result<Message, RunError>;
}

pub struct SqliteRunStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, RunError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let db = Connection::open(path)?;
        let store = Self::from_connection(db)?;
        info!("Run store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, RunError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self, RunError> {
        db.execute_batch("PRAGMA foreign_keys = ON;")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL DEFAULT 'scheduled',
                task_status TEXT NOT NULL DEFAULT 'unknown',
                reason TEXT,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id),
                type TEXT NOT NULL,
                content TEXT,
                tool_calls TEXT,
                tool_call_id TEXT,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_run_id
             ON messages (run_id, id)",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self) -> Result<Run, RunError> {
        let db = self.db.lock().await;
        runs::insert_run(&db)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError> {
        let db = self.db.lock().await;
        runs::require_run(&db, run_id)
    }

    async fn get_runs(
        &self,
        limit: u32,
        offset: u64,
        order: SortOrder,
        filters: &RunFilters,
    ) -> Result<Vec<Run>, RunError> {
        let db = self.db.lock().await;
        runs::list_runs(&db, limit, offset, order, filters)
    }

    async fn get_runs_count(&self, filters: &RunFilters) -> Result<u64, RunError> {
        let db = self.db.lock().await;
        runs::count_runs(&db, filters)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError> {
        let db = self.db.lock().await;
        runs::set_status(&db, run_id, status)
    }

    async fn update_run_task_status(
        &self,
        run_id: &str,
        task_status: &str,
        reason: Option<&str>,
    ) -> Result<Run, RunError> {
        let db = self.db.lock().await;
        runs::set_task_status(&db, run_id, task_status, reason)
    }

    async fn insert_messages(
        &self,
        run_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<String>, RunError> {
        let rows = messages::encode_batch(messages)?;
        let mut db = self.db.lock().await;
        messages::append(&mut db, run_id, &rows)
    }

    async fn get_all_messages(&self, run_id: &str) -> Result<Vec<Message>, RunError> {
        let db = self.db.lock().await;
        messages::list_messages(&db, run_id)
    }

    async fn get_message(&self, run_id: &str, message_id: &str) -> Result<Message, RunError> {
        let db = self.db.lock().await;
        messages::find_message(&db, run_id, message_id)
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        RunStatus::from_status(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown run status '{text}'").into()))
    }
}

impl ToSql for MessageType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        MessageType::from_type(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown message type '{text}'").into()))
    }
}

/// Whether moving `run` to `status` has to be written. Illegal moves are errors.
fn needs_transition(run: &Run, status: RunStatus) -> Result<bool, RunError> {
    if run.status == status {
        return Ok(false);
    }
    if !can_transition(run.status, status) {
        return Err(RunError::InvalidTransition {
            from: run.status,
            to: status,
        });
    }
    Ok(true)
}

/// Parses a textual id. Ids that are not integers cannot exist in the store.
fn parse_id(id: &str) -> Option<i64> {
    id.trim().parse::<i64>().ok()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) fn test_run_store() -> SqliteRunStore {
    SqliteRunStore::open_in_memory().expect("in-memory run store")
}
