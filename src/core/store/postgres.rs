use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::prelude::FromRow;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::messages::encode_batch;
use super::{RunStore, needs_transition, now_millis, parse_id};
use crate::core::error::RunError;
use crate::core::mapper::{decode_content, decode_tool_calls};
use crate::core::model::{
    DEFAULT_TASK_STATUS, Message, MessageType, NewMessage, Run, RunFilters, RunStatus, SortOrder,
};

const RUN_COLUMNS: &str = "id, status, task_status, reason, timestamp";
const MESSAGE_COLUMNS: &str = "id, run_id, type, content, tool_calls, tool_call_id, timestamp";

/// Run store backed by a PostgreSQL database shared by every engine process.
pub struct PostgresRunStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    status: String,
    task_status: String,
    reason: Option<String>,
    timestamp: i64,
}

impl RunRow {
    fn into_run(self) -> Result<Run, RunError> {
        let status = RunStatus::from_status(&self.status).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown run status '{}'", self.status).into())
        })?;
        Ok(Run {
            id: self.id.to_string(),
            status,
            task_status: self.task_status,
            reason: self.reason,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    run_id: i64,
    #[sqlx(rename = "type")]
    message_type: String,
    content: Option<String>,
    tool_calls: Option<String>,
    tool_call_id: Option<String>,
    timestamp: i64,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, RunError> {
        let message_type = MessageType::from_type(&self.message_type).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown message type '{}'", self.message_type).into())
        })?;
        Ok(Message {
            id: self.id.to_string(),
            run_id: self.run_id.to_string(),
            message_type,
            content: decode_content(self.content),
            tool_calls: decode_tool_calls(self.tool_calls.as_deref()),
            tool_call_id: self.tool_call_id,
            timestamp: self.timestamp,
        })
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Postgres>, filters: &RunFilters) {
    let mut separator = " WHERE ";
    if let Some(status) = &filters.status {
        query.push(separator).push("status = ").push_bind(status.clone());
        separator = " AND ";
    }
    if let Some(task_status) = &filters.task_status {
        query
            .push(separator)
            .push("task_status = ")
            .push_bind(task_status.clone());
    }
}

impl PostgresRunStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RunError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("Run store connected to PostgreSQL");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), RunError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id BIGSERIAL PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'scheduled',
                task_status TEXT NOT NULL DEFAULT 'unknown',
                reason TEXT,
                timestamp BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id BIGSERIAL PRIMARY KEY,
                run_id BIGINT NOT NULL REFERENCES runs(id),
                type TEXT NOT NULL,
                content TEXT,
                tool_calls TEXT,
                tool_call_id TEXT,
                timestamp BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_run_id ON messages (run_id, id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_run(&self, id: i64) -> Result<Option<Run>, RunError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRow::into_run).transpose()
    }

    async fn locate_run(&self, run_id: &str) -> Result<(i64, Run), RunError> {
        let id = parse_id(run_id).ok_or_else(|| RunError::run_not_found(run_id))?;
        let run = self
            .find_run(id)
            .await?
            .ok_or_else(|| RunError::run_not_found(run_id))?;
        Ok((id, run))
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self) -> Result<Run, RunError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO runs (status, task_status, timestamp) VALUES ($1, $2, $3) RETURNING {RUN_COLUMNS}"
        ))
        .bind(RunStatus::Scheduled.as_str())
        .bind(DEFAULT_TASK_STATUS)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;
        row.into_run()
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, RunError> {
        self.locate_run(run_id).await.map(|(_, run)| run)
    }

    async fn get_runs(
        &self,
        limit: u32,
        offset: u64,
        order: SortOrder,
        filters: &RunFilters,
    ) -> Result<Vec<Run>, RunError> {
        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {RUN_COLUMNS} FROM runs"));
        push_filters(&mut query, filters);
        query
            .push(format!(
                " ORDER BY timestamp {dir}, id {dir} LIMIT ",
                dir = order.as_sql()
            ))
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = query
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn get_runs_count(&self, filters: &RunFilters) -> Result<u64, RunError> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM runs");
        push_filters(&mut query, filters);
        let count = query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, RunError> {
        let (id, mut run) = self.locate_run(run_id).await?;
        if !needs_transition(&run, status)? {
            return Ok(run);
        }

        // Guarded on the status just read so concurrent writers cannot skip a step.
        let updated = sqlx::query("UPDATE runs SET status = $1 WHERE id = $2 AND status = $3")
            .bind(status.as_str())
            .bind(id)
            .bind(run.status.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            let current = self.get_run(run_id).await?;
            if current.status == status {
                return Ok(current);
            }
            return Err(RunError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        run.status = status;
        Ok(run)
    }

    async fn update_run_task_status(
        &self,
        run_id: &str,
        task_status: &str,
        reason: Option<&str>,
    ) -> Result<Run, RunError> {
        let id = parse_id(run_id).ok_or_else(|| RunError::run_not_found(run_id))?;
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs SET task_status = $1, reason = $2 WHERE id = $3 RETURNING {RUN_COLUMNS}"
        ))
        .bind(task_status)
        .bind(reason)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| RunError::run_not_found(run_id))?
            .into_run()
    }

    async fn insert_messages(
        &self,
        run_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<String>, RunError> {
        let rows = encode_batch(messages)?;
        let (id, _) = self.locate_run(run_id).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let message_id = sqlx::query_scalar::<_, i64>(
                "INSERT INTO messages (run_id, type, content, tool_calls, tool_call_id, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            )
            .bind(id)
            .bind(row.message_type.as_str())
            .bind(row.content.as_deref())
            .bind(row.tool_calls.as_deref())
            .bind(row.tool_call_id.as_deref())
            .bind(now_millis())
            .fetch_one(&mut *tx)
            .await?;
            ids.push(message_id.to_string());
        }
        tx.commit().await?;

        debug!(run_id, count = ids.len(), "Messages appended");
        Ok(ids)
    }

    async fn get_all_messages(&self, run_id: &str) -> Result<Vec<Message>, RunError> {
        let (id, _) = self.locate_run(run_id).await?;
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE run_id = $1 ORDER BY id ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn get_message(&self, run_id: &str, message_id: &str) -> Result<Message, RunError> {
        let not_found = || RunError::message_not_found(run_id, message_id);
        let (run, message) = match (parse_id(run_id), parse_id(message_id)) {
            (Some(run), Some(message)) => (run, message),
            _ => return Err(not_found()),
        };

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND run_id = $2"
        ))
        .bind(message)
        .bind(run)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(not_found)?.into_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{MessageContent, ToolCall};
    use serde_json::json;

    /// Live database tests run only when `LANGREPLAY_POSTGRES_URL` is set.
    async fn live_store() -> Option<PostgresRunStore> {
        let url = std::env::var("LANGREPLAY_POSTGRES_URL").ok()?;
        Some(PostgresRunStore::connect(&url, 2).await.unwrap())
    }

    #[test]
    fn unknown_stored_status_is_a_storage_error() {
        let row = RunRow {
            id: 1,
            status: "paused".to_string(),
            task_status: "unknown".to_string(),
            reason: None,
            timestamp: 0,
        };
        let err = row.into_run().unwrap_err();
        assert!(matches!(err, RunError::Database(_)));
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn message_rows_decode_columns() {
        let row = MessageRow {
            id: 9,
            run_id: 3,
            message_type: "AiMessage".to_string(),
            content: Some("checking".to_string()),
            tool_calls: Some(
                json!([{"name": "weather", "args": {"input": "Oslo"}, "type": "tool_call"}])
                    .to_string(),
            ),
            tool_call_id: None,
            timestamp: 42,
        };
        let message = row.into_message().unwrap();
        assert_eq!(message.id, "9");
        assert_eq!(message.run_id, "3");
        assert_eq!(message.message_type, MessageType::AiMessage);
        assert_eq!(message.content, Some(MessageContent::from("checking")));
        assert_eq!(message.tool_calls.unwrap()[0].name, "weather");
    }

    #[test]
    fn filters_bind_in_order() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM runs");
        push_filters(
            &mut query,
            &RunFilters {
                status: Some("done".to_string()),
                task_status: Some("success".to_string()),
            },
        );
        assert_eq!(
            query.sql(),
            "SELECT COUNT(*) FROM runs WHERE status = $1 AND task_status = $2"
        );

        let mut unfiltered = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM runs");
        push_filters(&mut unfiltered, &RunFilters::default());
        assert_eq!(unfiltered.sql(), "SELECT COUNT(*) FROM runs");
    }

    #[tokio::test]
    async fn live_run_lifecycle_and_messages() {
        let Some(store) = live_store().await else {
            return;
        };

        let run = store.create_run().await.unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(run.task_status, DEFAULT_TASK_STATUS);

        let batch = vec![
            NewMessage::human("Book a table"),
            NewMessage::ai("")
                .with_tool_calls(vec![ToolCall::new("book", json!({"seats": 2})).with_id("c1")]),
            NewMessage::tool("ok", "c1"),
        ];
        let ids = store.insert_messages(&run.id, &batch).await.unwrap();
        let stored = store.get_all_messages(&run.id).await.unwrap();
        let stored_ids: Vec<_> = stored.iter().map(|m| m.id.clone()).collect();
        assert_eq!(stored_ids, ids);
        assert_eq!(stored[1].tool_calls, batch[1].tool_calls);
        assert_eq!(
            store.get_message(&run.id, &ids[2]).await.unwrap().tool_call_id.as_deref(),
            Some("c1")
        );

        assert!(matches!(
            store.update_run_status(&run.id, RunStatus::Done).await,
            Err(RunError::InvalidTransition { .. })
        ));
        store
            .update_run_status(&run.id, RunStatus::Running)
            .await
            .unwrap();
        store.update_run_status(&run.id, RunStatus::Done).await.unwrap();
        let done = store
            .update_run_task_status(&run.id, "success", Some("booked"))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Done);
        assert_eq!(done.reason.as_deref(), Some("booked"));

        let filters = RunFilters {
            status: Some("done".to_string()),
            task_status: Some("success".to_string()),
        };
        assert!(store.get_runs_count(&filters).await.unwrap() >= 1);
        let listed = store
            .get_runs(1, 0, SortOrder::Desc, &RunFilters::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn live_invalid_batch_writes_nothing() {
        let Some(store) = live_store().await else {
            return;
        };

        let run = store.create_run().await.unwrap();
        let batch = vec![
            NewMessage::human("fine"),
            NewMessage::ai("x").with_tool_calls(vec![ToolCall::new("calc", json!(7))]),
        ];
        let err = store.insert_messages(&run.id, &batch).await.unwrap_err();
        assert!(matches!(err, RunError::Validation { index: 1, .. }));
        assert!(store.get_all_messages(&run.id).await.unwrap().is_empty());
        assert!(matches!(
            store.get_all_messages("not-a-run").await,
            Err(RunError::NotFound(_))
        ));
    }
}
