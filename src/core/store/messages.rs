use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::runs::locate_run;
use super::{now_millis, parse_id};
use crate::core::error::RunError;
use crate::core::mapper::{decode_content, decode_tool_calls, encode_content, encode_tool_calls};
use crate::core::model::{Message, MessageType, NewMessage};

const MESSAGE_COLUMNS: &str = "id, run_id, type, content, tool_calls, tool_call_id, timestamp";

/// A message serialized into its column representation.
pub(super) struct EncodedMessage {
    pub(super) message_type: MessageType,
    pub(super) content: Option<String>,
    pub(super) tool_calls: Option<String>,
    pub(super) tool_call_id: Option<String>,
}

/// Validates every message, then encodes the batch. Indexes in errors follow the input.
pub(super) fn encode_batch(messages: &[NewMessage]) -> Result<Vec<EncodedMessage>, RunError> {
    for (index, message) in messages.iter().enumerate() {
        message
            .validate()
            .map_err(|reason| RunError::Validation { index, reason })?;
    }
    messages.iter().map(EncodedMessage::encode).collect()
}

impl EncodedMessage {
    fn encode(message: &NewMessage) -> Result<Self, RunError> {
        Ok(Self {
            message_type: message.message_type,
            content: encode_content(message.content.as_ref())?,
            tool_calls: encode_tool_calls(message.tool_calls.as_deref())?,
            tool_call_id: message
                .tool_call_id
                .clone()
                .filter(|id| !id.is_empty()),
        })
    }
}

struct MessageRow {
    id: i64,
    run_id: i64,
    message_type: MessageType,
    content: Option<String>,
    tool_calls: Option<String>,
    tool_call_id: Option<String>,
    timestamp: i64,
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        message_type: row.get(2)?,
        content: row.get(3)?,
        tool_calls: row.get(4)?,
        tool_call_id: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

impl MessageRow {
    fn decode(self) -> Result<Message, RunError> {
        Ok(Message {
            id: self.id.to_string(),
            run_id: self.run_id.to_string(),
            message_type: self.message_type,
            content: decode_content(self.content),
            tool_calls: decode_tool_calls(self.tool_calls.as_deref()),
            tool_call_id: self.tool_call_id,
            timestamp: self.timestamp,
        })
    }
}

/// Appends the batch inside one transaction. Nothing is written if any row fails.
pub(super) fn append(
    db: &mut Connection,
    run_id: &str,
    rows: &[EncodedMessage],
) -> Result<Vec<String>, RunError> {
    let (id, _) = locate_run(db, run_id)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let tx = db.transaction()?;
    let mut ids = Vec::with_capacity(rows.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO messages (run_id, type, content, tool_calls, tool_call_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for row in rows {
            let message_id = stmt.insert(params![
                id,
                row.message_type,
                row.content,
                row.tool_calls,
                row.tool_call_id,
                now_millis(),
            ])?;
            ids.push(message_id.to_string());
        }
    }
    tx.commit()?;

    debug!(run_id, count = ids.len(), "Messages appended");
    Ok(ids)
}

pub(super) fn list_messages(db: &Connection, run_id: &str) -> Result<Vec<Message>, RunError> {
    let (id, _) = locate_run(db, run_id)?;
    let mut stmt = db.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE run_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![id], message_row)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?.decode()?);
    }
    Ok(messages)
}

pub(super) fn find_message(
    db: &Connection,
    run_id: &str,
    message_id: &str,
) -> Result<Message, RunError> {
    let not_found = || RunError::message_not_found(run_id, message_id);
    let (run, message) = match (parse_id(run_id), parse_id(message_id)) {
        (Some(run), Some(message)) => (run, message),
        _ => return Err(not_found()),
    };

    let row = db
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND run_id = ?2"),
            params![message, run],
            message_row,
        )
        .optional()?;
    row.ok_or_else(not_found)?.decode()
}
