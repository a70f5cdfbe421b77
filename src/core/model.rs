use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task status written on every run until the agent expresses one.
pub const DEFAULT_TASK_STATUS: &str = "unknown";
/// Task status recorded when processing a run fails.
pub const FAILED_TASK_STATUS: &str = "failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Scheduled,
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(RunStatus::Scheduled),
            "running" => Some(RunStatus::Running),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal run status moves. Staying in the same status is always allowed.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        RunStatus::Scheduled => matches!(to, RunStatus::Running),
        RunStatus::Running => matches!(to, RunStatus::Done | RunStatus::Failed),
        RunStatus::Done | RunStatus::Failed => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub task_status: String,
    pub reason: Option<String>,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    HumanMessage,
    AiMessage,
    ToolMessage,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::HumanMessage => "HumanMessage",
            MessageType::AiMessage => "AiMessage",
            MessageType::ToolMessage => "ToolMessage",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "HumanMessage" => Some(MessageType::HumanMessage),
            "AiMessage" => Some(MessageType::AiMessage),
            "ToolMessage" => Some(MessageType::ToolMessage),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentBlock::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message content: a plain string or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Every piece of text carried by the content, in order.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(text) => vec![text.as_str()],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallArgs {
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub args: ToolCallArgs,
    #[serde(rename = "type", default = "default_tool_call_kind")]
    pub kind: String,
}

fn default_tool_call_kind() -> String {
    "tool_call".to_string()
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            args: ToolCallArgs { input },
            kind: default_tool_call_kind(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A message as submitted by a client, a replay or the agent, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl NewMessage {
    pub fn new(message_type: MessageType, content: impl Into<MessageContent>) -> Self {
        Self {
            message_type,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageType::HumanMessage, content)
    }

    pub fn ai(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageType::AiMessage, content)
    }

    pub fn tool(content: impl Into<MessageContent>, tool_call_id: impl Into<String>) -> Self {
        let mut message = Self::new(MessageType::ToolMessage, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// Checks the message shape. The returned string names the offending field.
    pub fn validate(&self) -> Result<(), String> {
        for (i, call) in self.tool_calls.iter().flatten().enumerate() {
            if call.name.trim().is_empty() {
                return Err(format!("toolCalls[{i}].name must not be empty"));
            }
            if !(call.args.input.is_string() || call.args.input.is_object()) {
                return Err(format!(
                    "toolCalls[{i}].args.input must be a string or an object"
                ));
            }
            if call.kind != "tool_call" {
                return Err(format!(
                    "toolCalls[{i}].type must be \"tool_call\", got \"{}\"",
                    call.kind
                ));
            }
        }

        let has_tool_call_id = self
            .tool_call_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if has_tool_call_id && self.message_type != MessageType::ToolMessage {
            return Err(format!(
                "toolCallId is only allowed on ToolMessage, not {}",
                self.message_type
            ));
        }

        if let Some(MessageContent::Blocks(blocks)) = &self.content {
            for (i, block) in blocks.iter().enumerate() {
                if let ContentBlock::ImageUrl { image_url } = block {
                    if image_url.url.trim().is_empty() {
                        return Err(format!("content[{i}].image_url.url must not be empty"));
                    }
                }
            }
        }

        Ok(())
    }
}

/// A stored message. Ids are unique per store and increase in insertion order, which is the order within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: Option<MessageContent>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub timestamp: i64,
}

impl Message {
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// The submittable part of the message, for replaying it into another run.
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            message_type: self.message_type,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// `asc` (any case) sorts oldest first, anything else newest first.
    pub fn from_query(value: &str) -> Self {
        if value.eq_ignore_ascii_case("asc") {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Equality filters for run listings. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilters {
    pub status: Option<String>,
    pub task_status: Option<String>,
}
