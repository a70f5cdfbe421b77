//! Conversion between stored messages and the agent's message shape.
//!
//! Also owns the column encoding of message content and tool calls, and the
//! `{key}` templating applied to configured baseline messages.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::error::RunError;
use crate::core::model::{ContentBlock, MessageContent, MessageType, NewMessage, ToolCall};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Human,
    Ai,
    Tool,
    #[serde(other)]
    Other,
}

impl AgentRole {
    pub fn message_type(self) -> MessageType {
        match self {
            AgentRole::Human => MessageType::HumanMessage,
            AgentRole::Tool => MessageType::ToolMessage,
            AgentRole::Ai | AgentRole::Other => MessageType::AiMessage,
        }
    }
}

/// The message shape exchanged with the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub role: AgentRole,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl AgentMessage {
    pub fn new(role: AgentRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Self::new(AgentRole::Human, content)
    }

    pub fn ai(content: impl Into<MessageContent>) -> Self {
        Self::new(AgentRole::Ai, content)
    }

    pub fn tool(content: impl Into<MessageContent>, tool_call_id: impl Into<String>) -> Self {
        let mut message = Self::new(AgentRole::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Maps an agent message to its storable form. Roles other than human and tool become AI messages.
pub fn to_new_message(message: &AgentMessage) -> NewMessage {
    let message_type = message.role.message_type();
    let tool_call_id = match message_type {
        MessageType::ToolMessage => message.tool_call_id.clone().filter(|id| !id.is_empty()),
        _ => None,
    };
    NewMessage {
        message_type,
        content: Some(message.content.clone()),
        tool_calls: (!message.tool_calls.is_empty()).then(|| message.tool_calls.clone()),
        tool_call_id,
    }
}

pub fn to_new_messages(messages: &[AgentMessage]) -> Vec<NewMessage> {
    messages.iter().map(to_new_message).collect()
}

/// Maps a stored message to the agent's shape.
///
/// Tool results with block content are split: text blocks stay tool results,
/// image blocks travel as human messages so the agent can see them.
pub fn to_agent_message(message: &NewMessage) -> Vec<AgentMessage> {
    let content = message.content.clone().unwrap_or_default();
    match message.message_type {
        MessageType::HumanMessage => vec![AgentMessage::human(content)],
        MessageType::AiMessage => {
            vec![AgentMessage::ai(content).with_tool_calls(message.tool_calls.clone().unwrap_or_default())]
        }
        MessageType::ToolMessage => {
            let tool_call_id = message.tool_call_id.clone().unwrap_or_default();
            match content {
                MessageContent::Text(text) => vec![AgentMessage::tool(text, tool_call_id)],
                MessageContent::Blocks(blocks) => blocks
                    .into_iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => {
                            AgentMessage::tool(text, tool_call_id.clone())
                        }
                        image @ ContentBlock::ImageUrl { .. } => {
                            AgentMessage::human(MessageContent::Blocks(vec![image]))
                        }
                    })
                    .collect(),
            }
        }
    }
}

pub fn to_agent_messages(messages: &[NewMessage]) -> Vec<AgentMessage> {
    messages.iter().flat_map(to_agent_message).collect()
}

/// Substitutes `{key}` placeholders in the string content of human messages.
/// Placeholders without a matching parameter are left as written.
pub fn parameterize(
    messages: &[AgentMessage],
    parameters: &HashMap<String, String>,
) -> Vec<AgentMessage> {
    messages
        .iter()
        .map(|message| {
            let mut message = message.clone();
            if message.role == AgentRole::Human {
                if let MessageContent::Text(text) = &message.content {
                    message.content = MessageContent::Text(fill_placeholders(text, parameters));
                }
            }
            message
        })
        .collect()
}

fn fill_placeholders(template: &str, parameters: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            parameters
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Checks raw JSON messages before anything is written, reporting the first bad index.
pub fn validate_raw_messages(raw: &[Value]) -> Result<Vec<NewMessage>, RunError> {
    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            let message: NewMessage = serde_json::from_value(value.clone()).map_err(|err| {
                RunError::Validation {
                    index,
                    reason: err.to_string(),
                }
            })?;
            message
                .validate()
                .map_err(|reason| RunError::Validation { index, reason })?;
            Ok(message)
        })
        .collect()
}

/// String content is stored verbatim, block content as its JSON serialization.
pub fn encode_content(content: Option<&MessageContent>) -> Result<Option<String>, RunError> {
    match content {
        None => Ok(None),
        Some(MessageContent::Text(text)) => Ok(Some(text.clone())),
        Some(MessageContent::Blocks(blocks)) => Ok(Some(serde_json::to_string(blocks)?)),
    }
}

/// Reads stored content back. Text that parses as a content block or a list
/// of blocks comes back as blocks, anything else as the original string.
pub fn decode_content(column: Option<String>) -> Option<MessageContent> {
    let raw = column?;
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        if let Ok(blocks) = serde_json::from_str::<Vec<ContentBlock>>(&raw) {
            return Some(MessageContent::Blocks(blocks));
        }
    } else if trimmed.starts_with('{') {
        if let Ok(block) = serde_json::from_str::<ContentBlock>(&raw) {
            return Some(MessageContent::Blocks(vec![block]));
        }
    }
    Some(MessageContent::Text(raw))
}

pub fn encode_tool_calls(tool_calls: Option<&[ToolCall]>) -> Result<Option<String>, RunError> {
    match tool_calls {
        Some(calls) if !calls.is_empty() => Ok(Some(serde_json::to_string(calls)?)),
        _ => Ok(None),
    }
}

/// Reads stored tool calls back. Empty, empty-list and unparseable values read as absent.
pub fn decode_tool_calls(column: Option<&str>) -> Option<Vec<ToolCall>> {
    let raw = column.filter(|raw| !raw.trim().is_empty())?;
    match serde_json::from_str::<Vec<ToolCall>>(raw) {
        Ok(calls) => (!calls.is_empty()).then_some(calls),
        Err(err) => {
            warn!("Ignoring stored tool calls that are not valid JSON: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_map_to_message_types() {
        let unknown: AgentRole = serde_json::from_value(json!("system")).unwrap();
        assert_eq!(unknown, AgentRole::Other);

        let stored = to_new_message(&AgentMessage::new(unknown, "hello"));
        assert_eq!(stored.message_type, MessageType::AiMessage);

        let human = to_new_message(&AgentMessage::human("hi"));
        assert_eq!(human.message_type, MessageType::HumanMessage);
    }

    #[test]
    fn tool_message_keeps_call_id_and_drops_it_elsewhere() {
        let tool = to_new_message(&AgentMessage::tool("42", "call-7"));
        assert_eq!(tool.message_type, MessageType::ToolMessage);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-7"));

        let mut ai = AgentMessage::ai("done");
        ai.tool_call_id = Some("stray".to_string());
        assert_eq!(to_new_message(&ai).tool_call_id, None);
    }

    #[test]
    fn ai_tool_calls_survive_both_directions() {
        let call = ToolCall::new("search", json!({"q": "rust"})).with_id("c1");
        let agent = AgentMessage::ai("").with_tool_calls(vec![call.clone()]);
        let stored = to_new_message(&agent);
        assert_eq!(stored.tool_calls, Some(vec![call.clone()]));

        let back = to_agent_message(&stored);
        assert_eq!(back, vec![agent]);
    }

    #[test]
    fn missing_content_becomes_empty_text() {
        let mut message = NewMessage::human("x");
        message.content = None;
        let agent = to_agent_message(&message);
        assert_eq!(agent[0].content, MessageContent::Text(String::new()));

        let mut tool = NewMessage::tool("x", "c1");
        tool.content = None;
        tool.tool_call_id = None;
        let agent = to_agent_message(&tool);
        assert_eq!(agent[0].tool_call_id.as_deref(), Some(""));
    }

    #[test]
    fn tool_blocks_split_into_tool_and_human_messages() {
        let message = NewMessage::tool(
            MessageContent::Blocks(vec![
                ContentBlock::text("screenshot taken"),
                ContentBlock::image("http://img/1.png"),
                ContentBlock::text("second note"),
            ]),
            "call-3",
        );

        let agent = to_agent_message(&message);
        assert_eq!(agent.len(), 3);
        assert_eq!(agent[0], AgentMessage::tool("screenshot taken", "call-3"));
        assert_eq!(
            agent[1],
            AgentMessage::human(MessageContent::Blocks(vec![ContentBlock::image(
                "http://img/1.png"
            )]))
        );
        assert_eq!(agent[2], AgentMessage::tool("second note", "call-3"));
    }

    #[test]
    fn parameterize_fills_human_text_only() {
        let messages = vec![
            AgentMessage::human("Book a trip to {city} on {date}"),
            AgentMessage::ai("Going to {city}"),
        ];
        let params = HashMap::from([("city".to_string(), "Lisbon".to_string())]);

        let filled = parameterize(&messages, &params);
        assert_eq!(
            filled[0].content,
            MessageContent::from("Book a trip to Lisbon on {date}")
        );
        assert_eq!(filled[1].content, MessageContent::from("Going to {city}"));
    }

    #[test]
    fn raw_validation_reports_first_bad_index() {
        let raw = vec![
            json!({"type": "HumanMessage", "content": "hi"}),
            json!({"type": "Narrator", "content": "?"}),
            json!({"type": "AiMessage", "toolCalls": [{"name": "", "args": {"input": "a"}}]}),
        ];
        let err = validate_raw_messages(&raw).unwrap_err();
        assert!(matches!(err, RunError::Validation { index: 1, .. }));

        let ok = validate_raw_messages(&raw[..1]).unwrap();
        assert_eq!(ok, vec![NewMessage::human("hi")]);
    }

    #[test]
    fn content_codec_keeps_strings_verbatim() {
        let blocks = MessageContent::Blocks(vec![ContentBlock::text("a"), ContentBlock::image("u")]);
        let encoded = encode_content(Some(&blocks)).unwrap();
        assert_eq!(decode_content(encoded), Some(blocks));

        let text = MessageContent::from("[not json] {either}");
        let encoded = encode_content(Some(&text)).unwrap();
        assert_eq!(encoded.as_deref(), Some("[not json] {either}"));
        assert_eq!(decode_content(encoded), Some(text));

        assert_eq!(
            decode_content(Some(r#"{"type": "text", "text": "solo"}"#.to_string())),
            Some(MessageContent::Blocks(vec![ContentBlock::text("solo")]))
        );
        assert_eq!(
            decode_content(Some(r#"{"answer": 42}"#.to_string())),
            Some(MessageContent::from(r#"{"answer": 42}"#))
        );
        assert_eq!(decode_content(None), None);
    }

    #[test]
    fn empty_tool_call_lists_read_as_absent() {
        let no_calls: &[ToolCall] = &[];
        assert_eq!(encode_tool_calls(Some(no_calls)).unwrap(), None);
        assert_eq!(decode_tool_calls(Some("[]")), None);
        assert_eq!(decode_tool_calls(Some("")), None);
        assert_eq!(decode_tool_calls(None), None);
        assert_eq!(decode_tool_calls(Some("{broken")), None);

        let calls = vec![ToolCall::new("echo", json!("hi"))];
        let encoded = encode_tool_calls(Some(&calls)).unwrap();
        assert_eq!(decode_tool_calls(encoded.as_deref()), Some(calls));
    }
}
