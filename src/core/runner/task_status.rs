use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::mapper::AgentMessage;
use crate::core::model::DEFAULT_TASK_STATUS;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").expect("fenced json pattern")
});

pub const DEFAULT_REASON: &str = "Ai didn't express a reason";

/// The agent's own verdict on the task it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssessment {
    pub task_status: String,
    pub reason: String,
}

impl Default for TaskAssessment {
    fn default() -> Self {
        Self {
            task_status: DEFAULT_TASK_STATUS.to_string(),
            reason: DEFAULT_REASON.to_string(),
        }
    }
}

/// Values an agent is asked to choose from when it reports on a task.
pub const TASK_STATUS_CHOICES: [&str; 3] = ["success", "failure", "needHumanHelp"];

/// Instructions that ask an agent to end its turn with a verdict block that
/// [`extract_task_status`] can read. Criteria lines appear only when given.
pub fn evaluate_task_prompt(
    success: Option<&str>,
    failure: Option<&str>,
    need_human_help: Option<&str>,
) -> String {
    let mut prompt = String::from("Important:\n");
    for (label, criteria) in [
        ("success", success),
        ("failure", failure),
        ("need human help", need_human_help),
    ] {
        if let Some(criteria) = criteria.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str(&format!("- The {label} criteria is {criteria}.\n"));
        }
    }

    let choices = TASK_STATUS_CHOICES
        .iter()
        .map(|choice| format!("\"{choice}\""))
        .collect::<Vec<_>>()
        .join(", ");
    prompt.push_str(&format!(
        "If any of these criteria are met, the task is considered done. \
         Output a message in the following format, with taskStatus set to one of {choices}:\n\n\
         ```json\n\
         {{\n  \"taskStatus\": \"success\",\n  \"reason\": \"The issue you're facing\"\n}}\n\
         ```\n\n\
         If the task is not successful, clearly explain the reason you're facing and what you've tried so far."
    ));
    prompt
}

/// Scans message text for ```json fenced objects carrying `taskStatus` and
/// `reason`. The last well-formed one wins; malformed blocks are skipped.
pub fn extract_task_status(messages: &[AgentMessage]) -> TaskAssessment {
    let mut assessment = TaskAssessment::default();
    for message in messages {
        for text in message.content.texts() {
            for captures in FENCED_JSON.captures_iter(text) {
                let parsed = captures
                    .get(1)
                    .and_then(|block| serde_json::from_str::<TaskAssessment>(block.as_str()).ok());
                if let Some(found) = parsed {
                    assessment = found;
                }
            }
        }
    }
    assessment
}
