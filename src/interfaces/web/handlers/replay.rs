use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::tools::ToolResult;

use super::super::AppState;
use super::super::error::ApiError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    run_id: Option<String>,
    message_id: Option<String>,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    results: Vec<ToolResult>,
}

/// Re-executes the tool calls of one stored message. The run is not touched.
pub async fn replay_message(
    State(state): State<AppState>,
    payload: Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let Json(request) = payload?;
    let (Some(run_id), Some(message_id)) = (
        request.run_id.filter(|id| !id.is_empty()),
        request.message_id.filter(|id| !id.is_empty()),
    ) else {
        return Err(ApiError::bad_request("runId and messageId are required"));
    };

    let message = state.store.get_message(&run_id, &message_id).await?;
    let calls = message.tool_calls.unwrap_or_default();
    if calls.is_empty() {
        return Err(ApiError::bad_request("No tools to execute"));
    }

    info!(run_id = %run_id, message_id = %message_id, calls = calls.len(), "Replaying message");
    let results = state.tools.execute_tool_calls(&calls).await?;
    Ok(Json(ReplayResponse { results }))
}
