use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::core::error::RunError;
use crate::core::mapper::{parameterize, to_new_messages, validate_raw_messages};
use crate::core::model::{Message, NewMessage, Run, RunFilters, SortOrder};
use crate::core::runner::{RunJob, fail_run};

use super::super::AppState;
use super::super::error::ApiError;

const DEFAULT_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;

pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunsQuery {
    page: Option<String>,
    limit: Option<String>,
    order: Option<String>,
    status: Option<String>,
    task_status: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    current_page: u64,
    total_pages: u64,
    total_count: u64,
    limit: u32,
}

#[derive(Serialize)]
pub struct RunsPage {
    runs: Vec<Run>,
    pagination: Pagination,
}

/// 1-based page; missing or unparsable values fall back to the first page.
fn page_number(raw: Option<&str>) -> u64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .map_or(1, |page| page.max(1) as u64)
}

/// Page size clamped to `1..=MAX_PAGE_SIZE`; unparsable values use the default.
fn page_size(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .map_or(DEFAULT_PAGE_SIZE, |limit| {
            limit.clamp(1, i64::from(MAX_PAGE_SIZE)) as u32
        })
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsPage>, ApiError> {
    let page = page_number(query.page.as_deref());
    let limit = page_size(query.limit.as_deref());
    let order = query
        .order
        .as_deref()
        .map(SortOrder::from_query)
        .unwrap_or_default();
    let filters = RunFilters {
        status: query.status.filter(|s| !s.is_empty()),
        task_status: query.task_status.filter(|s| !s.is_empty()),
    };

    let offset = (page - 1).saturating_mul(u64::from(limit));
    let runs = state.store.get_runs(limit, offset, order, &filters).await?;
    let total_count = state.store.get_runs_count(&filters).await?;

    Ok(Json(RunsPage {
        runs,
        pagination: Pagination {
            current_page: page,
            total_pages: total_count.div_ceil(u64::from(limit)),
            total_count,
            limit,
        },
    }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.store.get_run(&run_id).await?))
}

pub async fn get_run_messages(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(state.store.get_all_messages(&run_id).await?))
}

pub async fn get_run_message(
    State(state): State<AppState>,
    Path((run_id, message_id)): Path<(String, String)>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(state.store.get_message(&run_id, &message_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    replay_messages: Vec<Value>,
    #[serde(default)]
    include_config_messages: bool,
    #[serde(default)]
    tools_only: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunsBatchRequest {
    parameters: Vec<Map<String, Value>>,
    #[serde(default)]
    replay_messages: Vec<Value>,
    #[serde(default)]
    include_config_messages: bool,
    #[serde(default)]
    tools_only: bool,
}

#[derive(Serialize)]
pub struct CreatedRuns {
    runs: Vec<Run>,
}

/// Template parameters as strings. Non-string JSON values use their JSON text.
fn parameter_strings(parameters: &Map<String, Value>) -> HashMap<String, String> {
    parameters
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

/// Baseline messages (when requested) followed by the replayed messages,
/// fully validated. Indexes in errors count from the start of the batch.
fn build_batch(
    state: &AppState,
    parameters: &Map<String, Value>,
    replay_messages: &[Value],
    include_config_messages: bool,
) -> Result<Vec<NewMessage>, RunError> {
    let mut batch = if include_config_messages {
        to_new_messages(&parameterize(
            &state.baseline_messages,
            &parameter_strings(parameters),
        ))
    } else {
        Vec::new()
    };

    for (index, message) in batch.iter().enumerate() {
        message
            .validate()
            .map_err(|reason| RunError::Validation { index, reason })?;
    }

    let offset = batch.len();
    let replayed = validate_raw_messages(replay_messages).map_err(|err| match err {
        RunError::Validation { index, reason } => RunError::Validation {
            index: index + offset,
            reason,
        },
        other => other,
    })?;
    batch.extend(replayed);
    Ok(batch)
}

/// Creates the run and stores its messages. A run whose messages cannot be
/// stored is marked failed before the error is returned.
async fn schedule_run(state: &AppState, batch: Vec<NewMessage>, tools_only: bool) -> Result<RunJob, RunError> {
    let run = state.store.create_run().await?;
    if let Err(err) = state.store.insert_messages(&run.id, &batch).await {
        error!(run_id = %run.id, "Failed to store run messages: {}", err);
        let reason = err.to_string();
        if let Err(fail_err) = fail_run(state.store.as_ref(), &run.id, &reason).await {
            error!(run_id = %run.id, "Could not mark run failed: {}", fail_err);
        }
        return Err(err);
    }
    Ok(RunJob {
        run_id: run.id,
        messages: batch,
        tools_only,
    })
}

/// Fails runs of a batch that were created before a later run of the same batch failed.
/// None of them has been dispatched yet.
async fn abandon_runs(state: &AppState, jobs: &[RunJob], cause: &RunError) {
    let reason = format!("Batch creation failed: {cause}");
    for job in jobs {
        warn!(run_id = %job.run_id, "Abandoning run of failed batch");
        if let Err(fail_err) = fail_run(state.store.as_ref(), &job.run_id, &reason).await {
            error!(run_id = %job.run_id, "Could not mark run failed: {}", fail_err);
        }
    }
}

pub async fn create_run(
    State(state): State<AppState>,
    payload: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<Json<Run>, ApiError> {
    let Json(request) = payload?;
    let batch = build_batch(
        &state,
        &request.parameters,
        &request.replay_messages,
        request.include_config_messages,
    )?;

    let job = schedule_run(&state, batch, request.tools_only).await?;
    let run = state.store.get_run(&job.run_id).await?;
    info!(run_id = %run.id, messages = job.messages.len(), "Run scheduled");

    state.dispatcher.dispatch(vec![job]);
    Ok(Json(run))
}

pub async fn create_runs_batch(
    State(state): State<AppState>,
    payload: Result<Json<CreateRunsBatchRequest>, JsonRejection>,
) -> Result<Json<CreatedRuns>, ApiError> {
    let Json(request) = payload?;
    if request.parameters.is_empty() {
        return Err(ApiError::bad_request("parameters must not be empty"));
    }

    let batches = request
        .parameters
        .iter()
        .map(|parameters| {
            build_batch(
                &state,
                parameters,
                &request.replay_messages,
                request.include_config_messages,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut jobs: Vec<RunJob> = Vec::with_capacity(batches.len());
    let mut runs = Vec::with_capacity(batches.len());
    for batch in batches {
        let created = match schedule_run(&state, batch, request.tools_only).await {
            Ok(job) => {
                let run_id = job.run_id.clone();
                jobs.push(job);
                state.store.get_run(&run_id).await
            }
            Err(err) => Err(err),
        };
        match created {
            Ok(run) => runs.push(run),
            Err(err) => {
                abandon_runs(&state, &jobs, &err).await;
                return Err(err.into());
            }
        }
    }
    info!(count = jobs.len(), "Run batch scheduled");

    state.dispatcher.dispatch(jobs);
    Ok(Json(CreatedRuns { runs }))
}
