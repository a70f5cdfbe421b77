use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::handlers::{replay, runs};

pub fn build_api_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health-check", get(runs::health_check))
        .route("/runs", get(runs::list_runs).post(runs::create_run))
        .route("/runs/batch", post(runs::create_runs_batch))
        .route("/runs/{run_id}", get(runs::get_run))
        .route("/runs/{run_id}/messages", get(runs::get_run_messages))
        .route(
            "/runs/{run_id}/messages/{message_id}",
            get(runs::get_run_message),
        )
        .route("/replay", post(replay::replay_message))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapper::AgentMessage;
    use crate::core::model::{MessageType, NewMessage, Run, RunStatus, ToolCall};
    use crate::core::runner::RunProcessor;
    use crate::core::model::{RunFilters, SortOrder};
    use crate::core::store::{RunStore, SqliteRunStore, test_run_store};
    use crate::core::tools::ToolRegistry;
    use crate::core::tools::builtin::EchoTool;
    use crate::interfaces::dispatch::RunDispatcher;
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        state_with_store(Arc::new(test_run_store()))
    }

    fn state_with_store(store: Arc<SqliteRunStore>) -> AppState {
        let store: Arc<dyn RunStore> = store;
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        let tools = Arc::new(tools);
        let processor = Arc::new(RunProcessor::new(store.clone(), tools.clone()));
        AppState {
            store,
            tools,
            dispatcher: RunDispatcher::InProcess(processor),
            baseline_messages: Arc::new(vec![
                AgentMessage::human("Plan a trip to {city}"),
                AgentMessage::ai("")
                    .with_tool_calls(vec![ToolCall::new("echo", json!("{city}"))]),
            ]),
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn wait_for_completion(store: &Arc<dyn RunStore>, run_id: &str) -> Run {
        for _ in 0..200 {
            let run = store.get_run(run_id).await.unwrap();
            if run.status.is_terminal() && run.reason.is_some() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not complete");
    }

    fn echo_call(input: Value) -> Value {
        json!({
            "type": "AiMessage",
            "content": "",
            "toolCalls": [{"name": "echo", "args": {"input": input}, "type": "tool_call"}]
        })
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let app = build_api_router(test_state());
        let (status, body) = json_request(app, Method::GET, "/health-check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/health-check")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(resp.headers().contains_key("content-security-policy"));
    }

    #[tokio::test]
    async fn create_run_processes_tools_only_replay() {
        let state = test_state();
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app,
            Method::POST,
            "/runs",
            Some(json!({
                "replayMessages": [echo_call(json!("hi"))],
                "toolsOnly": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "scheduled");

        let run_id = body["id"].as_str().unwrap().to_string();
        let run = wait_for_completion(&state.store, &run_id).await;
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.task_status, "unknown");

        let messages = state.store.get_all_messages(&run_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::AiMessage);
    }

    #[tokio::test]
    async fn create_run_templates_config_messages() {
        let state = test_state();
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app,
            Method::POST,
            "/runs",
            Some(json!({
                "parameters": {"city": "Lisbon"},
                "includeConfigMessages": true,
                "toolsOnly": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let run_id = body["id"].as_str().unwrap().to_string();
        wait_for_completion(&state.store, &run_id).await;
        let messages = state.store.get_all_messages(&run_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].content.as_ref().unwrap().texts(),
            vec!["Plan a trip to Lisbon"]
        );
        // Only human text is templated.
        let calls = messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].args.input, json!("{city}"));
    }

    #[tokio::test]
    async fn invalid_replay_message_is_rejected_before_run_creation() {
        let state = test_state();
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app,
            Method::POST,
            "/runs",
            Some(json!({
                "replayMessages": [
                    {"type": "HumanMessage", "content": "hello"},
                    echo_call(json!(42))
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["details"]
                .as_str()
                .unwrap()
                .starts_with("Invalid message at index 1")
        );
        assert_eq!(
            state
                .store
                .get_runs_count(&Default::default())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/runs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_creates_one_run_per_parameter_set() {
        let state = test_state();
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app,
            Method::POST,
            "/runs/batch",
            Some(json!({
                "parameters": [{"city": "Oslo"}, {"city": "Rome"}],
                "includeConfigMessages": true,
                "toolsOnly": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let runs = body["runs"].as_array().unwrap();
        assert_eq!(runs.len(), 2);

        for (run, city) in runs.iter().zip(["Oslo", "Rome"]) {
            let run_id = run["id"].as_str().unwrap();
            let done = wait_for_completion(&state.store, run_id).await;
            assert_eq!(done.status, RunStatus::Done);
            let messages = state.store.get_all_messages(run_id).await.unwrap();
            let expected = format!("Plan a trip to {city}");
            assert_eq!(
                messages[0].content.as_ref().unwrap().texts(),
                vec![expected.as_str()]
            );
        }
    }

    #[tokio::test]
    async fn batch_storage_failure_fails_every_created_run() {
        let sqlite = Arc::new(test_run_store());
        sqlite
            .get_db()
            .lock()
            .await
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON messages
                 WHEN NEW.content LIKE '%poison%'
                 BEGIN SELECT RAISE(ABORT, 'injected fault'); END;",
            )
            .unwrap();
        let state = state_with_store(sqlite);
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app,
            Method::POST,
            "/runs/batch",
            Some(json!({
                "parameters": [{"city": "Oslo"}, {"city": "poison"}],
                "includeConfigMessages": true,
                "toolsOnly": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");

        let count = |status: &str| RunFilters {
            status: Some(status.to_string()),
            task_status: None,
        };
        assert_eq!(state.store.get_runs_count(&count("scheduled")).await.unwrap(), 0);
        assert_eq!(state.store.get_runs_count(&count("failed")).await.unwrap(), 2);

        let runs = state
            .store
            .get_runs(10, 0, SortOrder::Asc, &RunFilters::default())
            .await
            .unwrap();
        assert_eq!(runs[0].task_status, "failed");
        assert!(
            runs[0]
                .reason
                .as_deref()
                .unwrap()
                .starts_with("Batch creation failed:")
        );
        assert!(runs[1].reason.as_deref().unwrap().contains("injected fault"));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let app = build_api_router(test_state());
        let (status, _) = json_request(
            app,
            Method::POST,
            "/runs/batch",
            Some(json!({"parameters": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_runs_paginates_and_filters() {
        let state = test_state();
        for _ in 0..3 {
            state.store.create_run().await.unwrap();
        }
        let app = build_api_router(state.clone());

        let (status, body) =
            json_request(app.clone(), Method::GET, "/runs?page=2&limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);
        assert_eq!(body["pagination"]["currentPage"], 2);
        assert_eq!(body["pagination"]["totalPages"], 2);
        assert_eq!(body["pagination"]["totalCount"], 3);
        assert_eq!(body["pagination"]["limit"], 2);

        let (_, body) = json_request(app.clone(), Method::GET, "/runs?order=asc", None).await;
        let ids: Vec<_> = body["runs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap().parse::<i64>().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let (_, body) = json_request(app, Method::GET, "/runs?status=done", None).await;
        assert_eq!(body["pagination"]["totalCount"], 0);
        assert_eq!(body["pagination"]["totalPages"], 0);
    }

    #[tokio::test]
    async fn list_runs_tolerates_bad_paging_values() {
        let state = test_state();
        for _ in 0..12 {
            state.store.create_run().await.unwrap();
        }
        let app = build_api_router(state);

        let (status, body) =
            json_request(app.clone(), Method::GET, "/runs?page=abc&limit=-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["currentPage"], 1);
        assert_eq!(body["pagination"]["limit"], 1);
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);

        let (status, body) =
            json_request(app.clone(), Method::GET, "/runs?page=-3&limit=ten", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["currentPage"], 1);
        assert_eq!(body["pagination"]["limit"], 10);
        assert_eq!(body["pagination"]["totalPages"], 2);

        let (status, body) = json_request(app, Method::GET, "/runs?limit=5000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["limit"], 100);
        assert_eq!(body["runs"].as_array().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = build_api_router(test_state());
        let (status, body) = json_request(app.clone(), Method::GET, "/runs/404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");

        let (status, _) = json_request(app, Method::GET, "/runs/404/messages", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn messages_are_served_per_run() {
        let state = test_state();
        let run = state.store.create_run().await.unwrap();
        let ids = state
            .store
            .insert_messages(
                &run.id,
                &[NewMessage::human("hello"), NewMessage::ai("hi there")],
            )
            .await
            .unwrap();
        let app = build_api_router(state);

        let (status, body) = json_request(
            app.clone(),
            Method::GET,
            &format!("/runs/{}/messages", run.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["type"], "HumanMessage");
        assert_eq!(body[0]["runId"], json!(run.id));

        let (status, body) = json_request(
            app,
            Method::GET,
            &format!("/runs/{}/messages/{}", run.id, ids[1]),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "hi there");
    }

    #[tokio::test]
    async fn replay_executes_stored_tool_calls() {
        let state = test_state();
        let run = state.store.create_run().await.unwrap();
        let ids = state
            .store
            .insert_messages(
                &run.id,
                &[
                    NewMessage::ai("").with_tool_calls(vec![ToolCall::new("echo", json!("ping"))]),
                    NewMessage::human("no tools here"),
                    NewMessage::ai("").with_tool_calls(vec![ToolCall::new("missing", json!("x"))]),
                ],
            )
            .await
            .unwrap();
        let app = build_api_router(state.clone());

        let (status, body) = json_request(
            app.clone(),
            Method::POST,
            "/replay",
            Some(json!({"runId": run.id, "messageId": ids[0]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["toolCallName"], "echo");
        assert_eq!(body["results"][0]["result"], "ping");

        let (status, body) = json_request(
            app.clone(),
            Method::POST,
            "/replay",
            Some(json!({"runId": run.id, "messageId": ids[1]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No tools to execute");

        let (status, body) = json_request(
            app.clone(),
            Method::POST,
            "/replay",
            Some(json!({"runId": run.id, "messageId": ids[2]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Tool not found");

        let (status, _) = json_request(
            app,
            Method::POST,
            "/replay",
            Some(json!({"runId": run.id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Replaying never moves the run.
        let run = state.store.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
    }
}
