//! HTTP routes.
//!
//! | Method   | Path                          | Purpose                          |
//! |----------|-------------------------------|----------------------------------|
//! | `POST`   | `/api/executions`             | Start a run (optionally streamed)|
//! | `GET`    | `/api/executions/{id}`        | Run summary                      |
//! | `DELETE` | `/api/executions/{id}`        | Cancel a run                     |
//! | `GET`    | `/api/executions/{id}/events` | Server-sent event stream         |
//! | `POST`   | `/api/tags`                   | Reference tags for a block       |
//! | `POST`   | `/api/tags/insert`            | Insert a selected tag            |
//! | `GET`    | `/health`                     | Liveness                         |

use crate::AppState;
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use blockflow_core::{BlockId, ExecutionId};
use blockflow_executor::{EventReceiver, RunSummary};
use blockflow_workflow::{Insertion, LiveValues, TagEngine, TagSet, WorkflowSnapshot, insert_tag};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/executions", post(start_execution))
        .route(
            "/api/executions/{id}",
            get(execution_summary).delete(cancel_execution),
        )
        .route("/api/executions/{id}/events", get(execution_events))
        .route("/api/tags", post(tags))
        .route("/api/tags/insert", post(insert))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Body of `POST /api/executions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecution {
    pub workflow: WorkflowSnapshot,
    #[serde(default)]
    pub input: JsonValue,
    /// Respond with the run's event stream instead of its id.
    #[serde(default)]
    pub stream: bool,
}

async fn start_execution(
    State(state): State<AppState>,
    Json(request): Json<StartExecution>,
) -> Result<Response, ApiError> {
    request.workflow.validate()?;
    let workflow = Arc::new(request.workflow);

    if request.stream {
        let (execution_id, events) = state.executions.start_subscribed(workflow, request.input);
        tracing::info!(%execution_id, "started streamed run");
        return Ok(event_stream(events).into_response());
    }

    let execution_id = state.executions.start(workflow, request.input);
    tracing::info!(%execution_id, "started run");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": execution_id })),
    )
        .into_response())
}

fn parse_execution_id(id: &str) -> Result<ExecutionId, ApiError> {
    id.parse().map_err(|e: blockflow_core::ParseIdError| ApiError::InvalidExecutionId {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

async fn execution_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunSummary>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    state
        .executions
        .summary(execution_id)
        .map(Json)
        .ok_or(ApiError::RunNotFound { id })
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    state.executions.cancel(execution_id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn execution_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    let events = state.executions.subscribe(execution_id)?;
    Ok(event_stream(events).into_response())
}

/// One SSE message per run event, named by event type.
///
/// The stream ends after the run's terminal event.
fn event_stream(events: EventReceiver) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = UnboundedReceiverStream::new(events).map(|envelope| {
        Event::default()
            .event(envelope.payload().kind())
            .json_data(&envelope)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Body of `POST /api/tags`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagsRequest {
    pub workflow: WorkflowSnapshot,
    pub block_id: BlockId,
    /// Unsaved editor values, overriding the workflow's persisted ones.
    #[serde(default)]
    pub live_values: LiveValues,
    /// Restrict the answer to this one source block.
    #[serde(default)]
    pub single_source: Option<BlockId>,
}

async fn tags(State(state): State<AppState>, Json(request): Json<TagsRequest>) -> Json<TagSet> {
    let engine = TagEngine::new(
        &request.workflow,
        state.registry.as_ref(),
        &request.live_values,
    );
    let tags = engine.tags_for(&request.block_id, request.single_source.as_ref());
    tracing::debug!(block_id = %request.block_id, groups = tags.groups.len(), "served tags");
    Json(tags)
}

/// Body of `POST /api/tags/insert`.
#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    pub text: String,
    /// Cursor position in characters.
    pub cursor: usize,
    pub tag: String,
}

async fn insert(Json(request): Json<InsertRequest>) -> Result<Json<Insertion>, ApiError> {
    insert_tag(&request.text, request.cursor, &request.tag)
        .map(Json)
        .ok_or(ApiError::NoOpenReference {
            cursor: request.cursor,
        })
}
