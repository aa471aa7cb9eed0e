//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::extract::{ApiJson, ApiQuery};
use super::state::AppState;
use crate::executor::{JobRequest, OutputEvent};
use crate::model::{ExecutionRecord, ExecutionStatus};
use crate::storage::{Filters, StatsPeriod};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/executions", get(list_executions).post(submit_execution))
        .route("/executions/{id}", get(get_execution).delete(cancel_execution))
        .route("/executions/{id}/stream", get(stream_execution))
        .route("/statistics", get(statistics))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/schedules/{id}", delete(delete_schedule))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_executions": state.executor.active_count(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn submit_execution(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<JobRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = state.executor.submit(&request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "id": id, "status": ExecutionStatus::Running } })),
    ))
}

async fn list_executions(
    State(state): State<AppState>,
    ApiQuery(filters): ApiQuery<Filters>,
) -> Result<Json<Value>, ApiError> {
    let records = state.executor.list(filters).await?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.executor.get(&id).await?;
    Ok(Json(json!({ "data": record })))
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.executor.cancel(&id).await?;
    let record = state.executor.get(&id).await?;
    Ok(Json(json!({ "data": { "id": id, "status": record.status } })))
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Live output as server-sent events: `line` per output line, then one
/// `completed` event carrying the final record. Finished executions whose
/// broker is gone are replayed from the store.
async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    let events: EventStream = match state.executor.attach(&id) {
        Some(rx) => stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await? {
                OutputEvent::Line(line) => Some((Ok::<_, Infallible>(line_event(line)), Some(rx))),
                OutputEvent::Completed(record) => Some((Ok(completed_event(&record)), None)),
            }
        })
        .boxed(),
        None => {
            let record = state.executor.get(&id).await?;
            if !record.status.is_terminal() {
                return Err(ApiError::not_found(format!(
                    "execution {id} has no live output stream"
                )));
            }
            let mut events: Vec<Result<Event, Infallible>> =
                record.output.iter().cloned().map(|l| Ok(line_event(l))).collect();
            events.push(Ok(completed_event(&record)));
            stream::iter(events).boxed()
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn line_event(line: String) -> Event {
    Event::default().event("line").data(line)
}

fn completed_event(record: &ExecutionRecord) -> Event {
    let data = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("completed").data(data)
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    period: Option<StatsPeriod>,
}

async fn statistics(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let period = query.period.unwrap_or_default();
    let stats = state.executor.statistics(period.window()).await?;
    Ok(Json(json!({ "data": stats, "meta": { "period": period.as_str() } })))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSchedule {
    name: String,
    cron_expr: String,
    template: JobRequest,
}

async fn create_schedule(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateSchedule>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("schedule name is required"));
    }
    let task = state
        .scheduler
        .create_schedule(&body.name, &body.cron_expr, body.template)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": task }))))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    let tasks = state.scheduler.list_schedules();
    Json(json!({ "data": tasks, "meta": { "total": tasks.len() } }))
}

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    #[serde(default = "default_dry_run_hours")]
    hours: u64,
}

fn default_dry_run_hours() -> u64 {
    24
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DryRunQuery>,
) -> Result<Json<Value>, ApiError> {
    let upcoming = state.scheduler.preview_next_runs(query.hours)?;
    Ok(Json(json!({ "data": { "upcoming": upcoming } })))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.delete_schedule(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
