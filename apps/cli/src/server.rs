//! HTTP control surface: triggers, status, reset, cancel, export, and the
//! SSE progress stream.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream};
use planindex_core::{ContextTree, ControlService, ProcessingStatus, StreamItem, TriggerResponse};
use planindex_shared::PlanIndexError;
use serde_json::{Value, json};
use tracing::{debug, error, info};

/// A library error rendered as a JSON error body.
pub(crate) struct ApiError(PlanIndexError);

impl From<PlanIndexError> for ApiError {
    fn from(e: PlanIndexError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            PlanIndexError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            PlanIndexError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            PlanIndexError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            PlanIndexError::Validation { .. } | PlanIndexError::Parse { .. } => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn build_router(control: ControlService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects/{id}/process-pages", post(process_pages))
        .route("/projects/{id}/process-disciplines", post(process_disciplines))
        .route("/projects/{id}/processing-status", get(processing_status))
        .route("/projects/{id}/processing-progress", get(processing_progress))
        .route("/projects/{id}/reset-page-processing", post(reset_page_processing))
        .route("/projects/{id}/cancel", post(cancel))
        .route("/projects/{id}/export", get(export))
        .with_state(control)
}

/// Bind and serve until ctrl-c.
pub(crate) async fn serve(control: ControlService, bind: &str) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "HTTP server listening");

    axum::serve(listener, build_router(control))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

// -- Handlers --

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn process_pages(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    Ok(Json(control.trigger_pages(&id).await?))
}

async fn process_disciplines(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    Ok(Json(control.trigger_disciplines(&id).await?))
}

async fn processing_status(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProcessingStatus>> {
    Ok(Json(control.status(&id).await?))
}

async fn reset_page_processing(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let counts = control.reset(&id).await?;
    Ok(Json(json!({
        "pages_reset": counts.pages_reset,
        "disciplines_reset": counts.disciplines_reset,
    })))
}

async fn cancel(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cancelled: Vec<String> = control
        .cancel(&id)
        .await?
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn export(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContextTree>> {
    Ok(Json(control.export(&id).await?))
}

async fn processing_progress(
    State(control): State<ControlService>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = control.subscribe(&id).await?;
    info!(project_id = %id, "progress subscriber connected");

    let events = stream::unfold((subscription, id), |(mut subscription, id)| async move {
        let item = subscription.next().await?;
        let event = sse_event(&id, item);
        Some((Ok(event), (subscription, id)))
    });
    Ok(Sse::new(events))
}

fn sse_event(project_id: &str, item: StreamItem) -> Event {
    match item {
        StreamItem::Connected => Event::default()
            .event("connected")
            .data(json!({ "projectId": project_id }).to_string()),
        StreamItem::Event(update) => {
            debug!(event = update.name(), "progress event");
            Event::default()
                .event(update.name())
                .data(update.payload().to_string())
        }
        StreamItem::KeepAlive => Event::default().comment("keepalive"),
    }
}
