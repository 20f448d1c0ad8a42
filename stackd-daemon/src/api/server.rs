//! HTTP server implementation.
//!
//! Routes mirror the lifecycle operations: `GET /stacks` lists the
//! inventory, `PUT /stack/{project}` converges a stack from the compose
//! document in the request body, `POST /stack/{project}/down` tears one
//! down. Convergence and teardown stream the underlying tool output as it
//! arrives; validation runs before the stream starts, so malformed
//! documents still get a proper error status.

use crate::api::page;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use bytes::Bytes;
use stackd_core::{StackInventory, StackManager, StackdError};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

struct AppState {
    manager: Arc<StackManager>,
    inventory: Arc<StackInventory>,
}

pub fn router(manager: Arc<StackManager>, inventory: Arc<StackInventory>) -> Router {
    let state = Arc::new(AppState { manager, inventory });

    Router::new()
        .route("/", get(index))
        .route("/stacks", get(list_stacks))
        .route("/stack/{project}", put(stack_up))
        .route("/stack/{project}/down", post(stack_down))
        .fallback(|| async { ApiResponse::Status(StatusCode::NOT_FOUND) })
        .with_state(state)
}

/// Every handler outcome, written by one explicit switch.
enum ApiResponse {
    Status(StatusCode),
    Body { bytes: Bytes, content_type: &'static str },
    Stream { body: Body, content_type: &'static str },
    Error(StackdError),
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Status(code) => code.into_response(),
            ApiResponse::Body { bytes, content_type } => {
                ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
            }
            ApiResponse::Stream { body, content_type } => {
                ([(header::CONTENT_TYPE, content_type)], body).into_response()
            }
            ApiResponse::Error(e) => {
                let status = if e.is_user_error() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, format!("{}\n", e)).into_response()
            }
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(page::INDEX_HTML)
}

#[instrument(skip(state))]
async fn list_stacks(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.inventory.list_stacks().await {
        Ok(stacks) => match serde_json::to_vec(&stacks) {
            Ok(bytes) => ApiResponse::Body {
                bytes: bytes.into(),
                content_type: "application/json",
            },
            Err(e) => ApiResponse::Error(StackdError::internal(e)),
        },
        Err(e) => ApiResponse::Error(e),
    }
}

#[instrument(skip(state, body))]
async fn stack_up(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    body: String,
) -> ApiResponse {
    // Plan before streaming: document errors surface as a status code, not
    // as a truncated stream.
    let plan = match state.manager.plan_up(&project, &body).await {
        Ok(plan) => plan,
        Err(e) => return ApiResponse::Error(e),
    };

    info!(project = %plan.project, "Converging stack");
    let manager = state.manager.clone();
    stream_operation(move |tx, cancel| async move {
        manager.apply_up(&plan, tx, cancel).await
    })
    .await
}

#[instrument(skip(state, body))]
async fn stack_down(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    body: String,
) -> ApiResponse {
    let plan = match state.manager.plan_down(&project, &body).await {
        Ok(plan) => plan,
        Err(e) => return ApiResponse::Error(e),
    };

    info!(project = %plan.project, "Tearing down stack");
    let manager = state.manager.clone();
    stream_operation(move |tx, cancel| async move {
        manager.apply_down(&plan, tx, cancel).await
    })
    .await
}

/// Run a lifecycle operation on its own task. The HTTP status is decided
/// by whatever happens first: once the operation emits output, a 200
/// stream starts and any later failure is appended to it, since the
/// status line is already on the wire; an operation that finishes without
/// emitting anything gets a real status code instead (200 on exit code 0,
/// an error status otherwise). A client disconnect cancels the operation.
async fn stream_operation<F, Fut>(operation: F) -> ApiResponse
where
    F: FnOnce(mpsc::Sender<Bytes>, CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = stackd_core::Result<i32>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let cancel = CancellationToken::new();
    // Dropping this handler before the response is built (client gone
    // mid-plan) must also cancel the operation.
    let guard = cancel.clone().drop_guard();

    let worker = tokio::spawn(operation(tx, cancel.clone()));

    let Some(first) = rx.recv().await else {
        // No output at all; the outcome maps to a plain status.
        let _ = guard.disarm();
        return match worker.await {
            Ok(Ok(0)) => ApiResponse::Status(StatusCode::OK),
            Ok(Ok(code)) => {
                ApiResponse::Error(StackdError::Internal(format!("Exited with code {}", code)))
            }
            Ok(Err(e)) => ApiResponse::Error(e),
            Err(e) => ApiResponse::Error(StackdError::Internal(format!("Task failed: {}", e))),
        };
    };

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        let mut pending = Some(first);
        let completed = loop {
            if let Some(chunk) = pending.take() {
                if out_tx.send(chunk).await.is_err() {
                    warn!("Client disconnected, cancelling operation");
                    cancel.cancel();
                    break false;
                }
                continue;
            }
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => pending = Some(chunk),
                    None => break true,
                },
                _ = out_tx.closed() => {
                    warn!("Client disconnected, cancelling operation");
                    cancel.cancel();
                    break false;
                }
            }
        };

        let result = worker.await;
        if completed {
            let trailer = match result {
                Ok(Ok(code)) => format!("\nExit code: {}\n", code),
                Ok(Err(e)) => format!("\nERROR: {}\n", e),
                Err(e) => format!("\nERROR: {}\n", e),
            };
            let _ = out_tx.send(Bytes::from(trailer)).await;
        }
    });

    let _ = guard.disarm();
    let body = Body::from_stream(ReceiverStream::new(out_rx).map(Ok::<_, Infallible>));
    ApiResponse::Stream { body, content_type: "text/plain; charset=utf-8" }
}
