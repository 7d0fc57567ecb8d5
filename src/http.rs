//! HTTP facade (spec §4.7): a thin `axum` layer over the [`Supervisor`].
//!
//! Mirrors the teacher's server-adjacent layering (a plain `Router` built
//! from `State`-carrying handlers, `tower_http::trace::TraceLayer` for
//! request logging) learned from the pack's other server examples, since
//! the teacher itself never ran an HTTP server (SPEC_FULL §2).

use crate::error::HostError;
use crate::supervisor::Supervisor;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
    model_path: Arc<PathBuf>,
}

/// Build the full router: `GET /` (status), `POST /` (start job),
/// `POST /terminate` (spec §4.7), plus a panic-catching 500 handler that
/// attempts a termination before responding (spec §4.7 "500 handler").
pub fn build_router(supervisor: Arc<Supervisor>, model_path: PathBuf) -> Router {
    let state = AppState { supervisor: supervisor.clone(), model_path: Arc::new(model_path) };

    let panic_supervisor = supervisor.clone();
    let catch_panic = CatchPanicLayer::custom(move |payload: Box<dyn std::any::Any + Send + 'static>| {
        let msg = panic_message(&payload);
        let sup = panic_supervisor.clone();
        // `CatchPanicLayer`'s callback is synchronous, but spec §4.7 requires
        // the 500 response itself to carry the snapshot (both tracebacks
        // recorded in `state.exception`) rather than a bare stub — so this
        // blocks the current runtime worker thread on the async termination
        // via `block_in_place`, which hands off its other queued tasks to the
        // rest of the (multi-threaded) runtime instead of stalling it.
        let snapshot = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(sup.handle_host_panic(msg))
        });
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(snapshot)).into_response()
    });

    Router::new()
        .route("/", get(get_status).post(post_job))
        .route("/terminate", post(post_terminate))
        .layer(catch_panic)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /` (spec §4.7, §6) — returns the current state snapshot.
async fn get_status(State(state): State<AppState>) -> Response {
    Json(state.supervisor.snapshot().await).into_response()
}

/// `POST /` (spec §4.7) — starts a new job, or `409` if one is already
/// running (spec §8 scenario 6). An unparsable body falls back to an empty
/// object rather than rejecting the request (spec §4.7 "parse JSON (empty
/// object on parse failure)") — so the raw bytes are read instead of using
/// the `Json` extractor, which would reject malformed bodies itself.
async fn post_job(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or_else(|_| serde_json::json!({}));
    match state.supervisor.start_job(&state.model_path, body).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            let err: HostError = err;
            err.into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TerminateRequest {
    timeout: Option<f64>,
}

/// `POST /terminate` (spec §4.6, §8 scenario 4/7). Body is optional; an
/// absent or unparsable body falls back to the default timeout.
async fn post_terminate(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let timeout = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<TerminateRequest>(&body).ok().and_then(|r| r.timeout)
    }
    .filter(|t| t.is_finite() && *t >= 0.0)
    .map(Duration::from_secs_f64)
    .unwrap_or(DEFAULT_TERMINATE_TIMEOUT);

    Json(state.supervisor.terminate(timeout).await).into_response()
}

fn panic_message(payload: &(dyn std::any::Any + Send + 'static)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "host panicked with a non-string payload".to_string()
    }
}
