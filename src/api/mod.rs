//! HTTP surface for the query/mutation operations. The wire form is
//! incidental; hooks and the CLI call the same code paths.

use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::MnemoError;
use crate::AppState;

mod admin;
mod instincts;
mod memory;

use admin::*;
use instincts::*;
use memory::*;

/// The store is synchronous; every handler hops onto the blocking pool for
/// its store work so tokio workers stay free for network I/O. A join
/// failure here means the closure panicked, which is a bug, not a request
/// problem.
async fn run_blocking<T, F>(f: F) -> Result<T, MnemoError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(join) => Err(MnemoError::Internal(format!("blocking task: {join}"))),
    }
}

/// Bearer-token gate, active only when MNEMO_API_KEY was set at startup.
/// The token comparison runs in constant time so response latency leaks
/// nothing about how much of a guess was right.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
            next.run(req).await
        }
        _ => MnemoError::Unauthorized.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(health))
        .route("/health", get(health));

    let protected = Router::new()
        .route("/stats", get(stats))
        .route("/summary", get(summary))
        .route("/digest", get(digest))
        .route("/search", get(quick_search).post(full_search))
        .route("/facts", post(store_fact))
        .route("/facts/{key}", get(show_fact).delete(delete_fact))
        .route("/facts/{key}/history", get(fact_history))
        .route("/instincts", get(list_instincts))
        .route("/instincts/extract", post(extract_instincts_op))
        .route("/instincts/{key}", get(show_instinct).delete(delete_instinct))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
