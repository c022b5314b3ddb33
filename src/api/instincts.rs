//! Instinct operations: list, show, extract, delete.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::MnemoError;
use crate::learn;
use crate::util::LooseJson;
use crate::AppState;

use super::run_blocking;

#[derive(Deserialize)]
pub(super) struct ListParams {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

pub(super) async fn list_instincts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let floor = params.min_confidence.unwrap_or(0.0);
    let mut instincts = run_blocking(move || learn::injectable_instincts(&store, floor)).await??;
    if let Some(ref domain) = params.domain {
        instincts.retain(|i| i.record.domain == *domain);
    }
    let items: Vec<serde_json::Value> = instincts
        .iter()
        .map(|i| json!({ "key": i.key, "instinct": i.record }))
        .collect();
    Ok(Json(json!({ "count": items.len(), "instincts": items })))
}

pub(super) async fn show_instinct(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let fact = run_blocking(move || store.active(&key)).await??;
    let Some(fact) = fact else {
        return Err(MnemoError::NotFound);
    };
    let instinct: learn::Instinct = serde_json::from_str(&fact.value)
        .map_err(|e| MnemoError::Validation(format!("not an instinct record: {e}")))?;
    Ok(Json(json!({ "key": fact.key, "instinct": instinct, "since": fact.start_time })))
}

pub(super) async fn delete_instinct(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    if !key.starts_with("agent.instinct.") {
        return Err(MnemoError::Validation("not an instinct key".into()));
    }
    let store = state.store.clone();
    let deleted = run_blocking(move || store.delete(&key)).await??;
    if !deleted {
        return Err(MnemoError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize, Default)]
pub(super) struct ExtractRequest {
    #[serde(default)]
    min_confidence: Option<f64>,
    /// Persist the derived instincts (default: dry run).
    #[serde(default)]
    store: bool,
}

pub(super) async fn extract_instincts_op(
    State(state): State<AppState>,
    LooseJson(req): LooseJson<ExtractRequest>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let floor = req
        .min_confidence
        .unwrap_or(state.cfg.instinct.min_confidence);
    let persist = req.store;
    let store = state.store.clone();
    let (instincts, stored) = run_blocking(move || -> Result<_, MnemoError> {
        let instincts = learn::extract_instincts(&store, floor)?;
        let stored = if persist {
            learn::store_instincts(&store, &instincts)?
        } else {
            0
        };
        Ok((instincts, stored))
    })
    .await??;

    let items: Vec<serde_json::Value> = instincts
        .iter()
        .map(|i| json!({ "key": i.key, "instinct": i.record }))
        .collect();
    Ok(Json(json!({
        "count": items.len(),
        "stored": stored,
        "instincts": items,
    })))
}
