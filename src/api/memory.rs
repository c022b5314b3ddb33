//! Memory operations: summary, search, store, direct fact access.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::aggregate::Aggregator;
use crate::error::MnemoError;
use crate::search::{self, SearchQuery};
use crate::store::{now_ms, FactInput};
use crate::util::LooseJson;
use crate::{query_embedding, AppState};

use super::run_blocking;

pub(super) async fn summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let cfg = state.cfg.clone();
    let paths = state.paths.clone();
    let store = state.store.clone();
    let line = run_blocking(move || Aggregator::new(&store, &cfg, &paths).summary_line()).await??;
    Ok(Json(json!({ "summary": line })))
}

pub(super) async fn digest(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let cfg = state.cfg.clone();
    let paths = state.paths.clone();
    let store = state.store.clone();
    let digest = run_blocking(move || Aggregator::new(&store, &cfg, &paths).digest()).await??;
    Ok(Json(serde_json::to_value(digest).map_err(|e| MnemoError::Internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub(super) struct QuickSearchParams {
    q: String,
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /search?q=…  — keyword-only convenience form.
pub(super) async fn quick_search(
    State(state): State<AppState>,
    Query(params): Query<QuickSearchParams>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let query = SearchQuery {
        text: Some(params.q),
        limit: params.limit.unwrap_or(10),
        ..Default::default()
    };
    run_search(state, query).await
}

/// POST /search — the full search surface, semantic included.
pub(super) async fn full_search(
    State(state): State<AppState>,
    LooseJson(query): LooseJson<SearchQuery>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    run_search(state, query).await
}

async fn run_search(
    state: AppState,
    query: SearchQuery,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let query_emb = match query.semantic.as_deref() {
        Some(text) => query_embedding(state.ai.as_ref(), &state.embed_cache, text).await,
        None => None,
    };
    let store = state.store.clone();
    let cfg = state.cfg.clone();
    let hits =
        run_blocking(move || search::search(&store, &cfg, &query, query_emb.as_deref())).await??;
    Ok(Json(json!({ "count": hits.len(), "results": hits })))
}

#[derive(Deserialize)]
pub(super) struct StoreRequest {
    key: String,
    value: String,
}

/// POST /facts — direct store; key is normalized, the row is embedded
/// immediately when a provider is available.
pub(super) async fn store_fact(
    State(state): State<AppState>,
    LooseJson(req): LooseJson<StoreRequest>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let rules = state.cfg.key_rules();
    let key = rules.normalize(&req.key)?;

    let store = state.store.clone();
    let input = FactInput::new(&key, &req.value, now_ms()).source("mcp:store");
    let outcome = run_blocking(move || store.upsert(&input)).await??;

    // best-effort immediate embed; the pipeline's lazy pass is the backstop
    if let Some(ai_cfg) = state.ai.as_ref() {
        let text = format!("{key}: {}", req.value);
        if let Ok(result) = crate::ai::get_embeddings(ai_cfg, &[text]).await {
            if let Some(emb) = result.embeddings.into_iter().next() {
                let store = state.store.clone();
                let key2 = key.clone();
                let _ = run_blocking(move || {
                    if let Ok(Some(fact)) = store.active(&key2) {
                        let _ = store.set_embedding(fact.id, &emb);
                    }
                })
                .await;
            }
        }
    }

    Ok(Json(json!({ "key": key, "outcome": outcome })))
}

pub(super) async fn show_fact(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let fact = run_blocking(move || store.active(&key)).await??;
    match fact {
        Some(fact) => Ok(Json(serde_json::to_value(fact).map_err(|e| {
            MnemoError::Internal(e.to_string())
        })?)),
        None => Err(MnemoError::NotFound),
    }
}

pub(super) async fn fact_history(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let history = run_blocking(move || store.history(&key)).await??;
    Ok(Json(json!({ "count": history.len(), "history": history })))
}

pub(super) async fn delete_fact(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let key_clone = key.clone();
    let deleted = run_blocking(move || store.delete(&key_clone)).await??;
    if !deleted {
        return Err(MnemoError::NotFound);
    }
    Ok(Json(json!({ "deleted": key })))
}
