//! Health and stats.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::error::MnemoError;
use crate::AppState;

use super::run_blocking;

pub(super) async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub(super) async fn stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, MnemoError> {
    let store = state.store.clone();
    let (total, categories, integrity, db_bytes, embedding_dim) =
        run_blocking(move || -> Result<_, MnemoError> {
            Ok((
                store.count_active()?,
                store.category_counts()?,
                store.verify_integrity()?,
                store.db_size_bytes(),
                store.embedding_dim(),
            ))
        })
        .await??;

    let (cache_len, cache_cap, cache_hits, cache_misses) = state.embed_cache.stats();
    Ok(Json(json!({
        "active_facts": total,
        "categories": categories.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        "integrity": integrity,
        "db_size_bytes": db_bytes,
        "embedding_dim": embedding_dim,
        "embed_cache": {
            "len": cache_len,
            "cap": cache_cap,
            "hits": cache_hits,
            "misses": cache_misses,
        },
        "ai_configured": state.ai.is_some(),
    })))
}
