//! Semantic dedup: before committing a candidate fact, find active facts
//! that embed close to it and let the LLM pick `skip`, `merge(target)`, or
//! `create`. Every failure path falls back to `create` — a well-formed fact
//! is never lost because dedup is unavailable.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::ai::{self, AiConfig};
use crate::config::DedupConfig;
use crate::pipeline::align::TimedFact;
use crate::prompts;
use crate::store::FactStore;
use crate::util::truncate_chars;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    Skip,
    Merge(String),
    Create,
}

/// Per-run outcome counters, logged once per source.
#[derive(Debug, Default, Clone, Copy)]
pub struct DedupStats {
    pub skipped: usize,
    pub merged: usize,
    pub created: usize,
    pub fallbacks: usize,
}

impl DedupStats {
    pub fn record(&mut self, decision: &DedupDecision) {
        match decision {
            DedupDecision::Skip => self.skipped += 1,
            DedupDecision::Merge(_) => self.merged += 1,
            DedupDecision::Create => self.created += 1,
        }
    }
}

#[derive(Deserialize)]
struct Decision {
    action: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Decide what to do with one candidate. `candidate_emb` is the embedding of
/// the candidate's index text, if the provider produced one.
pub async fn decide(
    store: &FactStore,
    ai: Option<&AiConfig>,
    cfg: &DedupConfig,
    fact: &TimedFact,
    candidate_emb: Option<&[f32]>,
    stats: &mut DedupStats,
) -> DedupDecision {
    if !cfg.enabled {
        let d = DedupDecision::Create;
        stats.record(&d);
        return d;
    }
    let Some(emb) = candidate_emb else {
        stats.fallbacks += 1;
        let d = DedupDecision::Create;
        stats.record(&d);
        return d;
    };

    let near = store.search_semantic(emb, cfg.similarity_threshold, cfg.max_candidates);
    let mut matches = Vec::with_capacity(near.len());
    for (id, sim) in &near {
        if let Ok(Some(existing)) = store.get(*id) {
            matches.push((existing, *sim));
        }
    }
    if matches.is_empty() {
        let d = DedupDecision::Create;
        stats.record(&d);
        return d;
    }

    let Some(ai_cfg) = ai else {
        stats.fallbacks += 1;
        let d = DedupDecision::Create;
        stats.record(&d);
        return d;
    };

    let listing = matches
        .iter()
        .map(|(f, sim)| {
            format!("- {} = {} (similarity {:.2})", f.key, truncate_chars(&f.value, 200), sim)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "CANDIDATE:\n{} = {}\n\nEXISTING:\n{}",
        fact.key,
        truncate_chars(&fact.value, 200),
        listing
    );

    let decision: Decision = match ai::llm_tool_call(
        ai_cfg,
        "dedup",
        prompts::DEDUP_SYSTEM,
        &user,
        "dedup_decision",
        "Decide whether the candidate fact duplicates an existing one",
        prompts::dedup_decision_schema(),
    )
    .await
    {
        Ok(tcr) => tcr.value,
        Err(e) => {
            warn!(key = %fact.key, error = %e, "dedup decision failed, creating");
            stats.fallbacks += 1;
            let d = DedupDecision::Create;
            stats.record(&d);
            return d;
        }
    };

    let d = match decision.action.as_str() {
        "skip" => DedupDecision::Skip,
        "merge" => {
            // the target must be one of the candidates we actually showed
            let target = decision
                .target
                .filter(|t| matches.iter().any(|(f, _)| f.key == *t));
            match target {
                Some(t) => DedupDecision::Merge(t),
                None => {
                    warn!(key = %fact.key, "merge without valid target, creating");
                    stats.fallbacks += 1;
                    DedupDecision::Create
                }
            }
        }
        "create" => DedupDecision::Create,
        other => {
            warn!(key = %fact.key, action = %other, "unknown dedup action, creating");
            stats.fallbacks += 1;
            DedupDecision::Create
        }
    };
    debug!(
        key = %fact.key,
        decision = ?d,
        reason = decision.reason.as_deref().unwrap_or(""),
        "dedup decision"
    );
    stats.record(&d);
    d
}
