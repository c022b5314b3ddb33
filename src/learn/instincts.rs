//! Instincts: high-confidence behavioral rules aggregated from stored cases
//! and patterns. Stored via `upsert`, so re-extraction supersedes instead of
//! duplicating.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{Case, Instinct, Keyed, Pattern};
use crate::error::MnemoError;
use crate::store::{now_ms, FactInput, FactStore};

/// Evidence → confidence: a step function of group size.
fn step_confidence(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 0.5,
        3 | 4 => 0.6,
        5 | 6 => 0.7,
        7..=9 => 0.8,
        _ => 0.9,
    }
}

const PREFER_TOOL_MIN: usize = 10;
const PREFER_TOOL_CONFIDENCE: f64 = 0.7;
const WORKFLOW_CONFIDENCE: f64 = 0.6;

fn parse_cases(store: &FactStore) -> Result<Vec<(String, Case)>, MnemoError> {
    let mut out = Vec::new();
    for fact in store.active_prefix("agent.case.")? {
        match serde_json::from_str::<Case>(&fact.value) {
            Ok(case) => out.push((fact.key, case)),
            Err(e) => warn!(key = %fact.key, error = %e, "unparseable case, skipping"),
        }
    }
    Ok(out)
}

fn parse_patterns(store: &FactStore) -> Result<Vec<(String, Pattern)>, MnemoError> {
    let mut out = Vec::new();
    for fact in store.active_prefix("agent.pattern.")? {
        match serde_json::from_str::<Pattern>(&fact.value) {
            Ok(pattern) => out.push((fact.key, pattern)),
            Err(e) => warn!(key = %fact.key, error = %e, "unparseable pattern, skipping"),
        }
    }
    Ok(out)
}

/// `agent.case.<error_type>.<id>` → `<error_type>`.
fn case_error_type(key: &str) -> Option<&str> {
    key.strip_prefix("agent.case.")?.split('.').next()
}

/// Derive instincts from the active cases and patterns. Deduplicated by key
/// and filtered by `min_confidence`; nothing is written.
pub fn extract_instincts(
    store: &FactStore,
    min_confidence: f64,
) -> Result<Vec<Keyed<Instinct>>, MnemoError> {
    let mut out: Vec<Keyed<Instinct>> = Vec::new();

    // error instincts from case groups
    let cases = parse_cases(store)?;
    let mut groups: HashMap<&str, Vec<&Case>> = HashMap::new();
    for (key, case) in &cases {
        if let Some(error_type) = case_error_type(key) {
            groups.entry(error_type).or_default().push(case);
        }
    }
    let mut group_list: Vec<(&str, Vec<&Case>)> = groups.into_iter().collect();
    group_list.sort_by_key(|(t, _)| *t);
    for (error_type, group) in group_list {
        let n = group.len();
        if n < 2 {
            continue;
        }
        // tools used in at least half of the cases
        let mut tool_counts: HashMap<&str, usize> = HashMap::new();
        for case in &group {
            for tool in &case.solution.tools {
                *tool_counts.entry(tool.as_str()).or_default() += 1;
            }
        }
        let majority = n.div_ceil(2);
        let mut common: Vec<&str> = tool_counts
            .iter()
            .filter(|(_, c)| **c >= majority)
            .map(|(t, _)| *t)
            .collect();
        common.sort();

        let latest = group
            .iter()
            .max_by_key(|c| c.timestamp)
            .map(|c| c.solution.description.clone())
            .unwrap_or_default();
        let action = if common.is_empty() {
            latest.clone()
        } else {
            format!("use {}; {}", common.join(", "), latest)
        };

        out.push(Keyed {
            key: format!("agent.instinct.error.{error_type}"),
            record: Instinct {
                trigger: format!("{error_type} error encountered"),
                action,
                confidence: step_confidence(n),
                domain: "error".into(),
                evidence_count: n,
            },
        });
    }

    // tool preference + workflow instincts from patterns
    let patterns = parse_patterns(store)?;
    let mut workflow_patterns: Vec<(&String, &Pattern)> = Vec::new();
    for (key, pattern) in &patterns {
        match pattern {
            Pattern::Frequent { tool, count, .. } if *count >= PREFER_TOOL_MIN => {
                out.push(Keyed {
                    key: format!("agent.instinct.tool.prefer_{}", tool.to_lowercase()),
                    record: Instinct {
                        trigger: "choosing a tool for routine work".into(),
                        action: format!("prefer {tool}"),
                        confidence: PREFER_TOOL_CONFIDENCE,
                        domain: "tool".into(),
                        evidence_count: *count,
                    },
                });
            }
            Pattern::Workflow { .. } => workflow_patterns.push((key, pattern)),
            Pattern::Sequence { sequence, count, .. } if *count >= 2 => {
                let id = key.rsplit('_').next().unwrap_or("seq");
                out.push(Keyed {
                    key: format!("agent.instinct.workflow.seq_{id}"),
                    record: Instinct {
                        trigger: format!("after {}", sequence.join(" then ")),
                        action: format!("continue the {} sequence", sequence.join(">")),
                        confidence: WORKFLOW_CONFIDENCE,
                        domain: "workflow".into(),
                        evidence_count: *count,
                    },
                });
            }
            _ => {}
        }
    }
    if workflow_patterns.len() >= 2 {
        let evidence: usize = workflow_patterns.iter().map(|(_, p)| p.count()).sum();
        let tools: Vec<String> = workflow_patterns
            .iter()
            .filter_map(|(_, p)| match p {
                Pattern::Workflow { tools, .. } => Some(tools.join(">")),
                _ => None,
            })
            .collect();
        out.push(Keyed {
            key: "agent.instinct.workflow.common_sequence".into(),
            record: Instinct {
                trigger: "starting a multi-step task".into(),
                action: format!("known good runs: {}", tools.join("; ")),
                confidence: WORKFLOW_CONFIDENCE,
                domain: "workflow".into(),
                evidence_count: evidence,
            },
        });
    }

    // dedup by key (first wins), then the confidence floor
    let mut seen = std::collections::HashSet::new();
    out.retain(|i| seen.insert(i.key.clone()) && i.record.confidence >= min_confidence);
    debug!(count = out.len(), "instincts derived");
    Ok(out)
}

/// Store derived instincts. Returns how many rows actually changed.
pub fn store_instincts(
    store: &FactStore,
    instincts: &[Keyed<Instinct>],
) -> Result<usize, MnemoError> {
    let mut changed = 0;
    for instinct in instincts {
        let value = serde_json::to_string(&instinct.record)
            .map_err(|e| MnemoError::Internal(format!("instinct json: {e}")))?;
        let input = FactInput::new(&instinct.key, value, now_ms())
            .source("auto:instinct-extraction");
        match store.upsert(&input)? {
            crate::store::UpsertOutcome::Skipped => {}
            _ => changed += 1,
        }
    }
    Ok(changed)
}

/// Instincts worth injecting at session start: active, parseable, and at or
/// above the confidence floor.
pub fn injectable_instincts(
    store: &FactStore,
    min_confidence: f64,
) -> Result<Vec<Keyed<Instinct>>, MnemoError> {
    let mut out = Vec::new();
    for fact in store.active_prefix("agent.instinct.")? {
        match serde_json::from_str::<Instinct>(&fact.value) {
            Ok(record) if record.confidence >= min_confidence => {
                out.push(Keyed { key: fact.key, record });
            }
            Ok(_) => {}
            Err(e) => warn!(key = %fact.key, error = %e, "unparseable instinct"),
        }
    }
    out.sort_by(|a, b| {
        b.record
            .confidence
            .partial_cmp(&a.record.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(out)
}
