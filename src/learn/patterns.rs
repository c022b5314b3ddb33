//! Tool-usage patterns: frequency counts, short sequences, and successful
//! streaks, stored under `agent.pattern.*`.

use std::collections::HashMap;

use super::{stable_id, Keyed, Pattern, ToolEvent};

const FREQUENT_MIN: usize = 5;
const SEQUENCE_MIN: usize = 3;
const STREAK_MIN: usize = 5;

/// Confidence grows with evidence but saturates well below certainty —
/// patterns are observations, not rules.
fn pattern_confidence(count: usize, min: usize) -> f64 {
    (0.4 + 0.05 * (count - min) as f64).min(0.8)
}

/// Extract patterns from one transcript's tool events.
pub fn extract_patterns(events: &[ToolEvent]) -> Vec<Keyed<Pattern>> {
    let mut out = Vec::new();

    // frequency
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for event in events {
        *counts.entry(event.tool.as_str()).or_default() += 1;
    }
    let mut frequent: Vec<(&str, usize)> =
        counts.into_iter().filter(|(_, n)| *n >= FREQUENT_MIN).collect();
    frequent.sort();
    for (tool, count) in frequent {
        out.push(Keyed {
            key: format!("agent.pattern.frequent_{}", tool.to_lowercase()),
            record: Pattern::Frequent {
                tool: tool.to_string(),
                count,
                confidence: pattern_confidence(count, FREQUENT_MIN),
            },
        });
    }

    // 2-step and 3-step sequences over consecutive events
    let names: Vec<&str> = events.iter().map(|e| e.tool.as_str()).collect();
    for window in [2usize, 3] {
        let mut seq_counts: HashMap<Vec<&str>, usize> = HashMap::new();
        for w in names.windows(window) {
            *seq_counts.entry(w.to_vec()).or_default() += 1;
        }
        let mut hits: Vec<(Vec<&str>, usize)> =
            seq_counts.into_iter().filter(|(_, n)| *n >= SEQUENCE_MIN).collect();
        hits.sort();
        for (seq, count) in hits {
            let joined = seq.join(">");
            out.push(Keyed {
                key: format!("agent.pattern.sequence_{}", stable_id(&joined)),
                record: Pattern::Sequence {
                    sequence: seq.iter().map(|s| s.to_string()).collect(),
                    count,
                    confidence: pattern_confidence(count, SEQUENCE_MIN),
                },
            });
        }
    }

    // contiguous successful streaks
    let mut streak: Vec<&ToolEvent> = Vec::new();
    let mut flush = |streak: &mut Vec<&ToolEvent>, out: &mut Vec<Keyed<Pattern>>| {
        if streak.len() >= STREAK_MIN {
            let tools: Vec<String> = streak.iter().map(|e| e.tool.clone()).collect();
            let joined = tools.join(">");
            out.push(Keyed {
                key: format!("agent.pattern.workflow_{}", stable_id(&joined)),
                record: Pattern::Workflow {
                    tools,
                    count: streak.len(),
                    confidence: pattern_confidence(streak.len(), STREAK_MIN),
                },
            });
        }
        streak.clear();
    };
    for event in events {
        if event.ok {
            streak.push(event);
        } else {
            flush(&mut streak, &mut out);
        }
    }
    flush(&mut streak, &mut out);

    out
}
