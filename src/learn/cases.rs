//! Error→recovery cases: an error tool result followed within a short
//! window by a successful one yields an `agent.case.<error_type>.<id>`.

use super::{assistant_explanation, stable_id, Case, Keyed, Solution, ToolEvent};
use crate::pipeline::normalize::NormalizedMessage;
use crate::util::truncate_chars;

/// How many messages after the error a recovery may appear in.
const RECOVERY_WINDOW: usize = 4;
const MAX_ACTIONS: usize = 3;

const CATEGORIES: &[(&str, &[&str])] = &[
    ("permission", &["permission denied", "eacces", "access denied", "operation not permitted", "unauthorized"]),
    ("not_found", &["no such file", "not found", "enoent", "does not exist", "404"]),
    ("syntax", &["syntax error", "syntaxerror", "parse error", "unexpected token", "expected expression"]),
    ("test_failure", &["test failed", "tests failed", "failed test", "assertion", "assert_eq", "... failed"]),
    ("network", &["timeout", "timed out", "connection refused", "econnrefused", "network", "dns", "unreachable"]),
    ("conflict", &["merge conflict", "conflict", "already exists", "locked"]),
    ("import", &["importerror", "modulenotfounderror", "cannot find module", "unresolved import", "no module named"]),
];

/// Keyword table lookup; anything unrecognized is `generic`.
pub fn categorize_error(output: &str) -> &'static str {
    let lower = output.to_lowercase();
    for (category, needles) in CATEGORIES {
        if needles.iter().any(|n| lower.contains(n)) {
            return category;
        }
    }
    "generic"
}

/// Keyword-salience heuristic: the line with the most error-marker hits is
/// the problem statement.
pub fn salient_problem(output: &str) -> String {
    let markers = [
        "error", "failed", "failure", "denied", "not found", "exception",
        "panic", "conflict", "timeout", "assert",
    ];
    let best = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .max_by_key(|line| {
            let lower = line.to_lowercase();
            markers.iter().filter(|m| lower.contains(*m)).count()
        })
        .unwrap_or("");
    truncate_chars(best, 160)
}

/// Extract cases from one transcript.
pub fn extract_cases(
    messages: &[NormalizedMessage],
    events: &[ToolEvent],
    session: &str,
) -> Vec<Keyed<Case>> {
    let mut out = Vec::new();

    for (i, error) in events.iter().enumerate() {
        if error.ok {
            continue;
        }
        // the failed operation succeeding again within the window
        let recovery = events[i + 1..].iter().find(|e| {
            e.ok && e.tool == error.tool
                && e.msg_index > error.msg_index
                && e.msg_index - error.msg_index <= RECOVERY_WINDOW
        });
        let Some(recovery) = recovery else { continue };

        // everything the assistant tried between error and recovery, inclusive
        let attempts: Vec<&ToolEvent> = events
            .iter()
            .filter(|e| e.msg_index > error.msg_index && e.msg_index <= recovery.msg_index)
            .collect();

        let mut tools: Vec<String> = Vec::new();
        for attempt in &attempts {
            if !tools.contains(&attempt.tool) {
                tools.push(attempt.tool.clone());
            }
        }
        let actions: Vec<String> = attempts
            .iter()
            .map(|e| truncate_chars(&e.action, 80))
            .filter(|a| !a.is_empty())
            .take(MAX_ACTIONS)
            .collect();
        let description =
            assistant_explanation(messages, error.msg_index, recovery.msg_index)
                .unwrap_or_default();

        let error_type = categorize_error(&error.output);
        let id = stable_id(&format!("{session}:{}", error.msg_index));
        out.push(Keyed {
            key: format!("agent.case.{error_type}.{id}"),
            record: Case {
                problem: salient_problem(&error.output),
                solution: Solution { tools, actions, description },
                outcome: "resolved".into(),
                session: session.to_string(),
                timestamp: error.timestamp_ms,
            },
        });
    }
    out
}
