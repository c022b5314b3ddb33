//! Learning layer: error→recovery cases, tool-usage patterns, and the
//! instincts aggregated from them. Everything here is stored as ordinary
//! facts under `agent.*` keys with JSON-encoded values, parsed once into
//! the typed records below — never ad-hoc property access.

mod cases;
mod instincts;
mod patterns;

pub use cases::extract_cases;
pub use instincts::{extract_instincts, injectable_instincts, store_instincts};
pub use patterns::extract_patterns;

use serde::{Deserialize, Serialize};

use crate::pipeline::normalize::{NormalizedMessage, Role};

// ---------------------------------------------------------------------------
// Typed records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub problem: String,
    pub solution: Solution,
    pub outcome: String,
    pub session: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub tools: Vec<String>,
    pub actions: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    Frequent { tool: String, count: usize, confidence: f64 },
    Sequence { sequence: Vec<String>, count: usize, confidence: f64 },
    Workflow { tools: Vec<String>, count: usize, confidence: f64 },
}

impl Pattern {
    pub fn count(&self) -> usize {
        match self {
            Pattern::Frequent { count, .. }
            | Pattern::Sequence { count, .. }
            | Pattern::Workflow { count, .. } => *count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instinct {
    pub trigger: String,
    pub action: String,
    pub confidence: f64,
    pub domain: String,
    pub evidence_count: usize,
}

/// A learned record with the key it is stored under.
#[derive(Debug, Clone)]
pub struct Keyed<T> {
    pub key: String,
    pub record: T,
}

// ---------------------------------------------------------------------------
// Tool events in transcripts
// ---------------------------------------------------------------------------

/// One tool invocation as it appears in a normalized transcript:
/// `Tool: first line of output…`.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub tool: String,
    /// First output line, used as the action descriptor.
    pub action: String,
    pub output: String,
    pub ok: bool,
    /// Index of the carrying message in the transcript.
    pub msg_index: usize,
    pub timestamp_ms: i64,
}

const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "failure",
    "exit code 1",
    "exit code 2",
    "exception",
    "traceback",
    "panicked",
    "denied",
    "not found",
    "refused",
    "conflict",
];

fn looks_like_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("exit code 0") {
        return false;
    }
    ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// A leading `ToolName:` tag — one capitalized identifier and a colon.
fn tool_tag(text: &str) -> Option<(&str, &str)> {
    let (head, rest) = text.split_once(':')?;
    let head = head.trim();
    let mut chars = head.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if head.len() > 32 || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((head, rest.trim_start()))
}

/// Scan a transcript for tool events. Only messages shaped like tool output
/// (`Bash: Exit code 1 …`) qualify; ordinary prose is left to the fact
/// extractor.
pub fn scan_tool_events(messages: &[NormalizedMessage]) -> Vec<ToolEvent> {
    let mut out = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        let Some((tool, rest)) = tool_tag(msg.text.trim()) else {
            continue;
        };
        let action = rest.lines().next().unwrap_or("").trim().to_string();
        out.push(ToolEvent {
            tool: tool.to_string(),
            action,
            output: rest.to_string(),
            ok: !looks_like_error(rest),
            msg_index: i,
            timestamp_ms: msg.timestamp_ms,
        });
    }
    out
}

/// First assistant prose (non-tool) message inside `[from, to]`, used as the
/// solution description.
pub(crate) fn assistant_explanation(
    messages: &[NormalizedMessage],
    from: usize,
    to: usize,
) -> Option<String> {
    messages
        .iter()
        .enumerate()
        .skip(from)
        .take(to.saturating_sub(from) + 1)
        .find(|(_, m)| m.role == Role::Assistant && tool_tag(m.text.trim()).is_none())
        .map(|(_, m)| crate::util::truncate_chars(m.text.trim(), 240))
}

/// Deterministic short id — FNV-1a over the input, hex-encoded. Stable ids
/// keep re-extraction idempotent: the same evidence lands on the same key.
pub(crate) fn stable_id(input: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in input.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x1_0000_01b3);
    }
    format!("{hash:08x}")
}
