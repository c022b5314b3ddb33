//! Session normalizer: decode host transcripts into an ordered sequence of
//! `(role, text, timestamp)` messages. Non-text parts are dropped.

use std::path::Path;

use chrono::DateTime;
use serde::Deserialize;

use crate::error::MnemoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: Role,
    pub text: String,
    pub timestamp_ms: i64,
}

/// Which host wrote the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// Normalized JSONL (one `{"type":"message",...}` object per line).
    Claude,
    /// Session JSON documents that need conversion first.
    Gemini,
}

impl Adapter {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// Ledger prefix, so source ids from different hosts can't collide.
    pub fn ledger_prefix(&self) -> &'static str {
        match self {
            Self::Claude => "",
            Self::Gemini => "gemini:",
        }
    }
}

// -- normalized JSONL (the wire schema adapters must produce) ---------------

#[derive(Deserialize)]
struct JsonlLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<JsonlMessage>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct JsonlMessage {
    role: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Content is either a plain string or an array of typed parts; only `text`
/// parts survive normalization.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| {
                let kind = p.get("type").and_then(|t| t.as_str())?;
                if kind == "text" {
                    p.get("text").and_then(|t| t.as_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_iso_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Decode a normalized JSONL transcript. Blank lines are tolerated; a line
/// that isn't JSON at all fails the whole transcript (`MalformedTranscript`),
/// while well-formed lines of other types are just skipped.
pub fn normalize_jsonl(raw: &str) -> Result<Vec<NormalizedMessage>, MnemoError> {
    let mut out = Vec::new();
    for (no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: JsonlLine = serde_json::from_str(line).map_err(|e| {
            MnemoError::MalformedTranscript(format!("line {}: {e}", no + 1))
        })?;
        if parsed.kind != "message" {
            continue;
        }
        let Some(message) = parsed.message else { continue };
        let role = match message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => continue,
        };
        let text = content_text(&message.content);
        if text.trim().is_empty() {
            continue;
        }
        let timestamp_ms = parsed
            .timestamp
            .as_deref()
            .and_then(parse_iso_ms)
            .unwrap_or(0);
        out.push(NormalizedMessage { role, text, timestamp_ms });
    }

    // Messages without a timestamp inherit the transcript's earliest one.
    let earliest = out
        .iter()
        .map(|m| m.timestamp_ms)
        .filter(|t| *t > 0)
        .min()
        .unwrap_or(0);
    for m in &mut out {
        if m.timestamp_ms == 0 {
            m.timestamp_ms = earliest;
        }
    }
    Ok(out)
}

// -- gemini session documents -----------------------------------------------

#[derive(Deserialize)]
struct GeminiSession {
    #[serde(default, alias = "history")]
    messages: Vec<GeminiTurn>,
    #[serde(default, alias = "startTime")]
    start_time: Option<String>,
}

#[derive(Deserialize)]
struct GeminiTurn {
    role: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    parts: Vec<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Decode a gemini session document into normalized messages.
pub fn normalize_gemini(raw: &str, fallback_ts_ms: i64) -> Result<Vec<NormalizedMessage>, MnemoError> {
    let session: GeminiSession = serde_json::from_str(raw)
        .map_err(|e| MnemoError::MalformedTranscript(format!("gemini session: {e}")))?;

    let session_ts = session
        .start_time
        .as_deref()
        .and_then(parse_iso_ms)
        .unwrap_or(fallback_ts_ms);

    let mut out = Vec::new();
    for turn in &session.messages {
        let role = match turn.role.as_str() {
            "user" => Role::User,
            "model" | "assistant" => Role::Assistant,
            _ => continue,
        };
        let text = match &turn.text {
            Some(t) => t.clone(),
            None => turn
                .parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if text.trim().is_empty() {
            continue;
        }
        let timestamp_ms = turn
            .timestamp
            .as_deref()
            .and_then(parse_iso_ms)
            .unwrap_or(session_ts);
        out.push(NormalizedMessage { role, text, timestamp_ms });
    }
    Ok(out)
}

/// Re-encode normalized messages as the JSONL wire schema (used by the
/// gemini converter before the common pipeline path takes over).
pub fn to_jsonl(messages: &[NormalizedMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let ts = chrono::DateTime::from_timestamp_millis(m.timestamp_ms)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let line = serde_json::json!({
            "type": "message",
            "message": {"role": role, "content": m.text},
            "timestamp": ts,
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

/// Read and normalize a transcript file.
pub fn normalize_file(path: &Path, adapter: Adapter) -> Result<Vec<NormalizedMessage>, MnemoError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MnemoError::MalformedTranscript(format!("{}: {e}", path.display())))?;
    match adapter {
        Adapter::Claude => normalize_jsonl(&raw),
        Adapter::Gemini => {
            let mtime_ms = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            normalize_gemini(&raw, mtime_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_roundtrip() {
        let raw = concat!(
            r#"{"type":"message","message":{"role":"user","content":"我住台北"},"timestamp":"2026-01-01T10:00:00Z"}"#,
            "\n",
            r#"{"type":"message","message":{"role":"assistant","content":"Noted."},"timestamp":"2026-01-01T10:00:05Z"}"#,
            "\n",
        );
        let msgs = normalize_jsonl(raw).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[0].text, "我住台北");
        assert_eq!(msgs[0].timestamp_ms, 1_767_261_600_000);
    }

    #[test]
    fn drops_non_text_parts() {
        let raw = r#"{"type":"message","message":{"role":"user","content":[{"type":"image","data":"..."},{"type":"text","text":"look at this"}]},"timestamp":"2026-01-01T10:00:00Z"}"#;
        let msgs = normalize_jsonl(raw).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "look at this");
    }

    #[test]
    fn drops_empty_and_foreign_lines() {
        let raw = concat!(
            r#"{"type":"summary","summary":"..."}"#,
            "\n\n",
            r#"{"type":"message","message":{"role":"user","content":""},"timestamp":"2026-01-01T10:00:00Z"}"#,
            "\n",
        );
        assert!(normalize_jsonl(raw).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_fails_transcript() {
        let err = normalize_jsonl("not json at all\n").unwrap_err();
        assert!(matches!(err, MnemoError::MalformedTranscript(_)));
    }

    #[test]
    fn missing_timestamps_inherit_earliest() {
        let raw = concat!(
            r#"{"type":"message","message":{"role":"user","content":"first"}}"#,
            "\n",
            r#"{"type":"message","message":{"role":"user","content":"second"},"timestamp":"2026-01-02T00:00:00Z"}"#,
            "\n",
        );
        let msgs = normalize_jsonl(raw).unwrap();
        assert_eq!(msgs[0].timestamp_ms, msgs[1].timestamp_ms);
    }

    #[test]
    fn gemini_session_converts() {
        let raw = r#"{
            "startTime": "2026-01-01T09:00:00Z",
            "messages": [
                {"role": "user", "text": "remember I use fish shell"},
                {"role": "model", "parts": [{"text": "Got it."}]}
            ]
        }"#;
        let msgs = normalize_gemini(raw, 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[0].timestamp_ms, 1_767_258_000_000);

        let jsonl = to_jsonl(&msgs);
        let back = normalize_jsonl(&jsonl).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].text, "remember I use fish shell");
    }
}
