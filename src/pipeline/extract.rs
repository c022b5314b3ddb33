//! Fact extractor: chunked conversation text → validated `(key, value)`
//! pairs via the LLM provider. The provider returning garbage costs a chunk
//! (zero facts, one warning), never the run.

use tracing::{debug, warn};

use crate::ai::{self, AiConfig};
use crate::error::MnemoError;
use crate::keys::KeyRules;
use crate::pipeline::align::RawFact;
use crate::pipeline::noise::NoiseFilter;
use crate::pipeline::normalize::{NormalizedMessage, Role};
use crate::prompts;

/// Chunks never exceed this many characters; splits happen only on
/// paragraph boundaries, so a single oversized paragraph stays whole.
pub const CHUNK_CHAR_CAP: usize = 30_000;

/// Render kept messages as conversation text for the extractor.
pub fn conversation_text(messages: &[NormalizedMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            format!("{role}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split on paragraph boundaries so no chunk exceeds the cap.
pub fn chunk_text(text: &str, cap: usize) -> Vec<String> {
    if text.chars().count() <= cap {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;
    for para in text.split("\n\n") {
        let para_chars = para.chars().count();
        if current_chars > 0 && current_chars + para_chars + 2 > cap {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if current_chars > 0 {
            current.push_str("\n\n");
            current_chars += 2;
        }
        current.push_str(para);
        current_chars += para_chars;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Clip to `[first '[' ..= last ']']` — tolerates prose or fences around the
/// array, nothing else.
pub fn clip_json_array(raw: &str) -> &str {
    let trimmed = raw.trim();
    match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[derive(serde::Deserialize)]
struct RawKv {
    key: String,
    value: serde_json::Value,
}

/// Strict parse of the extractor contract. Non-array output or a null value
/// anywhere fails the whole chunk.
pub fn parse_extractor_response(raw: &str) -> Result<Vec<(String, String)>, MnemoError> {
    let clipped = clip_json_array(raw);
    let parsed: Vec<RawKv> = serde_json::from_str(clipped)
        .map_err(|e| MnemoError::Validation(format!("extractor output: {e}")))?;

    let mut out = Vec::with_capacity(parsed.len());
    for kv in parsed {
        if kv.key.trim().is_empty() {
            return Err(MnemoError::Validation("extractor fact with empty key".into()));
        }
        let value = match kv.value {
            serde_json::Value::Null => {
                return Err(MnemoError::Validation(format!(
                    "extractor fact '{}' with null value",
                    kv.key
                )));
            }
            serde_json::Value::String(s) => s,
            // structured values are stored as their JSON encoding
            other => other.to_string(),
        };
        out.push((kv.key, value));
    }
    Ok(out)
}

/// Provenance tag: `session:<first-segment-of-source-id>`.
pub fn source_tag(source_id: &str) -> String {
    let first = source_id
        .rsplit('/')
        .next()
        .unwrap_or(source_id)
        .split('.')
        .next()
        .unwrap_or(source_id);
    format!("session:{first}")
}

/// Extract facts from one conversation. Each chunk is one LLM call; parse
/// failures and per-fact validation failures drop the chunk or fact with a
/// warning. A transport failure aborts with `ExtractorUnavailable` so the
/// orchestrator can retry the source next run.
pub async fn extract_facts(
    cfg: &AiConfig,
    rules: &KeyRules,
    noise: &NoiseFilter,
    text: &str,
    source_id: &str,
    message_timestamp: i64,
) -> Result<Vec<RawFact>, MnemoError> {
    let system = prompts::extract_system_prompt(rules.categories());
    let source = source_tag(source_id);
    let chunks = chunk_text(text, CHUNK_CHAR_CAP);
    debug!(chunks = chunks.len(), source = %source, "extracting facts");

    let mut out = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let result = ai::llm_chat_as(cfg, "extract", &system, chunk).await?;
        let pairs = match parse_extractor_response(&result.content) {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(chunk = i, error = %e, "extractor chunk produced no facts");
                continue;
            }
        };
        for (raw_key, value) in pairs {
            let key = match rules.normalize(&raw_key) {
                Ok(k) => k,
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "dropping fact with invalid key");
                    continue;
                }
            };
            if noise.is_noise_fact(&value) {
                debug!(key = %key, "dropping noise fact");
                continue;
            }
            out.push(RawFact {
                key,
                value,
                source: source.clone(),
                message_timestamp,
            });
        }
    }
    debug!(count = out.len(), "extraction finished");
    Ok(out)
}
