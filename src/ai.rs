//! LLM and embedding providers. Chat and tool calls speak either the
//! OpenAI-compatible or the Anthropic-native wire format; embeddings are
//! always OpenAI-compatible. Everything is optional: with no provider
//! configured the rest of the system degrades instead of failing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::MnemoError;

fn ai_err(msg: impl Into<String>) -> MnemoError {
    MnemoError::ExtractorUnavailable(msg.into())
}

/// Per-call deadline when invoked inline from a hook. Background workers
/// rebuild the client with `with_timeout(WORKER_TIMEOUT)`.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(45);
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(120);

/// Which LLM API wire format to use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct AiConfig {
    pub provider: LlmProvider,
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub client: reqwest::Client,
    // Per-component model overrides (fall back to llm_model if None)
    pub extract_model: Option<String>,
    pub dedup_model: Option<String>,
}

impl AiConfig {
    pub fn model_for(&self, component: &str) -> &str {
        let m = match component {
            "extract" => self.extract_model.as_deref(),
            "dedup" => self.dedup_model.as_deref(),
            _ => None,
        };
        m.unwrap_or(&self.llm_model)
    }

    /// Returns `None` if `MNEMO_LLM_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let llm_url = std::env::var("MNEMO_LLM_URL").ok()?;
        let llm_key = std::env::var("MNEMO_LLM_KEY").unwrap_or_default();
        let llm_model =
            std::env::var("MNEMO_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

        // Determine provider from env, default to openai
        let provider = match std::env::var("MNEMO_LLM_PROVIDER")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "anthropic" | "claude" => LlmProvider::Anthropic,
            _ => LlmProvider::OpenAI,
        };

        let embed_url = std::env::var("MNEMO_EMBED_URL").unwrap_or_else(|_| {
            // Only rewrite if this looks like a chat completions endpoint
            if llm_url.contains("/chat/completions") {
                llm_url.replace("/chat/completions", "/embeddings")
            } else {
                format!("{}/embeddings", llm_url.trim_end_matches('/'))
            }
        });
        let embed_key = std::env::var("MNEMO_EMBED_KEY").unwrap_or_else(|_| llm_key.clone());
        let embed_model = std::env::var("MNEMO_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());

        let client = reqwest::Client::builder()
            .timeout(HOOK_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Some(Self {
            provider,
            llm_url,
            llm_key,
            llm_model,
            embed_url,
            embed_key,
            embed_model,
            client,
            extract_model: std::env::var("MNEMO_EXTRACT_MODEL").ok(),
            dedup_model: std::env::var("MNEMO_DEDUP_MODEL").ok(),
        })
    }

    /// Rebuild the HTTP client with a different per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        self
    }

    /// The config file's `embedding.model` takes precedence over env.
    pub fn with_embed_model(mut self, model: Option<&str>) -> Self {
        if let Some(m) = model {
            self.embed_model = m.to_string();
        }
        self
    }

    pub fn has_llm(&self) -> bool {
        !self.llm_url.is_empty()
    }

    pub fn has_embed(&self) -> bool {
        !self.embed_url.is_empty()
    }

    /// Attach whatever credentials the provider's wire format expects.
    fn authorize(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.llm_key.is_empty() {
            return rb;
        }
        match self.provider {
            LlmProvider::OpenAI => rb.bearer_auth(&self.llm_key),
            LlmProvider::Anthropic => rb
                .header("x-api-key", &self.llm_key)
                .header("anthropic-version", "2023-06-01"),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: FunctionDef,
}

#[derive(Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    arguments: String,
}

fn chat_request(model: &str, system: &str, user: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        temperature: 0.1,
        tools: None,
        tool_choice: None,
    }
}

// ---------------------------------------------------------------------------
// Anthropic wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl AnthropicUsage {
    fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        }
    }
}

fn anthropic_request(model: &str, system: &str, user: &str) -> AnthropicRequest {
    AnthropicRequest {
        model: model.to_string(),
        max_tokens: 4096,
        system: if system.is_empty() { None } else { Some(system.to_string()) },
        messages: vec![AnthropicMessage { role: "user".into(), content: user.into() }],
        temperature: 0.1,
        tools: None,
        tool_choice: None,
    }
}

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

pub struct LlmResult {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub duration_ms: u64,
}

pub struct ToolCallResult<T> {
    pub value: T,
    pub usage: Option<Usage>,
    pub model: String,
    pub duration_ms: u64,
}

pub struct EmbedResult {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One round trip to the LLM endpoint: authorize, POST the payload, check
/// the status, decode the reply. All four call paths funnel through here so
/// failures wear the same three faces: transport, status, decode.
async fn llm_round_trip<R: DeserializeOwned>(
    cfg: &AiConfig,
    what: &str,
    payload: &impl Serialize,
) -> Result<R, MnemoError> {
    let request = cfg.authorize(cfg.client.post(&cfg.llm_url).json(payload));
    let response = request
        .send()
        .await
        .map_err(|e| ai_err(format!("{what}: transport: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(ai_err(format!("{what}: endpoint answered {status}: {detail}")));
    }

    response
        .json()
        .await
        .map_err(|e| ai_err(format!("{what}: undecodable reply: {e}")))
}

fn ms_since(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ---------------------------------------------------------------------------
// LLM chat
// ---------------------------------------------------------------------------

/// Send a chat completion request, return the response text with usage.
/// Uses a component-specific model if configured.
pub async fn llm_chat_as(
    cfg: &AiConfig,
    component: &str,
    system: &str,
    user: &str,
) -> Result<LlmResult, MnemoError> {
    let model = cfg.model_for(component).to_string();
    let started = Instant::now();

    let (content, usage) = match cfg.provider {
        LlmProvider::OpenAI => {
            let payload = chat_request(&model, system, user);
            let chat: ChatResponse = llm_round_trip(cfg, "chat", &payload).await?;
            let content = chat
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            (content, chat.usage)
        }
        LlmProvider::Anthropic => {
            let payload = anthropic_request(&model, system, user);
            let reply: AnthropicResponse = llm_round_trip(cfg, "chat", &payload).await?;
            let content: String = reply
                .content
                .iter()
                .filter(|b| b.block_type == "text")
                .filter_map(|b| b.text.as_deref())
                .collect();
            (content, reply.usage.as_ref().map(|u| u.to_usage()))
        }
    };

    Ok(LlmResult { content, usage, model, duration_ms: ms_since(started) })
}

// ---------------------------------------------------------------------------
// LLM tool call
// ---------------------------------------------------------------------------

/// Force the model through a single function/tool so the answer arrives as
/// schema-shaped JSON instead of prose.
pub async fn llm_tool_call<T: DeserializeOwned>(
    cfg: &AiConfig,
    component: &str,
    system: &str,
    user: &str,
    fn_name: &str,
    fn_desc: &str,
    parameters: serde_json::Value,
) -> Result<ToolCallResult<T>, MnemoError> {
    let model = cfg.model_for(component).to_string();
    let started = Instant::now();

    let (arguments, usage) = match cfg.provider {
        LlmProvider::OpenAI => {
            let mut payload = chat_request(&model, system, user);
            payload.tools = Some(vec![ToolDef {
                tool_type: "function".into(),
                function: FunctionDef {
                    name: fn_name.into(),
                    description: fn_desc.into(),
                    parameters,
                },
            }]);
            payload.tool_choice =
                Some(serde_json::json!({"type": "function", "function": {"name": fn_name}}));

            let chat: ChatResponse = llm_round_trip(cfg, "tool call", &payload).await?;
            let call = chat
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.tool_calls)
                .and_then(|calls| calls.into_iter().next())
                .ok_or_else(|| ai_err("tool call: model answered without calling the tool"))?;
            (call.function.arguments, chat.usage)
        }
        LlmProvider::Anthropic => {
            let mut payload = anthropic_request(&model, system, user);
            payload.tools = Some(vec![AnthropicTool {
                name: fn_name.into(),
                description: fn_desc.into(),
                input_schema: parameters,
            }]);
            payload.tool_choice = Some(serde_json::json!({"type": "tool", "name": fn_name}));

            let reply: AnthropicResponse = llm_round_trip(cfg, "tool call", &payload).await?;
            let usage = reply.usage.as_ref().map(|u| u.to_usage());
            let input = reply
                .content
                .into_iter()
                .find(|b| b.block_type == "tool_use")
                .and_then(|b| b.input)
                .ok_or_else(|| ai_err("tool call: model answered without calling the tool"))?;
            (input.to_string(), usage)
        }
    };

    let value: T = serde_json::from_str(&arguments).map_err(|e| {
        ai_err(format!("tool call: arguments did not fit the schema: {e}: {arguments}"))
    })?;

    Ok(ToolCallResult { value, usage, model, duration_ms: ms_since(started) })
}

// ---------------------------------------------------------------------------
// Embeddings (always OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// Generate embeddings for one or more texts.
pub async fn get_embeddings(cfg: &AiConfig, texts: &[String]) -> Result<EmbedResult, MnemoError> {
    if texts.is_empty() {
        return Ok(EmbedResult { embeddings: vec![], usage: None });
    }
    debug!(model = %cfg.embed_model, count = texts.len(), "embedding batch");

    let payload = EmbedRequest {
        model: cfg.embed_model.clone(),
        input: texts.to_vec(),
    };

    let mut request = cfg.client.post(&cfg.embed_url).json(&payload);
    if !cfg.embed_key.is_empty() {
        request = request.bearer_auth(&cfg.embed_key);
    }

    let embed_err = |msg: String| MnemoError::EmbedBackend(msg);
    let response = request
        .send()
        .await
        .map_err(|e| embed_err(format!("embeddings: transport: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(embed_err(format!("embeddings: endpoint answered {status}: {detail}")));
    }
    let reply: EmbedResponse = response
        .json()
        .await
        .map_err(|e| embed_err(format!("embeddings: undecodable reply: {e}")))?;

    let embeddings: Vec<Vec<f32>> = reply.data.into_iter().map(|d| d.embedding).collect();
    if embeddings.len() != texts.len() {
        return Err(embed_err(format!(
            "embeddings: asked for {} vectors, got {}",
            texts.len(),
            embeddings.len()
        )));
    }
    Ok(EmbedResult { embeddings, usage: reply.usage })
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

/// Cosine similarity between two vectors. Accumulates in f64 so long
/// vectors of small f32 components don't lose the tail.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let scale = (norm_a * norm_b).sqrt();
    if scale > 0.0 {
        dot / scale
    } else {
        0.0
    }
}

/// f32 vector → little-endian bytes, for the SQLite BLOB column.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Little-endian bytes → f32 vector. A trailing partial chunk (corrupt
/// blob) is silently dropped rather than panicking a read path.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![1.0_f32, 0.0];
        let c = vec![0.0_f32, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
        // zero vector has no direction
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn embedding_roundtrip_bytes() {
        let v = vec![0.25_f32, -1.5, 3.75];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_embedding(&bytes), v);
    }

    #[test]
    fn truncated_blob_drops_partial_chunk() {
        let mut bytes = embedding_to_bytes(&[1.0_f32, 2.0]);
        bytes.pop();
        assert_eq!(bytes_to_embedding(&bytes), vec![1.0_f32]);
    }
}
