//! Hook entry points. Hooks run inside a host agent's critical path, so
//! they are bounded, silent, and never fatal: any problem is one structured
//! log line and a clean exit. Heavy work happens in a detached worker that
//! adopts the lock written here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{Config, Paths};
use crate::error::MnemoError;
use crate::guard::{self, Lock};

/// Trigger extraction at 65% of a 128k context window.
pub const TOKEN_THRESHOLD: u64 = 128_000 * 65 / 100;

/// Observation log rolls when it reaches this size.
pub const OBSERVATION_ROLL_BYTES: u64 = 10 * 1024 * 1024;

/// What a hook invocation decided to do.
#[derive(Debug, PartialEq, Eq)]
pub enum HookAction {
    Spawned { pid: u32 },
    Skipped(&'static str),
}

// -- token monitor (after-model) --------------------------------------------

#[derive(Deserialize)]
struct TokenEvent {
    llm_response: Option<LlmResponse>,
}

#[derive(Deserialize)]
struct LlmResponse {
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
}

pub fn parse_prompt_tokens(raw: &str) -> Option<u64> {
    let event: TokenEvent = serde_json::from_str(raw).ok()?;
    event.llm_response?.usage_metadata?.prompt_token_count
}

/// Token-threshold hook: when the host's context is filling up, kick off a
/// background ingest of its sessions.
pub fn token_monitor(
    cfg: &Config,
    paths: &Paths,
    stdin_json: &str,
    host: &str,
) -> HookAction {
    let Some(tokens) = parse_prompt_tokens(stdin_json) else {
        return HookAction::Skipped("no token count in event");
    };
    if tokens < TOKEN_THRESHOLD {
        return HookAction::Skipped("below threshold");
    }
    info!(tokens, threshold = TOKEN_THRESHOLD, "token threshold crossed");
    spawn_worker(
        cfg,
        paths,
        "token-monitor",
        &[
            "pipeline".into(),
            "ingest-host".into(),
            host.into(),
            "--adopt-lock".into(),
        ],
    )
}

// -- session end / pre-compress ---------------------------------------------

#[derive(Deserialize)]
struct SessionEvent {
    session_path: Option<PathBuf>,
}

pub fn parse_session_path(raw: &str) -> Option<PathBuf> {
    serde_json::from_str::<SessionEvent>(raw).ok()?.session_path
}

/// Session-end hook: process the finished session (explicit path from the
/// event, or the host's most recently modified session file).
pub fn session_end(
    cfg: &Config,
    paths: &Paths,
    stdin_json: Option<&str>,
    host: &str,
    latest: Option<PathBuf>,
) -> HookAction {
    let session = stdin_json.and_then(parse_session_path).or(latest);
    let Some(session) = session else {
        return HookAction::Skipped("no session found");
    };
    spawn_worker(
        cfg,
        paths,
        "session-end",
        &[
            "pipeline".into(),
            "run".into(),
            session.display().to_string(),
            "--adopt-lock".into(),
        ],
    )
}

fn spawn_worker(cfg: &Config, paths: &Paths, owner: &str, args: &[String]) -> HookAction {
    if let Err(e) = guard::check_ram(cfg.guards.min_free_mb) {
        info!(error = %e, "skipping extraction");
        return HookAction::Skipped("low memory");
    }
    let lock = Lock::new(
        paths.lock_file("worker"),
        Duration::from_secs(cfg.lock.hook_stale_ttl_seconds),
    );
    if let Err(e) = lock.takeable() {
        // fresh record held by a live process ⇒ extraction in progress
        info!(error = %e, "extraction in progress");
        return HookAction::Skipped("extraction in progress");
    }
    let pid = match guard::spawn_detached_worker(args) {
        Ok(pid) => pid,
        Err(e) => {
            warn!(error = %e, "worker spawn failed");
            return HookAction::Skipped("spawn failed");
        }
    };
    if let Err(e) = lock.acquire_for_pid(owner, pid) {
        // lost the race to another hook; our worker will fail to adopt and
        // exit silently
        info!(error = %e, "lock already taken");
        return HookAction::Skipped("extraction in progress");
    }
    HookAction::Spawned { pid }
}

// -- observe tool-use --------------------------------------------------------

#[derive(Deserialize)]
struct ObserveEvent {
    tool_name: String,
    #[serde(default)]
    tool_input: serde_json::Value,
    #[serde(default)]
    tool_output: serde_json::Value,
    #[serde(default)]
    session_id: Option<String>,
}

/// Append a tool-use observation to the JSONL log, rolling it at 10 MiB.
pub fn observe(paths: &Paths, stdin_json: &str) -> Result<(), MnemoError> {
    let event: ObserveEvent = serde_json::from_str(stdin_json)
        .map_err(|e| MnemoError::Validation(format!("observe event: {e}")))?;

    let path = paths.observations_file();
    roll_if_needed(&path)?;

    let line = serde_json::json!({
        "ts": crate::store::now_ms(),
        "tool_name": event.tool_name,
        "tool_input": event.tool_input,
        "tool_output": event.tool_output,
        "session_id": event.session_id,
    });
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| MnemoError::Internal(format!("open observations: {e}")))?;
    writeln!(file, "{line}")
        .map_err(|e| MnemoError::Internal(format!("append observation: {e}")))?;
    Ok(())
}

fn roll_if_needed(path: &Path) -> Result<(), MnemoError> {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size >= OBSERVATION_ROLL_BYTES {
        let rolled = path.with_extension("jsonl.1");
        std::fs::rename(path, &rolled)
            .map_err(|e| MnemoError::Internal(format!("roll observations: {e}")))?;
        info!(rolled = %rolled.display(), "rolled observation log");
    }
    Ok(())
}
