//! Runtime configuration: a single JSON document loaded once at startup and
//! passed down explicitly. Secrets (API keys, endpoints) stay in the
//! environment — see `ai::AiConfig::from_env`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MnemoError;
use crate::keys::KeyRules;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub guards: GuardConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub instinct: InstinctConfig,
    /// Category set for the key grammar. Empty = built-in defaults.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Extra plural/alias → singular category mappings.
    #[serde(default)]
    pub category_aliases: HashMap<String, String>,
    /// Type tag → key prefixes, for the search `type` verdict filter.
    #[serde(default = "default_type_mappings")]
    pub type_mappings: HashMap<String, Vec<String>>,
    /// Host name → directory of session transcripts, used by hooks and
    /// `pipeline ingest-host`.
    #[serde(default)]
    pub session_dirs: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    #[serde(default = "d_min_count_for_l0")]
    pub min_count_for_l0: usize,
    #[serde(default = "d_max_categories_in_l0")]
    pub max_categories_in_l0: usize,
    /// Categories always included in the digest regardless of count.
    #[serde(default)]
    pub shown_categories: Vec<String>,
    /// Keys always included in the digest samples.
    #[serde(default)]
    pub pinned_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "d_max_candidates")]
    pub max_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "d_vector_threshold")]
    pub vector_threshold: f64,
    #[serde(default = "d_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "d_bm25_weight")]
    pub bm25_weight: f64,
    #[serde(default = "d_bm25_bonus")]
    pub bm25_bonus: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Overrides MNEMO_EMBED_MODEL when set.
    #[serde(default)]
    pub model: Option<String>,
    /// Expected vector dimension. None = accept whatever the provider
    /// returns first, then pin it in the store's meta table.
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "d_min_free_mb")]
    pub min_free_mb: u64,
    #[serde(default = "d_max_sessions_per_run")]
    pub max_sessions_per_run: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Stale TTL for background workers. Hook locks use `hook_stale_ttl_seconds`.
    #[serde(default = "d_worker_ttl")]
    pub stale_ttl_seconds: u64,
    #[serde(default = "d_hook_ttl")]
    pub hook_stale_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    #[serde(default = "d_noise_min_len")]
    pub min_len: usize,
    #[serde(default = "d_noise_max_len")]
    pub max_len: usize,
    /// Extra regex patterns treated as noise, on top of the built-ins.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstinctConfig {
    /// Instincts below this confidence are not stored.
    #[serde(default = "d_min_confidence")]
    pub min_confidence: f64,
    /// Instincts at or above this confidence are injected at session start.
    #[serde(default = "d_inject_confidence")]
    pub inject_confidence: f64,
}

fn d_min_count_for_l0() -> usize { 5 }
fn d_max_categories_in_l0() -> usize { 15 }
fn d_true() -> bool { true }
fn d_similarity_threshold() -> f64 { 0.85 }
fn d_max_candidates() -> usize { 5 }
fn d_vector_threshold() -> f64 { 0.3 }
fn d_vector_weight() -> f64 { 0.7 }
fn d_bm25_weight() -> f64 { 0.3 }
fn d_bm25_bonus() -> f64 { 0.15 }
fn d_batch_size() -> usize { 100 }
fn d_min_free_mb() -> u64 { 400 }
fn d_max_sessions_per_run() -> usize { 50 }
fn d_worker_ttl() -> u64 { 600 }
fn d_hook_ttl() -> u64 { 300 }
fn d_noise_min_len() -> usize { 10 }
fn d_noise_max_len() -> usize { 5000 }
fn d_min_confidence() -> f64 { 0.5 }
fn d_inject_confidence() -> f64 { 0.6 }

fn default_type_mappings() -> HashMap<String, Vec<String>> {
    let mut m = HashMap::new();
    let ins = |m: &mut HashMap<String, Vec<String>>, k: &str, v: &[&str]| {
        m.insert(k.to_string(), v.iter().map(|s| s.to_string()).collect());
    };
    ins(&mut m, "fact", &["user", "project", "system", "config", "location", "environment"]);
    ins(&mut m, "pref", &["preference"]);
    ins(&mut m, "entity", &["entity", "team", "tool", "model"]);
    ins(&mut m, "event", &["event", "task"]);
    ins(&mut m, "agent", &["agent", "workflow", "command"]);
    ins(&mut m, "inferred", &["inferred"]);
    ins(&mut m, "error", &["error", "correction"]);
    m
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("config defaults")
    }
}
impl Default for DigestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("digest defaults")
    }
}
impl Default for DedupConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("dedup defaults")
    }
}
impl Default for SearchConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("search defaults")
    }
}
impl Default for EmbeddingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("embedding defaults")
    }
}
impl Default for GuardConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("guard defaults")
    }
}
impl Default for LockConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("lock defaults")
    }
}
impl Default for NoiseConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("noise defaults")
    }
}
impl Default for InstinctConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("instinct defaults")
    }
}

impl Config {
    /// Load from a JSON file, or defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, MnemoError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MnemoError::Internal(format!("read config {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| MnemoError::Validation(format!("config parse: {e}")))
    }

    pub fn key_rules(&self) -> KeyRules {
        if self.categories.is_empty() {
            KeyRules::new(
                crate::keys::DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
                self.category_aliases.clone(),
            )
        } else {
            KeyRules::new(self.categories.clone(), self.category_aliases.clone())
        }
    }

    /// Key prefixes for a search `type` tag. `all` (or unknown tags) mean
    /// no restriction.
    pub fn prefixes_for_type(&self, tag: &str) -> Option<&[String]> {
        if tag == "all" {
            return None;
        }
        self.type_mappings.get(tag).map(|v| v.as_slice())
    }
}

/// On-disk layout, derived from one data directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join("mnemo.db")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join("processed_sources.ledger")
    }

    pub fn digest_file(&self) -> PathBuf {
        self.data_dir.join("digest.json")
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.data_dir.join("daily")
    }

    pub fn topics_dir(&self) -> PathBuf {
        self.data_dir.join("topics")
    }

    pub fn observations_file(&self) -> PathBuf {
        self.data_dir.join("observations.jsonl")
    }

    /// Locks live in the process-shared temp dir so concurrently-installed
    /// data dirs still serialize on the same machine-wide locks.
    pub fn lock_file(&self, name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mnemo-{name}.lock"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.daily_dir())?;
        std::fs::create_dir_all(self.topics_dir())?;
        Ok(())
    }
}
