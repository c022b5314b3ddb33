//! mnemo — persistent memory consolidation engine for AI agents.
//! Transcripts in, temporally-versioned facts out; hybrid retrieval and
//! learned instincts back into future sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mnemo::aggregate::Aggregator;
use mnemo::ai::AiConfig;
use mnemo::config::{Config, Paths};
use mnemo::error::MnemoError;
use mnemo::guard::Lock;
use mnemo::pipeline::normalize::Adapter;
use mnemo::pipeline::Pipeline;
use mnemo::search::{SearchQuery, VerdictFilters};
use mnemo::store::{now_ms, FactInput, FactStore};
use mnemo::{hooks, learn, query_embedding, search, AppState, EmbedCache, SharedStore};

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Persistent memory consolidation engine for AI agents")]
struct Args {
    /// Data directory (database, ledger, derived files)
    #[arg(long, default_value = ".mnemo", env = "MNEMO_DATA_DIR", global = true)]
    data_dir: PathBuf,

    /// Config file (defaults to <data-dir>/config.json)
    #[arg(long, env = "MNEMO_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP query/mutation API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3917", env = "MNEMO_PORT")]
        port: u16,
    },
    /// Consolidation pipeline
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCmd,
    },
    /// Query and store memory
    Memory {
        #[command(subcommand)]
        cmd: MemoryCmd,
    },
    /// Learned instincts
    Instinct {
        #[command(subcommand)]
        cmd: InstinctCmd,
    },
    /// Host-agent hook entry points (bounded, silent, exit 0)
    Hook {
        #[command(subcommand)]
        cmd: HookCmd,
    },
}

#[derive(Subcommand)]
enum PipelineCmd {
    /// Process one transcript file
    Run {
        source: PathBuf,
        /// Transcript adapter: claude | gemini
        #[arg(long, default_value = "claude")]
        adapter: String,
        /// Adopt the lock a hook wrote for this worker
        #[arg(long, hide = true)]
        adopt_lock: bool,
    },
    /// Process every .jsonl file in a directory, sorted
    Backfill { dir: PathBuf },
    /// Ingest a configured host's session directory
    IngestHost {
        host: String,
        #[arg(long, hide = true)]
        adopt_lock: bool,
    },
}

#[derive(Subcommand)]
enum MemoryCmd {
    /// One-line snapshot of the active set
    Summary,
    /// Search facts
    Search {
        /// Key prefix listing
        #[arg(long)]
        prefix: Option<String>,
        /// Exact keys, comma-separated
        #[arg(long, value_delimiter = ',')]
        keys: Option<Vec<String>>,
        /// Keyword (BM25) query
        #[arg(long)]
        query: Option<String>,
        /// Semantic (hybrid) query
        #[arg(long)]
        semantic: Option<String>,
        /// Single exact key
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value = "10")]
        limit: usize,
        /// text | json | hook
        #[arg(long, default_value = "text")]
        format: String,
        /// Exclude inferred.* keys
        #[arg(long)]
        source_verified: bool,
        /// Require key to contain this substring
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        max_age_days: Option<i64>,
        /// Type tag from config type_mappings
        #[arg(long = "type")]
        type_tag: Option<String>,
    },
    /// Store one fact directly
    Store { key: String, value: String },
}

#[derive(Subcommand)]
enum InstinctCmd {
    List {
        #[arg(long)]
        domain: Option<String>,
        /// Only instincts above the session-start injection floor,
        /// formatted for context injection
        #[arg(long)]
        injectable: bool,
    },
    Show { key: String },
    /// Derive instincts from stored cases and patterns
    Extract {
        /// Persist them (default: dry run)
        #[arg(long)]
        store: bool,
        #[arg(long)]
        min_confidence: Option<f64>,
    },
    Delete { key: String },
    Stats,
}

#[derive(Subcommand)]
enum HookCmd {
    /// Session finished or is about to be compressed
    SessionEnd {
        #[arg(long, default_value = "claude")]
        host: String,
    },
    /// After-model token threshold monitor
    TokenMonitor {
        #[arg(long, default_value = "claude")]
        host: String,
    },
    /// Record one tool-use observation
    Observe,
}

fn read_stdin() -> Option<String> {
    use std::io::Read;
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).ok()?;
    if buf.trim().is_empty() {
        None
    } else {
        Some(buf)
    }
}

fn open_store(cfg: &Config, paths: &Paths) -> Result<SharedStore, MnemoError> {
    paths
        .ensure_dirs()
        .map_err(|e| MnemoError::Internal(format!("data dir: {e}")))?;
    let db_path = paths.db_file();
    let store = FactStore::open(&db_path.display().to_string())?;

    // the provider's dimension is pinned once; a configured value must agree
    if let Some(configured) = cfg.embedding.dimension {
        match store.embedding_dim() {
            Some(stored) if stored != configured => {
                return Err(MnemoError::DimensionMismatch {
                    expected: stored,
                    got: configured,
                });
            }
            Some(_) => {}
            None => store.set_meta("embedding_dim", &configured.to_string())?,
        }
    }
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join("config.json"));
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "config error");
            std::process::exit(1);
        }
    };
    let paths = Paths::new(&args.data_dir);

    let code = match run(args.command, cfg, paths).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "command failed");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, cfg: Config, paths: Paths) -> Result<(), MnemoError> {
    match command {
        Command::Serve { port } => serve(port, cfg, paths).await,
        Command::Pipeline { cmd } => pipeline_cmd(cmd, cfg, paths).await,
        Command::Memory { cmd } => memory_cmd(cmd, cfg, paths).await,
        Command::Instinct { cmd } => instinct_cmd(cmd, cfg, paths).await,
        Command::Hook { cmd } => {
            hook_cmd(cmd, cfg, paths).await;
            // hooks never fail the host
            Ok(())
        }
    }
}

fn ai_for_worker(cfg: &Config) -> Option<AiConfig> {
    AiConfig::from_env()
        .map(|a| a.with_timeout(mnemo::ai::WORKER_TIMEOUT))
        .map(|a| a.with_embed_model(cfg.embedding.model.as_deref()))
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(port: u16, cfg: Config, paths: Paths) -> Result<(), MnemoError> {
    let store = open_store(&cfg, &paths)?;

    let ai_cfg = AiConfig::from_env().map(|a| a.with_embed_model(cfg.embedding.model.as_deref()));
    let ai_status = match &ai_cfg {
        Some(a) => format!("llm={} embed={}", a.llm_model, a.embed_model),
        None => "disabled".into(),
    };
    let api_key = std::env::var("MNEMO_API_KEY").ok();
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let state = AppState {
        store: store.clone(),
        cfg: Arc::new(cfg),
        paths: Arc::new(paths),
        ai: ai_cfg,
        api_key,
        embed_cache: EmbedCache::with_store(128, &store),
        started_at: std::time::Instant::now(),
    };
    let app = mnemo::api::router(state);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port,
        ai = %ai_status,
        auth = auth_status,
        "mnemo starting"
    );

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MnemoError::Internal(format!("bind {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| MnemoError::Internal(format!("server: {e}")))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}

// ---------------------------------------------------------------------------
// pipeline
// ---------------------------------------------------------------------------

/// Hold the singleton worker lock for the duration of a pipeline run.
/// `adopt` is set when a hook already wrote the lock with our pid.
fn pipeline_lock(cfg: &Config, paths: &Paths, adopt: bool) -> Result<mnemo::guard::LockGuard, MnemoError> {
    let lock = Lock::new(
        paths.lock_file("worker"),
        Duration::from_secs(cfg.lock.stale_ttl_seconds),
    );
    if adopt {
        lock.adopt("worker")
    } else {
        lock.acquire("pipeline")
    }
}

async fn pipeline_cmd(cmd: PipelineCmd, cfg: Config, paths: Paths) -> Result<(), MnemoError> {
    let store = open_store(&cfg, &paths)?;
    let ai = ai_for_worker(&cfg);
    let pipeline = Pipeline::new(store, cfg.clone(), paths.clone(), ai);

    match cmd {
        PipelineCmd::Run { source, adapter, adopt_lock } => {
            let adapter = Adapter::from_name(&adapter)
                .ok_or_else(|| MnemoError::Validation(format!("unknown adapter '{adapter}'")))?;
            let _guard = pipeline_lock(&cfg, &paths, adopt_lock)?;
            mnemo::guard::check_ram(cfg.guards.min_free_mb)?;
            let outcome = pipeline.run_source(&source, adapter).await?;
            info!(?outcome, "pipeline run finished");
        }
        PipelineCmd::Backfill { dir } => {
            let _guard = pipeline_lock(&cfg, &paths, false)?;
            let report = pipeline.backfill(&dir).await?;
            info!(done = report.done, skipped = report.skipped, failed = report.failed, "backfill finished");
            println!(
                "backfill: {} done, {} skipped, {} failed",
                report.done, report.skipped, report.failed
            );
        }
        PipelineCmd::IngestHost { host, adopt_lock } => {
            let _guard = pipeline_lock(&cfg, &paths, adopt_lock)?;
            let report = pipeline.ingest_host(&host).await?;
            info!(host = %host, done = report.done, skipped = report.skipped, failed = report.failed, "ingest finished");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

async fn memory_cmd(cmd: MemoryCmd, cfg: Config, paths: Paths) -> Result<(), MnemoError> {
    let store = open_store(&cfg, &paths)?;

    match cmd {
        MemoryCmd::Summary => {
            let agg = Aggregator::new(&store, &cfg, &paths);
            println!("{}", agg.summary_line()?);
        }
        MemoryCmd::Search {
            prefix,
            keys,
            query,
            semantic,
            key,
            limit,
            format,
            source_verified,
            subject,
            max_age_days,
            type_tag,
        } => {
            let keys = match (key, keys) {
                (Some(k), _) => Some(vec![k]),
                (None, ks) => ks,
            };
            let sq = SearchQuery {
                prefix,
                keys,
                text: query,
                semantic,
                limit,
                filters: VerdictFilters {
                    source_verified,
                    subject,
                    max_age_days,
                    r#type: type_tag,
                },
            };
            let query_emb = match sq.semantic.as_deref() {
                Some(text) => {
                    let ai = AiConfig::from_env()
                        .map(|a| a.with_embed_model(cfg.embedding.model.as_deref()));
                    let cache = EmbedCache::with_store(128, &store);
                    query_embedding(ai.as_ref(), &cache, text).await
                }
                None => None,
            };
            let hits = search::search(&store, &cfg, &sq, query_emb.as_deref())?;
            print_hits(&hits, &format)?;
        }
        MemoryCmd::Store { key, value } => {
            let rules = cfg.key_rules();
            let key = rules.normalize(&key)?;
            let input = FactInput::new(&key, &value, now_ms()).source("cli:store");
            let outcome = store.upsert(&input)?;
            // best-effort immediate embed
            if let Some(ai) = AiConfig::from_env()
                .map(|a| a.with_embed_model(cfg.embedding.model.as_deref()))
            {
                let text = format!("{key}: {value}");
                if let Ok(result) = mnemo::ai::get_embeddings(&ai, &[text]).await {
                    if let (Some(emb), Ok(Some(fact))) =
                        (result.embeddings.into_iter().next(), store.active(&key))
                    {
                        let _ = store.set_embedding(fact.id, &emb);
                    }
                }
            }
            println!("{key}: {outcome:?}");
        }
    }
    Ok(())
}

fn print_hits(hits: &[mnemo::search::SearchHit], format: &str) -> Result<(), MnemoError> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(hits)
                .map_err(|e| MnemoError::Internal(e.to_string()))?;
            println!("{json}");
        }
        // inject-ready block for host hooks
        "hook" => {
            for hit in hits {
                println!("- {}: {}", hit.key, mnemo::util::truncate_chars(&hit.value, 200));
            }
        }
        "text" => {
            for hit in hits {
                match hit.score {
                    Some(score) => println!("{:.3}  {} = {}", score, hit.key, hit.value),
                    None => println!("{} = {}", hit.key, hit.value),
                }
            }
        }
        other => {
            return Err(MnemoError::Validation(format!("unknown format '{other}'")));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// instinct
// ---------------------------------------------------------------------------

async fn instinct_cmd(cmd: InstinctCmd, cfg: Config, paths: Paths) -> Result<(), MnemoError> {
    let store = open_store(&cfg, &paths)?;

    match cmd {
        InstinctCmd::List { domain, injectable } => {
            let floor = if injectable { cfg.instinct.inject_confidence } else { 0.0 };
            let mut instincts = learn::injectable_instincts(&store, floor)?;
            if let Some(domain) = domain {
                instincts.retain(|i| i.record.domain == domain);
            }
            if injectable {
                // inject-ready block for session-start hooks
                for i in &instincts {
                    println!("- when {}: {}", i.record.trigger, i.record.action);
                }
            } else {
                for i in &instincts {
                    println!(
                        "{:.2}  {}  [{}×{}] {}",
                        i.record.confidence, i.key, i.record.domain, i.record.evidence_count,
                        i.record.trigger
                    );
                }
            }
        }
        InstinctCmd::Show { key } => {
            let fact = store.active(&key)?.ok_or(MnemoError::NotFound)?;
            let instinct: learn::Instinct = serde_json::from_str(&fact.value)
                .map_err(|e| MnemoError::Validation(format!("not an instinct record: {e}")))?;
            println!("key:        {}", fact.key);
            println!("trigger:    {}", instinct.trigger);
            println!("action:     {}", instinct.action);
            println!("confidence: {:.2}", instinct.confidence);
            println!("domain:     {}", instinct.domain);
            println!("evidence:   {}", instinct.evidence_count);
        }
        InstinctCmd::Extract { store: persist, min_confidence } => {
            let floor = min_confidence.unwrap_or(cfg.instinct.min_confidence);
            let instincts = learn::extract_instincts(&store, floor)?;
            for i in &instincts {
                println!("{:.2}  {}  {}", i.record.confidence, i.key, i.record.action);
            }
            if persist {
                let stored = learn::store_instincts(&store, &instincts)?;
                println!("stored {stored} instinct(s)");
            }
        }
        InstinctCmd::Delete { key } => {
            if !key.starts_with("agent.instinct.") {
                return Err(MnemoError::Validation("not an instinct key".into()));
            }
            if !store.delete(&key)? {
                return Err(MnemoError::NotFound);
            }
            println!("deleted {key}");
        }
        InstinctCmd::Stats => {
            let instincts = learn::injectable_instincts(&store, 0.0)?;
            let mut by_domain: std::collections::BTreeMap<&str, (usize, f64)> =
                std::collections::BTreeMap::new();
            for i in &instincts {
                let entry = by_domain.entry(i.record.domain.as_str()).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += i.record.confidence;
            }
            println!("{} instinct(s)", instincts.len());
            for (domain, (count, sum)) in by_domain {
                println!("  {domain}: {count} (avg confidence {:.2})", sum / count as f64);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// hooks — swallow everything, log one line, exit 0
// ---------------------------------------------------------------------------

async fn hook_cmd(cmd: HookCmd, cfg: Config, paths: Paths) {
    if let Err(e) = paths.ensure_dirs() {
        warn!(error = %e, "hook: data dir unavailable");
        return;
    }
    match cmd {
        HookCmd::SessionEnd { host } => {
            let stdin = read_stdin();
            let latest = mnemo::pipeline::latest_session(&cfg, &host);
            let action = hooks::session_end(&cfg, &paths, stdin.as_deref(), &host, latest);
            info!(?action, "session-end hook");
        }
        HookCmd::TokenMonitor { host } => {
            let Some(stdin) = read_stdin() else {
                info!("token-monitor: no stdin event");
                return;
            };
            let action = hooks::token_monitor(&cfg, &paths, &stdin, &host);
            info!(?action, "token-monitor hook");
        }
        HookCmd::Observe => {
            let Some(stdin) = read_stdin() else {
                info!("observe: no stdin event");
                return;
            };
            if let Err(e) = hooks::observe(&paths, &stdin) {
                warn!(error = %e, "observe hook failed");
            }
        }
    }
}
