//! Pipeline orchestrator: transcript → normalize → filter → chunk/extract →
//! align → dedup → commit → embed → aggregate, with a processed-source
//! ledger for idempotency and RAM/session caps for safety.
//!
//! Each source is an independent unit of work: a stage failure fails that
//! source only, and the ledger is not advanced so the next run retries it.
//! Malformed data is the exception — it is dropped *and* recorded, so a
//! corrupt file can't loop forever.

pub mod align;
pub mod dedup;
pub mod extract;
pub mod ledger;
pub mod noise;
pub mod normalize;

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::ai::{self, AiConfig};
use crate::aggregate::Aggregator;
use crate::config::{Config, Paths};
use crate::error::MnemoError;
use crate::guard;
use crate::store::FactInput;
use crate::SharedStore;

use align::TimedFact;
use dedup::{DedupDecision, DedupStats};
use ledger::{file_mtime, Ledger};
use noise::NoiseFilter;
use normalize::{Adapter, NormalizedMessage};

pub struct Pipeline {
    pub store: SharedStore,
    pub cfg: Config,
    pub paths: Paths,
    pub ai: Option<AiConfig>,
}

#[derive(Debug)]
pub enum SourceOutcome {
    Skipped { reason: &'static str },
    Done(SourceStats),
}

#[derive(Debug, Default)]
pub struct SourceStats {
    pub messages: usize,
    pub kept_messages: usize,
    pub extracted: usize,
    pub dedup: DedupStats,
    pub cases: usize,
    pub patterns: usize,
    pub embedded: usize,
}

#[derive(Debug, Default)]
pub struct BackfillReport {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Pipeline {
    pub fn new(store: SharedStore, cfg: Config, paths: Paths, ai: Option<AiConfig>) -> Self {
        Self { store, cfg, paths, ai }
    }

    fn ledger(&self) -> Result<Ledger, MnemoError> {
        Ledger::load(&self.paths.ledger_file())
    }

    /// Process one transcript file end to end.
    pub async fn run_source(&self, path: &Path, adapter: Adapter) -> Result<SourceOutcome, MnemoError> {
        let mut ledger = self.ledger()?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let source_id = format!("{}{file_name}", adapter.ledger_prefix());
        let mtime = file_mtime(path);
        self.run_source_with_id(path, adapter, &source_id, mtime, &mut ledger).await
    }

    /// Inner path used by backfill and the host converters, which control
    /// the ledger id and mtime themselves.
    async fn run_source_with_id(
        &self,
        path: &Path,
        adapter: Adapter,
        source_id: &str,
        mtime: i64,
        ledger: &mut Ledger,
    ) -> Result<SourceOutcome, MnemoError> {
        if ledger.is_processed(source_id, mtime) {
            info!(source = source_id, stage = "ledger", "already processed, skipping");
            return Ok(SourceOutcome::Skipped { reason: "already processed" });
        }

        let messages = match normalize::normalize_file(path, adapter) {
            Ok(m) => m,
            Err(MnemoError::MalformedTranscript(detail)) => {
                // corrupt input: drop with a warning but advance the ledger
                warn!(source = source_id, stage = "normalize", error = %detail, "malformed transcript dropped");
                ledger.record(source_id, mtime)?;
                return Ok(SourceOutcome::Skipped { reason: "malformed" });
            }
            Err(e) => return Err(e),
        };
        info!(source = source_id, stage = "normalize", messages = messages.len(), "normalized");
        if messages.is_empty() {
            ledger.record(source_id, mtime)?;
            return Ok(SourceOutcome::Skipped { reason: "empty" });
        }

        let filter = NoiseFilter::new(&self.cfg.noise);
        let kept: Vec<NormalizedMessage> = messages
            .iter()
            .filter(|m| !filter.is_noise_message(&m.text))
            .cloned()
            .collect();
        info!(source = source_id, stage = "filter", kept = kept.len(), dropped = messages.len() - kept.len(), "filtered");
        if kept.is_empty() {
            ledger.record(source_id, mtime)?;
            return Ok(SourceOutcome::Skipped { reason: "only noise" });
        }

        let mut stats = SourceStats {
            messages: messages.len(),
            kept_messages: kept.len(),
            ..Default::default()
        };

        let message_timestamp = kept
            .iter()
            .map(|m| m.timestamp_ms)
            .filter(|t| *t > 0)
            .min()
            .unwrap_or(mtime * 1_000);

        let rules = self.cfg.key_rules();
        let raw_facts = match &self.ai {
            Some(ai_cfg) => {
                let text = extract::conversation_text(&kept);
                // transient extractor failures propagate: source retried next run
                extract::extract_facts(ai_cfg, &rules, &filter, &text, source_id, message_timestamp)
                    .await?
            }
            None => {
                warn!(source = source_id, stage = "extract", "no LLM provider configured, extracting nothing");
                vec![]
            }
        };
        stats.extracted = raw_facts.len();
        info!(source = source_id, stage = "extract", facts = raw_facts.len(), "extracted");

        let timed = align::align(raw_facts);
        info!(source = source_id, stage = "align", facts = timed.len(), "aligned");

        let embeddings = self.embed_candidates(&timed).await;
        let mut dates: Vec<NaiveDate> = Vec::new();
        fn note_date(dates: &mut Vec<NaiveDate>, ts: i64) {
            if let Some(date) = chrono::DateTime::from_timestamp_millis(ts).map(|d| d.date_naive())
            {
                if !dates.contains(&date) {
                    dates.push(date);
                }
            }
        }
        for (fact, emb) in timed.iter().zip(embeddings.iter()) {
            let decision = dedup::decide(
                &self.store,
                self.ai.as_ref(),
                &self.cfg.dedup,
                fact,
                emb.as_deref(),
                &mut stats.dedup,
            )
            .await;

            let input = FactInput::new(&fact.key, &fact.value, fact.start_time)
                .source(&fact.source);
            let committed = match decision {
                DedupDecision::Skip => false,
                DedupDecision::Merge(target) => {
                    self.store.apply_merge(&target, &input)?;
                    true
                }
                DedupDecision::Create => {
                    self.store.upsert(&input)?;
                    true
                }
            };
            if committed {
                note_date(&mut dates, fact.start_time);
            }
        }
        info!(
            source = source_id,
            stage = "commit",
            created = stats.dedup.created,
            merged = stats.dedup.merged,
            skipped = stats.dedup.skipped,
            "committed"
        );

        // learning: cases and patterns from the same transcript
        let events = crate::learn::scan_tool_events(&kept);
        let session = extract::source_tag(source_id);
        for case in crate::learn::extract_cases(&kept, &events, &session) {
            let value = serde_json::to_string(&case.record)
                .map_err(|e| MnemoError::Internal(format!("case json: {e}")))?;
            let input = FactInput::new(&case.key, value, case.record.timestamp)
                .source("auto:learning-extraction");
            self.store.upsert(&input)?;
            note_date(&mut dates, case.record.timestamp);
            stats.cases += 1;
        }
        for pattern in crate::learn::extract_patterns(&events) {
            let value = serde_json::to_string(&pattern.record)
                .map_err(|e| MnemoError::Internal(format!("pattern json: {e}")))?;
            let input = FactInput::new(&pattern.key, value, message_timestamp)
                .source("auto:learning-extraction");
            self.store.upsert(&input)?;
            note_date(&mut dates, message_timestamp);
            stats.patterns += 1;
        }
        info!(source = source_id, stage = "learn", cases = stats.cases, patterns = stats.patterns, "learned");

        stats.embedded = self.embed_missing().await;
        info!(source = source_id, stage = "embed", embedded = stats.embedded, "embedded");

        Aggregator::new(&self.store, &self.cfg, &self.paths).run(&dates)?;
        info!(source = source_id, stage = "aggregate", "aggregated");

        ledger.record(source_id, mtime)?;
        Ok(SourceOutcome::Done(stats))
    }

    /// Embed the index text of each candidate fact. Batches run
    /// concurrently; a failed batch leaves `None` slots — dedup then falls
    /// back to `create` and the embed stage catches up later.
    async fn embed_candidates(&self, facts: &[TimedFact]) -> Vec<Option<Vec<f32>>> {
        let Some(ai_cfg) = &self.ai else {
            return vec![None; facts.len()];
        };
        if !self.cfg.dedup.enabled || facts.is_empty() {
            return vec![None; facts.len()];
        }
        let texts: Vec<String> = facts
            .iter()
            .map(|f| format!("{}: {}", f.key, f.value))
            .collect();
        let batches = texts
            .chunks(self.cfg.embedding.batch_size.max(1))
            .map(|batch| ai::get_embeddings(ai_cfg, batch));
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        for (result, batch) in futures::future::join_all(batches)
            .await
            .into_iter()
            .zip(texts.chunks(self.cfg.embedding.batch_size.max(1)))
        {
            match result {
                Ok(result) => out.extend(result.embeddings.into_iter().map(Some)),
                Err(e) => {
                    warn!(error = %e, "candidate embedding batch failed");
                    out.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }
        }
        out
    }

    /// Lazily embed active rows that have no vector yet, with backoff on
    /// transient provider failures.
    pub async fn embed_missing(&self) -> usize {
        use backon::{ExponentialBuilder, Retryable};

        let Some(ai_cfg) = &self.ai else { return 0 };
        let batch_size = self.cfg.embedding.batch_size.max(1);
        let mut total = 0;
        loop {
            let missing = self.store.missing_embeddings(batch_size);
            if missing.is_empty() {
                break;
            }
            let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let result = match (|| ai::get_embeddings(ai_cfg, &texts))
                .retry(ExponentialBuilder::default().with_max_times(3))
                .notify(|err, dur| {
                    warn!(error = %err, retry_after = ?dur, "embed batch failed, retrying");
                })
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "embed batch failed after retries, leaving backlog");
                    break;
                }
            };
            for ((id, _), emb) in missing.iter().zip(result.embeddings) {
                match self.store.set_embedding(*id, &emb) {
                    Ok(()) => total += 1,
                    // row superseded or closed since the batch was cut
                    Err(MnemoError::NotFound) => {}
                    Err(e) => {
                        warn!(id, error = %e, "set_embedding failed");
                        return total;
                    }
                }
            }
        }
        total
    }

    /// Process every `.jsonl` file in a directory, sorted, honoring the
    /// session cap and the RAM floor before each file.
    pub async fn backfill(&self, dir: &Path) -> Result<BackfillReport, MnemoError> {
        let mut files = jsonl_files(dir)?;
        files.sort();
        let cap = self.cfg.guards.max_sessions_per_run;
        if files.len() > cap {
            warn!(total = files.len(), cap, "session cap reached, truncating run");
            files.truncate(cap);
        }

        let mut ledger = self.ledger()?;
        let mut report = BackfillReport::default();
        for file in files {
            guard::check_ram(self.cfg.guards.min_free_mb)?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mtime = file_mtime(&file);
            match self
                .run_source_with_id(&file, Adapter::Claude, &file_name, mtime, &mut ledger)
                .await
            {
                Ok(SourceOutcome::Done(_)) => report.done += 1,
                Ok(SourceOutcome::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    // sources are independent; log and move on
                    warn!(source = %file.display(), error = %e, "source failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Ingest a configured host's session directory. The gemini adapter
    /// converts each session document to JSONL in a unique temp dir first,
    /// registering sources under the `gemini:` ledger prefix.
    pub async fn ingest_host(&self, host: &str) -> Result<BackfillReport, MnemoError> {
        let dir = self
            .cfg
            .session_dirs
            .get(host)
            .cloned()
            .ok_or_else(|| MnemoError::Validation(format!("no session_dirs entry for '{host}'")))?;
        match host {
            "gemini" => self.ingest_gemini(&dir).await,
            _ => self.backfill(&dir).await,
        }
    }

    async fn ingest_gemini(&self, dir: &Path) -> Result<BackfillReport, MnemoError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| MnemoError::Internal(format!("read {}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        let cap = self.cfg.guards.max_sessions_per_run;
        files.truncate(cap);

        // unique staging dir, removed unconditionally at the end
        let staging = std::env::temp_dir().join(format!(
            "mnemo-gemini-{}-{}",
            std::process::id(),
            crate::store::now_ms()
        ));
        std::fs::create_dir_all(&staging)
            .map_err(|e| MnemoError::Internal(format!("staging dir: {e}")))?;

        let mut ledger = self.ledger()?;
        let mut report = BackfillReport::default();
        for file in files {
            guard::check_ram(self.cfg.guards.min_free_mb)?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let source_id = format!("gemini:{file_name}");
            let mtime = file_mtime(&file);
            if ledger.is_processed(&source_id, mtime) {
                report.skipped += 1;
                continue;
            }

            let converted = staging.join(format!("{file_name}.jsonl"));
            let outcome = match normalize::normalize_file(&file, Adapter::Gemini) {
                Ok(messages) => {
                    if std::fs::write(&converted, normalize::to_jsonl(&messages)).is_err() {
                        report.failed += 1;
                        continue;
                    }
                    self.run_source_with_id(
                        &converted,
                        Adapter::Claude,
                        &source_id,
                        mtime,
                        &mut ledger,
                    )
                    .await
                }
                Err(MnemoError::MalformedTranscript(detail)) => {
                    warn!(source = %source_id, error = %detail, "malformed gemini session dropped");
                    ledger.record(&source_id, mtime)?;
                    Ok(SourceOutcome::Skipped { reason: "malformed" })
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(SourceOutcome::Done(_)) => report.done += 1,
                Ok(SourceOutcome::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    warn!(source = %source_id, error = %e, "source failed");
                    report.failed += 1;
                }
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        Ok(report)
    }

}

/// The most recently modified `.jsonl` session for a host — the fallback
/// when a hook doesn't hand us a session path.
pub fn latest_session(cfg: &Config, host: &str) -> Option<PathBuf> {
    let dir = cfg.session_dirs.get(host)?;
    let files = jsonl_files(dir).ok()?;
    files.into_iter().max_by_key(|p| file_mtime(p))
}

fn jsonl_files(dir: &Path) -> Result<Vec<PathBuf>, MnemoError> {
    Ok(std::fs::read_dir(dir)
        .map_err(|e| MnemoError::Internal(format!("read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect())
}
