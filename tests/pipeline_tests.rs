//! End-to-end pipeline runs against a real temp data dir, with no LLM
//! provider configured: extraction yields nothing, but normalization,
//! filtering, learning, idempotency, and aggregation all exercise fully.

use std::path::Path;
use std::sync::Arc;

use mnemo::config::{Config, Paths};
use mnemo::pipeline::normalize::Adapter;
use mnemo::pipeline::{Pipeline, SourceOutcome};
use mnemo::store::FactStore;

fn setup(dir: &Path) -> Pipeline {
    let paths = Paths::new(dir.join("data"));
    paths.ensure_dirs().unwrap();
    let store = Arc::new(FactStore::open(&paths.db_file().display().to_string()).unwrap());
    Pipeline::new(store, Config::default(), paths, None)
}

fn write_transcript(path: &Path, lines: &[(&str, &str, &str)]) {
    let mut out = String::new();
    for (role, text, ts) in lines {
        let line = serde_json::json!({
            "type": "message",
            "message": {"role": role, "content": text},
            "timestamp": ts,
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    std::fs::write(path, out).unwrap();
}

fn failing_test_transcript(path: &Path) {
    write_transcript(
        path,
        &[
            ("user", "please run the test suite for me", "2026-01-01T10:00:00Z"),
            (
                "assistant",
                "Bash: Exit code 1\ntest city_update ... FAILED\nassertion failed: left == right",
                "2026-01-01T10:00:10Z",
            ),
            (
                "assistant",
                "The fixture still used the old city; I updated it and reran.",
                "2026-01-01T10:00:20Z",
            ),
            ("assistant", "Edit: updated tests/fixtures.rs", "2026-01-01T10:00:30Z"),
            ("assistant", "Bash: Exit code 0\nall 42 tests passed", "2026-01-01T10:00:40Z"),
        ],
    );
}

#[tokio::test]
async fn processing_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let transcript = dir.path().join("sess-1.jsonl");
    failing_test_transcript(&transcript);

    let first = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(first, SourceOutcome::Done(_)));
    let rows_after_first = pipeline.store.count_active().unwrap();
    assert!(rows_after_first > 0, "learning extracted cases/patterns");

    let second = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(second, SourceOutcome::Skipped { .. }));
    assert_eq!(pipeline.store.count_active().unwrap(), rows_after_first);
}

#[tokio::test]
async fn error_recovery_becomes_a_case() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let transcript = dir.path().join("sess-1.jsonl");
    failing_test_transcript(&transcript);

    pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();

    let cases = pipeline.store.active_prefix("agent.case.test_failure.").unwrap();
    assert_eq!(cases.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&cases[0].value).unwrap();
    assert_eq!(value["outcome"], "resolved");
    assert_eq!(value["session"], "sess-1");
    let tools: Vec<String> = value["solution"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    assert!(tools.contains(&"Bash".to_string()));
}

#[tokio::test]
async fn noise_only_transcript_is_skipped_but_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let transcript = dir.path().join("noise.jsonl");
    write_transcript(
        &transcript,
        &[
            ("user", "hi", "2026-01-01T10:00:00Z"),
            ("assistant", "你好", "2026-01-01T10:00:01Z"),
            ("user", "thanks", "2026-01-01T10:00:02Z"),
        ],
    );

    let first = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(first, SourceOutcome::Skipped { reason: "only noise" }));
    assert_eq!(pipeline.store.count_active().unwrap(), 0);

    // recorded in the ledger: second run skips for a different reason
    let second = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(second, SourceOutcome::Skipped { reason: "already processed" }));
}

#[tokio::test]
async fn malformed_transcript_is_dropped_and_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let transcript = dir.path().join("bad.jsonl");
    std::fs::write(&transcript, "this is not json\n").unwrap();

    let first = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(first, SourceOutcome::Skipped { reason: "malformed" }));

    let second = pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();
    assert!(matches!(second, SourceOutcome::Skipped { reason: "already processed" }));
}

#[tokio::test]
async fn backfill_processes_directory_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let sessions = dir.path().join("sessions");
    std::fs::create_dir_all(&sessions).unwrap();

    failing_test_transcript(&sessions.join("a.jsonl"));
    write_transcript(
        &sessions.join("b.jsonl"),
        &[("user", "hello", "2026-01-02T10:00:00Z")],
    );
    std::fs::write(sessions.join("notes.txt"), "ignored").unwrap();

    let report = pipeline.backfill(&sessions).await.unwrap();
    assert_eq!(report.done, 1);
    assert_eq!(report.skipped, 1, "noise-only b.jsonl");
    assert_eq!(report.failed, 0);

    // a second backfill is a no-op
    let again = pipeline.backfill(&sessions).await.unwrap();
    assert_eq!(again.done, 0);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn aggregates_are_written_after_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    let transcript = dir.path().join("sess-1.jsonl");
    failing_test_transcript(&transcript);

    pipeline.run_source(&transcript, Adapter::Claude).await.unwrap();

    let digest_raw = std::fs::read_to_string(pipeline.paths.digest_file()).unwrap();
    let digest: serde_json::Value = serde_json::from_str(&digest_raw).unwrap();
    assert!(digest["total_facts"].as_u64().unwrap() > 0);

    assert!(pipeline.paths.topics_dir().join("index.md").exists());
    // the case landed on 2026-01-01
    assert!(pipeline.paths.daily_dir().join("2026-01-01.md").exists());
}

#[tokio::test]
async fn gemini_sessions_convert_and_register_with_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("data"));
    paths.ensure_dirs().unwrap();
    let store = Arc::new(FactStore::open(&paths.db_file().display().to_string()).unwrap());

    let sessions = dir.path().join("gemini-sessions");
    std::fs::create_dir_all(&sessions).unwrap();
    let session = serde_json::json!({
        "startTime": "2026-01-03T08:00:00Z",
        "messages": [
            {"role": "user", "text": "Bash: Exit code 1\nmodule not found error"},
            {"role": "model", "text": "Installing the missing module fixed it."},
            {"role": "model", "text": "Bash: Exit code 0\ninstalled and imported fine"}
        ]
    });
    std::fs::write(sessions.join("sess-9.json"), session.to_string()).unwrap();

    let mut cfg = Config::default();
    cfg.session_dirs.insert("gemini".into(), sessions);
    let pipeline = Pipeline::new(store, cfg, paths, None);

    let report = pipeline.ingest_host("gemini").await.unwrap();
    assert_eq!(report.done, 1);

    let cases = pipeline.store.active_prefix("agent.case.").unwrap();
    assert_eq!(cases.len(), 1, "case learned through the converter path");

    // idempotent under the gemini: ledger prefix
    let again = pipeline.ingest_host("gemini").await.unwrap();
    assert_eq!(again.done, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn unknown_host_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());
    assert!(pipeline.ingest_host("unknown").await.is_err());
}
