//! Case → instinct flow across several sessions, end to end.

use std::path::Path;
use std::sync::Arc;

use mnemo::config::{Config, Paths};
use mnemo::learn;
use mnemo::pipeline::normalize::Adapter;
use mnemo::pipeline::Pipeline;
use mnemo::store::FactStore;

fn setup(dir: &Path) -> Pipeline {
    let paths = Paths::new(dir.join("data"));
    paths.ensure_dirs().unwrap();
    let store = Arc::new(FactStore::open(&paths.db_file().display().to_string()).unwrap());
    Pipeline::new(store, Config::default(), paths, None)
}

fn test_failure_transcript(path: &Path, day: u32, detail: &str) {
    let mut out = String::new();
    let lines = [
        ("user", "run the tests".to_string()),
        (
            "assistant",
            format!("Bash: Exit code 1\ntest {detail} ... FAILED\nassertion failed"),
        ),
        ("assistant", format!("Fixed by correcting {detail} and rerunning.")),
        ("assistant", "Bash: Exit code 0\nall tests passed".to_string()),
    ];
    for (i, (role, text)) in lines.iter().enumerate() {
        let line = serde_json::json!({
            "type": "message",
            "message": {"role": role, "content": text},
            "timestamp": format!("2026-01-{day:02}T10:00:{i:02}Z"),
        });
        out.push_str(&line.to_string());
        out.push('\n');
    }
    std::fs::write(path, out).unwrap();
}

#[tokio::test]
async fn three_failures_make_a_medium_confidence_instinct() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());

    for (i, detail) in ["city_update", "auth_flow", "search_rank"].iter().enumerate() {
        let path = dir.path().join(format!("sess-{i}.jsonl"));
        test_failure_transcript(&path, (i + 1) as u32, detail);
        pipeline.run_source(&path, Adapter::Claude).await.unwrap();
    }

    let cases = pipeline.store.active_prefix("agent.case.test_failure.").unwrap();
    assert_eq!(cases.len(), 3, "one case per session");

    let instincts = learn::extract_instincts(&pipeline.store, 0.5).unwrap();
    assert_eq!(instincts.len(), 1);
    let instinct = &instincts[0];
    assert_eq!(instinct.key, "agent.instinct.error.test_failure");
    assert!((instinct.record.confidence - 0.6).abs() < f64::EPSILON);
    assert_eq!(instinct.record.evidence_count, 3);
    assert!(instinct.record.action.contains("Bash"));

    learn::store_instincts(&pipeline.store, &instincts).unwrap();

    // 0.6 meets the injection floor
    let injectable = learn::injectable_instincts(&pipeline.store, 0.6).unwrap();
    assert_eq!(injectable.len(), 1);

    // re-running the whole extraction supersedes rather than duplicates
    let again = learn::extract_instincts(&pipeline.store, 0.5).unwrap();
    learn::store_instincts(&pipeline.store, &again).unwrap();
    let history = pipeline.store.history("agent.instinct.error.test_failure").unwrap();
    assert_eq!(history.iter().filter(|f| f.is_active()).count(), 1);
}

#[tokio::test]
async fn two_failures_stay_below_injection_floor() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = setup(dir.path());

    for (i, detail) in ["alpha", "beta"].iter().enumerate() {
        let path = dir.path().join(format!("sess-{i}.jsonl"));
        test_failure_transcript(&path, (i + 1) as u32, detail);
        pipeline.run_source(&path, Adapter::Claude).await.unwrap();
    }

    let instincts = learn::extract_instincts(&pipeline.store, 0.5).unwrap();
    assert_eq!(instincts.len(), 1);
    assert!((instincts[0].record.confidence - 0.5).abs() < f64::EPSILON);
    learn::store_instincts(&pipeline.store, &instincts).unwrap();

    assert!(learn::injectable_instincts(&pipeline.store, 0.6).unwrap().is_empty());
}
