use mnemo::store::{FactInput, FactStore, UpsertOutcome};
use rusqlite::params;

fn test_db() -> FactStore {
    FactStore::open(":memory:").expect("in-memory db")
}

#[test]
fn at_most_one_active_row_per_key() {
    let db = test_db();
    for (value, at) in [("a", 1_000), ("b", 2_000), ("c", 3_000), ("b", 4_000)] {
        db.upsert(&FactInput::new("config.db_path", value, at)).unwrap();
    }
    let history = db.history("config.db_path").unwrap();
    assert_eq!(history.iter().filter(|f| f.is_active()).count(), 1);
    assert_eq!(db.active("config.db_path").unwrap().unwrap().value, "b");
}

#[test]
fn start_times_strictly_increase() {
    let db = test_db();
    for (value, at) in [("a", 5_000), ("b", 5_000), ("c", 1_000)] {
        db.upsert(&FactInput::new("user.city", value, at)).unwrap();
    }
    let history = db.history("user.city").unwrap();
    for pair in history.windows(2) {
        assert!(pair[0].start_time < pair[1].start_time);
        // supersession chains exactly
        assert_eq!(pair[0].end_time, Some(pair[1].start_time));
    }
}

#[test]
fn store_twice_same_value_single_row() {
    let db = test_db();
    db.upsert(&FactInput::new("user.name", "Alice", 1_000)).unwrap();
    let out = db.upsert(&FactInput::new("user.name", "Alice", 2_000)).unwrap();
    assert_eq!(out, UpsertOutcome::Skipped);
    assert_eq!(db.history("user.name").unwrap().len(), 1);
}

#[test]
fn simple_update_scenario() {
    // two transcripts, one day apart
    let t1 = 1_767_261_600_000; // 2026-01-01T10:00:00Z
    let t2 = 1_767_344_400_000; // 2026-01-02T09:00:00Z
    let db = test_db();
    db.upsert(&FactInput::new("user.city", "Taipei", t1).source("session:a")).unwrap();
    db.upsert(&FactInput::new("user.city", "Hsinchu", t2).source("session:b")).unwrap();

    let history = db.history("user.city").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].value, "Taipei");
    assert_eq!(history[0].start_time, t1);
    assert_eq!(history[0].end_time, Some(t2));
    assert_eq!(history[1].value, "Hsinchu");
    assert_eq!(history[1].start_time, t2);
    assert!(history[1].end_time.is_none());

    assert_eq!(db.count_active().unwrap(), 1);
}

#[test]
fn crash_recovery_keeps_latest_start_active() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("mnemo.db");
    let db_path_str = db_path.display().to_string();

    {
        let db = FactStore::open(&db_path_str).unwrap();
        db.upsert(&FactInput::new("config.db_path", "/tmp/a", 1_000)).unwrap();
    }

    // simulate a torn write: a second open row for the same key
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO facts (key, value, source, start_time, end_time) \
             VALUES ('config.db_path', '/tmp/b', 'manual', 2000, NULL)",
            params![],
        )
        .unwrap();
    }

    let db = FactStore::open(&db_path_str).unwrap();
    let history = db.history("config.db_path").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].value, "/tmp/a");
    assert_eq!(history[0].end_time, Some(2_000), "earlier row closed at survivor start");
    let active = db.active("config.db_path").unwrap().unwrap();
    assert_eq!(active.value, "/tmp/b");

    // FTS reconciled to the active set: only /tmp/b is indexed
    let report = db.verify_integrity().unwrap();
    assert!(report.ok, "integrity after recovery: {report:?}");
    assert!(db.search_fts("a", 10).is_empty());
    assert!(!db.search_fts("b", 10).is_empty());
}

#[test]
fn fts_mirrors_active_set_through_lifecycle() {
    let db = test_db();
    db.upsert(&FactInput::new("user.city", "Taipei", 1_000)).unwrap();
    db.upsert(&FactInput::new("user.city", "Hsinchu", 2_000)).unwrap();
    db.upsert(&FactInput::new("project.lang", "Rust", 1_000)).unwrap();
    db.delete("project.lang").unwrap();

    let report = db.verify_integrity().unwrap();
    assert!(report.ok);
    assert_eq!(report.active_rows, 1);
    assert_eq!(report.fts_indexed, 1);
    assert!(db.search_fts("Rust", 10).is_empty());
    assert!(db.search_fts("Taipei", 10).is_empty());
    assert!(!db.search_fts("Hsinchu", 10).is_empty());
}

#[test]
fn history_survives_delete_and_reinsert() {
    let db = test_db();
    db.upsert(&FactInput::new("user.city", "Taipei", 1_000)).unwrap();
    db.delete("user.city").unwrap();
    db.upsert(&FactInput::new("user.city", "Hsinchu", i64::MAX / 2)).unwrap();

    let history = db.history("user.city").unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].end_time.is_some());
    assert!(history[1].is_active());
}

#[test]
fn invariants_hold_under_random_interleaving() {
    use rand::seq::SliceRandom;
    use rand::Rng;

    let db = test_db();
    let mut rng = rand::thread_rng();
    let keys = ["user.city", "user.name", "project.lang", "config.db_path"];

    for step in 0..200 {
        let key = *keys.choose(&mut rng).unwrap();
        if rng.gen_bool(0.15) {
            let _ = db.delete(key);
        } else {
            let value = format!("v{}", rng.gen_range(0..6));
            db.upsert(&FactInput::new(key, value, step * 10)).unwrap();
        }
    }

    let report = db.verify_integrity().unwrap();
    assert!(report.ok, "integrity violated: {report:?}");
    for key in keys {
        let history = db.history(key).unwrap();
        assert!(history.iter().filter(|f| f.is_active()).count() <= 1);
        for pair in history.windows(2) {
            assert!(pair[0].start_time < pair[1].start_time, "start_time monotonic");
            assert!(pair[0].end_time.is_some(), "only the last row may be open");
        }
    }
}

#[test]
fn on_disk_store_reopens_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.db").display().to_string();
    {
        let db = FactStore::open(&path).unwrap();
        db.upsert(&FactInput::new("user.name", "Alice", 1_000)).unwrap();
        let id = db.active("user.name").unwrap().unwrap().id;
        db.set_embedding(id, &[0.5, 0.5]).unwrap();
    }
    let db = FactStore::open(&path).unwrap();
    assert_eq!(db.active("user.name").unwrap().unwrap().value, "Alice");
    assert_eq!(db.embedding_dim(), Some(2));
    // vector index reloaded from the active set
    let hits = db.search_semantic(&[0.5, 0.5], 0.9, 10);
    assert_eq!(hits.len(), 1);
}
