//! Hybrid search fusion against a seeded store.

use mnemo::config::Config;
use mnemo::search::{search, SearchQuery, VerdictFilters};
use mnemo::store::{FactInput, FactStore};

fn seeded() -> (FactStore, Config) {
    let db = FactStore::open(":memory:").unwrap();
    db.upsert(&FactInput::new("user.editor.primary", "vscode", 1_000)).unwrap();
    db.upsert(&FactInput::new("auth.gog_keyring_password", "<redacted>", 2_000)).unwrap();
    db.upsert(&FactInput::new("user.shell", "fish", 3_000)).unwrap();
    (db, Config::default())
}

fn set_emb(db: &FactStore, key: &str, v: &[f32]) {
    let id = db.active(key).unwrap().unwrap().id;
    db.set_embedding(id, v).unwrap();
}

#[test]
fn semantic_query_ranks_vector_match_first() {
    let (db, cfg) = seeded();
    set_emb(&db, "user.editor.primary", &[1.0, 0.0, 0.0]);
    set_emb(&db, "auth.gog_keyring_password", &[0.0, 1.0, 0.0]);
    set_emb(&db, "user.shell", &[0.5, 0.5, 0.0]);

    let q = SearchQuery {
        semantic: Some("code editor".into()),
        limit: 10,
        ..Default::default()
    };
    let hits = search(&db, &cfg, &q, Some(&[0.98, 0.05, 0.0])).unwrap();

    assert_eq!(hits[0].key, "user.editor.primary");
    // the unrelated secret never crosses the 0.3 vector threshold and has
    // no keyword hit for this query
    assert!(hits.iter().all(|h| h.key != "auth.gog_keyring_password"));
}

#[test]
fn exact_keyword_query_finds_the_secret_row() {
    let (db, cfg) = seeded();
    let q = SearchQuery {
        text: Some("GOG_KEYRING_PASSWORD".into()),
        limit: 10,
        ..Default::default()
    };
    let hits = search(&db, &cfg, &q, None).unwrap();
    assert_eq!(hits[0].key, "auth.gog_keyring_password");
}

#[test]
fn dual_hit_rows_get_the_bonus() {
    let (db, cfg) = seeded();
    set_emb(&db, "user.editor.primary", &[1.0, 0.0]);
    set_emb(&db, "user.shell", &[0.95, 0.05]);

    // query matches user.editor.primary both by vector and by the keyword
    // "vscode"; user.shell only by vector, despite similar cosine
    let q = SearchQuery {
        semantic: Some("vscode".into()),
        limit: 10,
        ..Default::default()
    };
    let hits = search(&db, &cfg, &q, Some(&[1.0, 0.0])).unwrap();

    let editor = hits.iter().find(|h| h.key == "user.editor.primary").unwrap();
    let shell = hits.iter().find(|h| h.key == "user.shell").unwrap();
    assert!(editor.score.unwrap() > shell.score.unwrap());
    // bonus + bm25 weight lift the dual hit well above vector-only
    assert!(editor.score.unwrap() - shell.score.unwrap() > 0.2);
}

#[test]
fn semantic_without_provider_degrades_to_keyword() {
    let (db, cfg) = seeded();
    let q = SearchQuery {
        semantic: Some("vscode".into()),
        limit: 10,
        ..Default::default()
    };
    let hits = search(&db, &cfg, &q, None).unwrap();
    assert_eq!(hits[0].key, "user.editor.primary");
}

#[test]
fn recency_breaks_score_ties() {
    let (db, cfg) = seeded();
    let q = SearchQuery { limit: 10, ..Default::default() };
    let hits = search(&db, &cfg, &q, None).unwrap();
    // no query: most recent start_time first
    assert_eq!(hits[0].key, "user.shell");
    assert_eq!(hits.last().unwrap().key, "user.editor.primary");
}

#[test]
fn filters_compose() {
    let (db, cfg) = seeded();
    let q = SearchQuery {
        prefix: Some("user.".into()),
        limit: 10,
        filters: VerdictFilters {
            subject: Some("editor".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let hits = search(&db, &cfg, &q, None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, "user.editor.primary");
}
