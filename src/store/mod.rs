//! SQLite-backed fact storage: temporally-versioned rows with FTS5 full-text
//! search and an in-memory vector index over the active set.

mod facts;
mod fts;
mod vec;

pub use facts::UpsertOutcome;

use std::sync::{OnceLock, RwLock};

pub(crate) fn jieba() -> &'static jieba_rs::Jieba {
    static INSTANCE: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    INSTANCE.get_or_init(jieba_rs::Jieba::new)
}

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::MnemoError;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY under concurrent write pressure (pipeline + API).
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_KEY_LEN: usize = 256;
const MAX_VALUE_LEN: usize = 16384;
const MAX_SOURCE_LEN: usize = 128;

/// One versioned row. `end_time = None` ⇒ this is the active value for `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub source: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Fact {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Text form used for both FTS indexing and embedding.
    pub fn index_text(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}

/// Input to `upsert` — a timed fact before it has a row identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactInput {
    pub key: String,
    pub value: String,
    #[serde(default = "default_source")]
    pub source: String,
    pub start_time: i64,
}

fn default_source() -> String {
    "manual".into()
}

impl FactInput {
    pub fn new(key: impl Into<String>, value: impl Into<String>, start_time: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: default_source(),
            start_time,
        }
    }

    pub fn source(mut self, s: impl Into<String>) -> Self {
        self.source = s.into();
        self
    }
}

fn validate_input(input: &FactInput) -> Result<(), MnemoError> {
    if input.key.trim().is_empty() {
        return Err(MnemoError::EmptyKey);
    }
    if input.value.trim().is_empty() {
        return Err(MnemoError::EmptyValue);
    }
    if input.key.len() > MAX_KEY_LEN {
        return Err(MnemoError::Validation("key too long".into()));
    }
    if input.value.chars().count() > MAX_VALUE_LEN {
        return Err(MnemoError::Validation("value too long".into()));
    }
    if input.source.len() > MAX_SOURCE_LEN {
        return Err(MnemoError::Validation("source too long".into()));
    }
    Ok(())
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub total_rows: usize,
    pub active_rows: usize,
    pub fts_indexed: usize,
    pub orphan_fts: usize,
    pub missing_fts: usize,
    pub missing_embedding: usize,
    pub multi_active_keys: usize,
    pub ok: bool,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

// FTS5 unicode61 tokenizer handles Latin scripts fine but can't segment CJK.
// We use jieba for proper Chinese word segmentation and fall back to bigrams
// for Japanese/Korean which jieba doesn't cover.
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Basic
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}' // Hangul
    )
}

fn is_cjk_ideograph(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
    )
}

/// Segment CJK text properly and append tokens for FTS5 indexing.
/// Chinese goes through jieba; Japanese/Korean falls back to bigrams.
pub(crate) fn append_segmented(text: &str) -> String {
    let has_cjk = text.chars().any(is_cjk);
    if !has_cjk {
        return text.to_string();
    }

    // Split CJK/latin boundaries so "alice是谁" → "alice 是谁"
    let mut spaced = String::with_capacity(text.len() * 2);
    let mut prev_cjk: Option<bool> = None;
    for c in text.chars() {
        if c.is_alphanumeric() || is_cjk(c) {
            let cur = is_cjk(c);
            if let Some(prev) = prev_cjk {
                if cur != prev {
                    spaced.push(' ');
                }
            }
            spaced.push(c);
            prev_cjk = Some(cur);
        } else {
            spaced.push(c);
            prev_cjk = None;
        }
    }

    // jieba handles Chinese (CJK ideographs)
    let has_chinese = spaced.chars().any(is_cjk_ideograph);
    let mut extra_tokens = Vec::new();

    if has_chinese {
        let words = jieba().cut_for_search(&spaced, false);
        for w in words {
            let trimmed = w.trim();
            if trimmed.len() > 1 && trimmed.chars().any(is_cjk) {
                extra_tokens.push(trimmed.to_string());
            }
        }
    }

    // Bigrams for kana/hangul (jieba doesn't segment these)
    let chars: Vec<char> = spaced.chars().collect();
    for i in 0..chars.len().saturating_sub(1) {
        let a = chars[i];
        let b = chars[i + 1];
        let non_ideo = |c: char| is_cjk(c) && !is_cjk_ideograph(c);
        if non_ideo(a) && non_ideo(b) {
            let mut s = String::with_capacity(8);
            s.push(a);
            s.push(b);
            extra_tokens.push(s);
        }
    }

    if extra_tokens.is_empty() {
        spaced
    } else {
        format!("{} {}", spaced, extra_tokens.join(" "))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS facts (
    id INTEGER PRIMARY KEY,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    embedding BLOB,
    UNIQUE (key, start_time)
);

CREATE INDEX IF NOT EXISTS idx_facts_key ON facts(key);
CREATE INDEX IF NOT EXISTS idx_facts_start ON facts(start_time);
CREATE INDEX IF NOT EXISTS idx_facts_active ON facts(key) WHERE end_time IS NULL;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embed_cache (
    query TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

// External-content FTS — we manage inserts/deletes ourselves so the index
// holds exactly the active set, with CJK pre-processing.
const FTS_SCHEMA: &str =
    "CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(\
     id UNINDEXED, key, value, tokenize='unicode61')";

/// SQLite-backed fact store.
pub struct FactStore {
    pool: Pool<SqliteConnectionManager>,
    /// In-memory vector index over the active set.
    vec_index: RwLock<vec::VecIndex>,
}

impl FactStore {
    fn conn(&self) -> Result<PooledConn, MnemoError> {
        self.pool
            .get()
            .map_err(|e| MnemoError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    /// Pool size defaults to 8 (1 writer + 7 readers in WAL mode).
    pub fn open(path: &str) -> Result<Self, MnemoError> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each test gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MnemoError::Internal(format!("pool: {e}")))?;

        // initialize schema on a fresh connection
        let conn = pool.get().map_err(|e| MnemoError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA auto_vacuum=INCREMENTAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(FTS_SCHEMA, [])?;
        drop(conn);

        let db = Self {
            pool,
            vec_index: RwLock::new(vec::VecIndex::new()),
        };
        db.recover()?;
        db.rebuild_fts()?;
        db.load_vec_index();
        Ok(db)
    }

    /// Crash recovery: a crash between closing the old row and inserting the
    /// new one can't happen (single transaction), but an older database or a
    /// torn write may leave a key with more than one open row. Keep the
    /// latest `start_time` active and close the rest at the survivor's start.
    fn recover(&self) -> Result<(), MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, MAX(start_time) FROM facts WHERE end_time IS NULL \
             GROUP BY key HAVING COUNT(*) > 1",
        )?;
        let broken: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        if broken.is_empty() {
            return Ok(());
        }

        for (key, survivor_start) in &broken {
            conn.execute(
                "UPDATE facts SET end_time = ?1 \
                 WHERE key = ?2 AND end_time IS NULL AND start_time < ?1",
                rusqlite::params![survivor_start, key],
            )?;
        }
        tracing::warn!(keys = broken.len(), "recovered multi-active keys");
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.conn().ok().and_then(|c| {
            c.query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
                .ok()
        })
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), MnemoError> {
        let c = self.conn()?;
        c.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Pinned embedding dimension, if any vector has been stored yet.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.get_meta("embedding_dim").and_then(|v| v.parse().ok())
    }

    /// Database file size in bytes (via SQLite pragma).
    pub fn db_size_bytes(&self) -> i64 {
        self.conn()
            .and_then(|c| {
                c.query_row(
                    "SELECT page_count * page_size FROM pragma_page_count, pragma_page_size",
                    [],
                    |r| r.get(0),
                )
                .map_err(MnemoError::from)
            })
            .unwrap_or(0)
    }

    // -- persistent query-embedding cache ------------------------------------

    pub fn embed_cache_put(&self, query: &str, embedding: &[f32]) {
        if let Ok(c) = self.conn() {
            let _ = c.execute(
                "INSERT OR REPLACE INTO embed_cache (query, embedding, created_at) \
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![query, crate::ai::embedding_to_bytes(embedding), now_ms()],
            );
        }
    }

    pub fn embed_cache_load_all(&self) -> Vec<(String, Vec<f32>)> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare("SELECT query, embedding FROM embed_cache") else {
            return vec![];
        };
        stmt.query_map([], |row| {
            let q: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((q, crate::ai::bytes_to_embedding(&blob)))
        })
        .map(|iter| iter.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    /// Structural self-check: the one-active-row and index-mirror
    /// invariants plus the lazy-embed backlog size.
    pub fn verify_integrity(&self) -> Result<IntegrityReport, MnemoError> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<usize, MnemoError> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(n as usize)
        };
        let total_rows = count("SELECT COUNT(*) FROM facts")?;
        let active_rows = count("SELECT COUNT(*) FROM facts WHERE end_time IS NULL")?;
        let fts_indexed = count("SELECT COUNT(*) FROM facts_fts")?;
        let orphan_fts = count(
            "SELECT COUNT(*) FROM facts_fts WHERE id NOT IN \
             (SELECT id FROM facts WHERE end_time IS NULL)",
        )?;
        let missing_fts = count(
            "SELECT COUNT(*) FROM facts WHERE end_time IS NULL AND id NOT IN \
             (SELECT id FROM facts_fts)",
        )?;
        let missing_embedding = count(
            "SELECT COUNT(*) FROM facts WHERE end_time IS NULL AND embedding IS NULL",
        )?;
        let multi_active_keys = count(
            "SELECT COUNT(*) FROM (SELECT key FROM facts WHERE end_time IS NULL \
             GROUP BY key HAVING COUNT(*) > 1)",
        )?;

        // missing_embedding is allowed to lag (lazy embed), the rest are hard
        let ok = orphan_fts == 0 && missing_fts == 0 && multi_active_keys == 0;
        Ok(IntegrityReport {
            total_rows,
            active_rows,
            fts_indexed,
            orphan_fts,
            missing_fts,
            missing_embedding,
            multi_active_keys,
            ok,
        })
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let blob: Option<Vec<u8>> = row.get(6)?;
    Ok(Fact {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        source: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        embedding: blob.map(|b| crate::ai::bytes_to_embedding(&b)),
    })
}

const FACT_COLS: &str = "id, key, value, source, start_time, end_time, embedding";

#[cfg(test)]
mod meta_tests {
    use super::*;

    fn test_db() -> FactStore {
        FactStore::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn meta_roundtrip() {
        let db = test_db();
        assert!(db.get_meta("embedding_dim").is_none());
        db.set_meta("embedding_dim", "768").unwrap();
        assert_eq!(db.get_meta("embedding_dim").as_deref(), Some("768"));
        assert_eq!(db.embedding_dim(), Some(768));
    }

    #[test]
    fn embed_cache_roundtrip() {
        let db = test_db();
        db.embed_cache_put("code editor", &[0.5, -0.25]);
        let all = db.embed_cache_load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "code editor");
        assert_eq!(all[0].1, vec![0.5, -0.25]);
    }

    #[test]
    fn integrity_on_empty_store() {
        let db = test_db();
        let report = db.verify_integrity().unwrap();
        assert!(report.ok);
        assert_eq!(report.total_rows, 0);
    }
}
