//! FTS5 maintenance and BM25 search. The index mirrors the active set:
//! supersession and deletion remove rows, `rebuild_fts` restores the mirror.

use rusqlite::params;

use super::*;

impl FactStore {
    /// Rebuild the FTS index from the active set when it has drifted
    /// (crash between transactions, or a database produced by an older
    /// build). Idempotent, runs on startup.
    pub(super) fn rebuild_fts(&self) -> Result<(), MnemoError> {
        let conn = self.conn()?;
        let drift: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM facts_fts WHERE id NOT IN \
                     (SELECT id FROM facts WHERE end_time IS NULL)) \
                  + (SELECT COUNT(*) FROM facts WHERE end_time IS NULL AND id NOT IN \
                     (SELECT id FROM facts_fts))",
            [],
            |r| r.get(0),
        )?;
        if drift == 0 {
            return Ok(());
        }
        drop(conn);
        let (orphans, rebuilt) = self.repair_fts()?;
        tracing::info!(orphans, rebuilt, "reconciled FTS index with active set");
        Ok(())
    }

    /// Remove orphaned FTS rows and insert missing active rows.
    /// Returns (orphans_removed, missing_rebuilt).
    pub fn repair_fts(&self) -> Result<(usize, usize), MnemoError> {
        let conn = self.conn()?;

        let orphans = conn.execute(
            "DELETE FROM facts_fts WHERE id NOT IN \
             (SELECT id FROM facts WHERE end_time IS NULL)",
            [],
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, key, value FROM facts \
             WHERE end_time IS NULL AND id NOT IN (SELECT id FROM facts_fts)",
        )?;
        let missing: Vec<(i64, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let rebuilt = missing.len();
        for (id, key, value) in &missing {
            conn.execute(
                "INSERT INTO facts_fts (id, key, value) VALUES (?1, ?2, ?3)",
                params![id, key, append_segmented(value)],
            )?;
        }

        Ok((orphans, rebuilt))
    }

    /// Full-text search over the active set. Returns `(id, bm25_score)`
    /// pairs, best first. Query tokens are individually quoted so FTS5
    /// operator characters (`-`, `:`, `*`, `"`) can't break the MATCH.
    pub fn search_fts(&self, query: &str, limit: usize) -> Vec<(i64, f64)> {
        let processed = append_segmented(query.trim());
        let tokens: Vec<String> = processed
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || is_cjk(c)))
            .filter(|t| !t.is_empty())
            .map(|t| format!("\"{t}\""))
            .collect();
        if tokens.is_empty() {
            return vec![];
        }
        let fts_query = tokens.join(" OR ");

        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, rank FROM facts_fts \
             WHERE facts_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        ) else {
            return vec![];
        };

        stmt.query_map(params![fts_query, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })
        // FTS5 rank is negative-better; flip to positive-better
        .map(|iter| iter.filter_map(|r| r.ok()).map(|(id, rank)| (id, -rank)).collect())
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> FactStore {
        FactStore::open(":memory:").expect("in-memory db")
    }

    #[test]
    fn fts_search_finds_value_text() {
        let db = test_db();
        db.upsert(&FactInput::new("user.editor.primary", "vscode with vim keybindings", 1_000))
            .unwrap();
        let results = db.search_fts("vim keybindings", 10);
        assert!(!results.is_empty());
    }

    #[test]
    fn fts_search_finds_key_text() {
        let db = test_db();
        db.upsert(&FactInput::new("auth.gog_keyring_password", "<redacted>", 1_000)).unwrap();
        let results = db.search_fts("gog_keyring_password", 10);
        assert!(!results.is_empty());
    }

    #[test]
    fn fts_operator_characters_are_neutralized() {
        let db = test_db();
        db.upsert(&FactInput::new("project.build", "cargo build --release", 1_000)).unwrap();
        // would be an FTS5 syntax error without token quoting
        let results = db.search_fts("build --release \"quoted", 10);
        assert!(!results.is_empty());
    }

    #[test]
    fn superseded_rows_leave_the_index() {
        let db = test_db();
        db.upsert(&FactInput::new("user.city", "Taipei", 1_000)).unwrap();
        db.upsert(&FactInput::new("user.city", "Hsinchu", 2_000)).unwrap();

        let hits = db.search_fts("Taipei", 10);
        assert!(hits.is_empty(), "superseded value must not be searchable");
        assert!(!db.search_fts("Hsinchu", 10).is_empty());
    }

    #[test]
    fn fts_cjk_segmentation() {
        let db = test_db();
        db.upsert(&FactInput::new("user.city", "我现在住在台北市区", 1_000)).unwrap();
        assert!(!db.search_fts("台北", 10).is_empty(), "台北 should match");
    }

    #[test]
    fn repair_restores_missing_rows() {
        let db = test_db();
        db.upsert(&FactInput::new("user.city", "Taipei", 1_000)).unwrap();
        // simulate drift
        db.conn().unwrap().execute("DELETE FROM facts_fts", []).unwrap();
        assert!(db.search_fts("Taipei", 10).is_empty());

        let (orphans, rebuilt) = db.repair_fts().unwrap();
        assert_eq!(orphans, 0);
        assert_eq!(rebuilt, 1);
        assert!(!db.search_fts("Taipei", 10).is_empty());
    }
}
