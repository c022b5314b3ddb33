//! Versioned fact rows: upsert-with-supersession, merges, reads, deletion.

use rusqlite::{params, OptionalExtension};

use super::*;

/// What `upsert` did with the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// Active row already holds this exact value.
    Skipped,
    /// No active row existed; a new one was inserted.
    Inserted,
    /// The previous active row was closed and a new one inserted.
    Superseded,
}

impl FactStore {
    /// Insert a fact, superseding the active value for its key if different.
    ///
    /// The whole mutation — closing the predecessor, inserting the new row,
    /// and syncing FTS — is one SQLite transaction, so a crash leaves either
    /// the old state or the new one, never a half-switch.
    pub fn upsert(&self, input: &FactInput) -> Result<UpsertOutcome, MnemoError> {
        let key = input.key.clone();
        self.upsert_under(&key, input)
    }

    /// Same as `upsert` but writes under `target_key` instead of the input's
    /// own key. Used when the semantic deduper decides `merge`.
    pub fn apply_merge(
        &self,
        target_key: &str,
        input: &FactInput,
    ) -> Result<UpsertOutcome, MnemoError> {
        self.upsert_under(target_key, input)
    }

    fn upsert_under(&self, key: &str, input: &FactInput) -> Result<UpsertOutcome, MnemoError> {
        validate_input(input)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let prev: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, value, start_time FROM facts \
                 WHERE key = ?1 AND end_time IS NULL",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        let (outcome, closed_id, start_time) = match prev {
            Some((_, ref prev_value, _)) if *prev_value == input.value => {
                return Ok(UpsertOutcome::Skipped);
            }
            Some((prev_id, _, prev_start)) => {
                // start_time per key is strictly increasing; a commit racing
                // in with an equal-or-earlier timestamp lands one tick after
                // the predecessor.
                let start = input.start_time.max(prev_start + 1);
                tx.execute(
                    "UPDATE facts SET end_time = ?1 WHERE id = ?2",
                    params![start, prev_id],
                )?;
                tx.execute("DELETE FROM facts_fts WHERE id = ?1", params![prev_id])?;
                (UpsertOutcome::Superseded, Some(prev_id), start)
            }
            None => (UpsertOutcome::Inserted, None, input.start_time),
        };

        tx.execute(
            "INSERT INTO facts (key, value, source, start_time, end_time) \
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![key, input.value, input.source, start_time],
        )?;
        let new_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO facts_fts (id, key, value) VALUES (?1, ?2, ?3)",
            params![new_id, key, append_segmented(&input.value)],
        )?;
        tx.commit()?;

        if let Some(id) = closed_id {
            self.vec_index_remove(id);
        }
        Ok(outcome)
    }

    /// The active row for a key, if any.
    pub fn active(&self, key: &str) -> Result<Option<Fact>, MnemoError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {FACT_COLS} FROM facts WHERE key = ?1 AND end_time IS NULL"),
            params![key],
            row_to_fact,
        )
        .optional()
        .map_err(MnemoError::from)
    }

    /// All active rows whose key starts with `prefix`, ordered by key.
    pub fn active_prefix(&self, prefix: &str) -> Result<Vec<Fact>, MnemoError> {
        let conn = self.conn()?;
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', r"\_"));
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts \
             WHERE key LIKE ?1 ESCAPE '\\' AND end_time IS NULL ORDER BY key"
        ))?;
        let rows = stmt
            .query_map(params![pattern], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The whole active set, ordered by key.
    pub fn active_all(&self) -> Result<Vec<Fact>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE end_time IS NULL ORDER BY key"
        ))?;
        let rows = stmt
            .query_map([], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent active rows by `start_time` — the no-query search path.
    pub fn recent_active(&self, limit: usize) -> Result<Vec<Fact>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE end_time IS NULL \
             ORDER BY start_time DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full version history for a key, oldest first.
    pub fn history(&self, key: &str) -> Result<Vec<Fact>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts WHERE key = ?1 ORDER BY start_time"
        ))?;
        let rows = stmt
            .query_map(params![key], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch one row by id.
    pub fn get(&self, id: i64) -> Result<Option<Fact>, MnemoError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {FACT_COLS} FROM facts WHERE id = ?1"),
            params![id],
            row_to_fact,
        )
        .optional()
        .map_err(MnemoError::from)
    }

    /// Close the active row for a key (history is kept).
    /// Returns false if the key has no active row.
    pub fn delete(&self, key: &str) -> Result<bool, MnemoError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let row: Option<i64> = tx
            .query_row(
                "SELECT id FROM facts WHERE key = ?1 AND end_time IS NULL",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        let Some(id) = row else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE facts SET end_time = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        tx.execute("DELETE FROM facts_fts WHERE id = ?1", params![id])?;
        tx.commit()?;
        self.vec_index_remove(id);
        Ok(true)
    }

    pub fn count_active(&self) -> Result<usize, MnemoError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE end_time IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Active-row counts per top-level category, descending.
    pub fn category_counts(&self) -> Result<Vec<(String, usize)>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT CASE WHEN instr(key, '.') > 0 \
                    THEN substr(key, 1, instr(key, '.') - 1) ELSE key END AS cat, \
                    COUNT(*) AS n \
             FROM facts WHERE end_time IS NULL \
             GROUP BY cat ORDER BY n DESC, cat",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active rows whose `start_time` falls inside `[from, to)`.
    pub fn active_in_range(&self, from: i64, to: i64) -> Result<Vec<Fact>, MnemoError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLS} FROM facts \
             WHERE end_time IS NULL AND start_time >= ?1 AND start_time < ?2 \
             ORDER BY key"
        ))?;
        let rows = stmt
            .query_map(params![from, to], row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
