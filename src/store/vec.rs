//! Vector index and semantic search.
//!
//! Embeddings are lazily populated after commit; the in-memory index holds
//! vectors for active rows only. Brute-force cosine is fine to ~100k facts;
//! above that an ANN structure can replace `VecIndex` without changing
//! callers.

use rusqlite::params;
use std::collections::HashMap;

use super::*;

pub(super) struct VecIndex {
    map: HashMap<i64, Vec<f32>>,
}

impl VecIndex {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn insert(&mut self, id: i64, emb: Vec<f32>) {
        self.map.insert(id, emb);
    }

    pub fn remove(&mut self, id: i64) {
        self.map.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i64, &Vec<f32>)> {
        self.map.iter()
    }
}

impl FactStore {
    /// Load embeddings of active rows into the in-memory vector index.
    pub(super) fn load_vec_index(&self) {
        let Ok(conn) = self.conn() else { return };
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, embedding FROM facts \
             WHERE end_time IS NULL AND embedding IS NOT NULL",
        ) else {
            return;
        };

        let pairs: Vec<(i64, Vec<f32>)> = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, crate::ai::bytes_to_embedding(&blob)))
            })
            .map(|iter| iter.filter_map(|r| r.ok()).collect())
            .unwrap_or_default();

        if let Ok(mut idx) = self.vec_index.write() {
            idx.clear();
            let count = pairs.len();
            for (id, emb) in pairs {
                idx.insert(id, emb);
            }
            tracing::debug!(count, "loaded vector index");
        }
    }

    pub(super) fn vec_index_put(&self, id: i64, emb: Vec<f32>) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.insert(id, emb);
        }
    }

    pub(super) fn vec_index_remove(&self, id: i64) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.remove(id);
        }
    }

    /// Attach an embedding to a row. Only permitted while the row is active;
    /// the first stored vector pins the dimension in `meta`, later writes
    /// with a different dimension are rejected.
    pub fn set_embedding(&self, id: i64, embedding: &[f32]) -> Result<(), MnemoError> {
        if embedding.is_empty() {
            return Err(MnemoError::Validation("empty embedding".into()));
        }
        match self.embedding_dim() {
            Some(dim) if dim != embedding.len() => {
                return Err(MnemoError::DimensionMismatch {
                    expected: dim,
                    got: embedding.len(),
                });
            }
            Some(_) => {}
            None => self.set_meta("embedding_dim", &embedding.len().to_string())?,
        }

        let bytes = crate::ai::embedding_to_bytes(embedding);
        let changed = self.conn()?.execute(
            "UPDATE facts SET embedding = ?1 WHERE id = ?2 AND end_time IS NULL",
            params![bytes, id],
        )?;
        if changed == 0 {
            return Err(MnemoError::NotFound);
        }
        self.vec_index_put(id, embedding.to_vec());
        Ok(())
    }

    /// Semantic search over the active set: `(id, cosine)` pairs at or above
    /// `threshold`, best first.
    pub fn search_semantic(
        &self,
        query_emb: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Vec<(i64, f64)> {
        if let Ok(idx) = self.vec_index.read() {
            if !idx.is_empty() {
                let mut scored: Vec<(i64, f64)> = idx
                    .iter()
                    .map(|(id, emb)| (*id, crate::ai::cosine_similarity(query_emb, emb)))
                    .filter(|(_, sim)| *sim >= threshold)
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(limit);
                return scored;
            }
        }
        vec![]
    }

    /// Active rows with no embedding yet — the lazy-embed backlog.
    pub fn missing_embeddings(&self, limit: usize) -> Vec<(i64, String)> {
        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, key || ': ' || value FROM facts \
             WHERE end_time IS NULL AND embedding IS NULL LIMIT ?1",
        ) else {
            return vec![];
        };
        stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> FactStore {
        FactStore::open(":memory:").expect("in-memory db")
    }

    fn insert(db: &FactStore, key: &str, value: &str, at: i64) -> i64 {
        db.upsert(&FactInput::new(key, value, at)).unwrap();
        db.active(key).unwrap().unwrap().id
    }

    #[test]
    fn set_embedding_and_search() {
        let db = test_db();
        let a = insert(&db, "user.editor.primary", "vscode", 1_000);
        let b = insert(&db, "user.city", "Taipei", 1_000);
        db.set_embedding(a, &[1.0, 0.0, 0.0]).unwrap();
        db.set_embedding(b, &[0.0, 1.0, 0.0]).unwrap();

        let hits = db.search_semantic(&[0.9, 0.1, 0.0], 0.3, 10);
        assert_eq!(hits[0].0, a);
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn dimension_is_pinned() {
        let db = test_db();
        let a = insert(&db, "user.city", "Taipei", 1_000);
        let b = insert(&db, "user.name", "Alice", 1_000);
        db.set_embedding(a, &[0.1, 0.2, 0.3]).unwrap();
        let err = db.set_embedding(b, &[0.1, 0.2]).unwrap_err();
        assert!(matches!(err, MnemoError::DimensionMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn embedding_rejected_for_closed_rows() {
        let db = test_db();
        let old = insert(&db, "user.city", "Taipei", 1_000);
        db.upsert(&FactInput::new("user.city", "Hsinchu", 2_000)).unwrap();
        assert!(matches!(
            db.set_embedding(old, &[0.1, 0.2]),
            Err(MnemoError::NotFound)
        ));
    }

    #[test]
    fn supersession_removes_vector() {
        let db = test_db();
        let a = insert(&db, "user.city", "Taipei", 1_000);
        db.set_embedding(a, &[1.0, 0.0]).unwrap();
        db.upsert(&FactInput::new("user.city", "Hsinchu", 2_000)).unwrap();

        let hits = db.search_semantic(&[1.0, 0.0], 0.0, 10);
        assert!(hits.iter().all(|(id, _)| *id != a));
    }

    #[test]
    fn missing_embeddings_backlog() {
        let db = test_db();
        let a = insert(&db, "user.city", "Taipei", 1_000);
        insert(&db, "user.name", "Alice", 1_000);
        db.set_embedding(a, &[1.0, 0.0]).unwrap();

        let missing = db.missing_embeddings(10);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].1, "user.name: Alice");
    }
}
