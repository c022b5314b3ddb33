//! Hybrid retrieval: BM25 + cosine similarity with weighted fusion, plus the
//! verdict filters applied to every read path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;
use crate::error::MnemoError;
use crate::store::{now_ms, Fact, FactStore};

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub prefix: Option<String>,
    pub keys: Option<Vec<String>>,
    pub text: Option<String>,
    pub semantic: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(flatten)]
    pub filters: VerdictFilters,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            prefix: None,
            keys: None,
            text: None,
            semantic: None,
            limit: default_limit(),
            filters: VerdictFilters::default(),
        }
    }
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictFilters {
    /// Exclude `inferred.*` keys.
    #[serde(default)]
    pub source_verified: bool,
    /// Require the key to contain this substring.
    #[serde(default)]
    pub subject: Option<String>,
    /// Require the fact to be at most this many days old.
    #[serde(default)]
    pub max_age_days: Option<i64>,
    /// Restrict to the key prefixes mapped from this type tag.
    #[serde(default)]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub start_time: i64,
    pub source: String,
}

impl SearchHit {
    fn from_fact(fact: Fact, score: Option<f64>) -> Self {
        Self {
            key: fact.key,
            value: fact.value,
            score,
            start_time: fact.start_time,
            source: fact.source,
        }
    }
}

impl VerdictFilters {
    pub fn matches(&self, cfg: &Config, fact: &Fact) -> bool {
        if self.source_verified && fact.key.starts_with("inferred.") {
            return false;
        }
        if let Some(ref subject) = self.subject {
            if !fact.key.contains(subject.as_str()) {
                return false;
            }
        }
        if let Some(days) = self.max_age_days {
            if now_ms() - fact.start_time > days * 86_400_000 {
                return false;
            }
        }
        if let Some(ref tag) = self.r#type {
            if let Some(prefixes) = cfg.prefixes_for_type(tag) {
                let hit = prefixes.iter().any(|p| {
                    fact.key == *p || fact.key.starts_with(&format!("{p}."))
                });
                if !hit {
                    return false;
                }
            }
        }
        true
    }
}

/// Run a search. `query_emb` is the embedding of `semantic`, when the caller
/// could produce one; without it a semantic query degrades to keyword search
/// rather than failing.
pub fn search(
    store: &FactStore,
    cfg: &Config,
    q: &SearchQuery,
    query_emb: Option<&[f32]>,
) -> Result<Vec<SearchHit>, MnemoError> {
    let limit = q.limit.clamp(1, 200);

    if let (Some(_), Some(emb)) = (q.semantic.as_ref(), query_emb) {
        let text = q.semantic.as_deref().unwrap_or_default();
        return Ok(fused_search(store, cfg, q, text, emb, limit));
    }

    if let Some(text) = q.semantic.as_deref().or(q.text.as_deref()) {
        let raw = store.search_fts(text, limit * 2);
        let max_bm25 = raw.iter().map(|r| r.1).fold(0.001_f64, f64::max);
        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .filter_map(|(id, bm25)| store.get(id).ok().flatten().map(|f| (f, bm25)))
            .filter(|(f, _)| q.filters.matches(cfg, f))
            .map(|(f, bm25)| SearchHit::from_fact(f, Some(bm25 / max_bm25)))
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        return Ok(hits);
    }

    if let Some(ref keys) = q.keys {
        let mut hits = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(fact) = store.active(key)? {
                if q.filters.matches(cfg, &fact) {
                    hits.push(SearchHit::from_fact(fact, None));
                }
            }
        }
        hits.truncate(limit);
        return Ok(hits);
    }

    if let Some(ref prefix) = q.prefix {
        let mut hits: Vec<SearchHit> = store
            .active_prefix(prefix)?
            .into_iter()
            .filter(|f| q.filters.matches(cfg, f))
            .map(|f| SearchHit::from_fact(f, None))
            .collect();
        hits.truncate(limit);
        return Ok(hits);
    }

    // No query at all: most recent active rows.
    let hits = store
        .recent_active(limit * 2)?
        .into_iter()
        .filter(|f| q.filters.matches(cfg, f))
        .take(limit)
        .map(|f| SearchHit::from_fact(f, None))
        .collect();
    Ok(hits)
}

/// Weighted BM25 + vector fusion:
/// `score = vector_weight·vector + bm25_weight·bm25`, plus
/// `bm25_bonus·vector` when both methods returned the row.
fn fused_search(
    store: &FactStore,
    cfg: &Config,
    q: &SearchQuery,
    text: &str,
    query_emb: &[f32],
    limit: usize,
) -> Vec<SearchHit> {
    let sc = &cfg.search;

    let vector_hits = store.search_semantic(query_emb, sc.vector_threshold, limit * 2);

    let bm25_raw = store.search_fts(text, limit * 2);
    let max_bm25 = bm25_raw.iter().map(|r| r.1).fold(0.001_f64, f64::max);

    struct Partial {
        vector: Option<f64>,
        bm25: Option<f64>,
    }
    let mut merged: HashMap<i64, Partial> = HashMap::new();
    for (id, sim) in vector_hits {
        merged.insert(id, Partial { vector: Some(sim), bm25: None });
    }
    for (id, bm25) in bm25_raw {
        let norm = bm25 / max_bm25;
        merged
            .entry(id)
            .and_modify(|p| p.bm25 = Some(norm))
            .or_insert(Partial { vector: None, bm25: Some(norm) });
    }

    let mut hits: Vec<SearchHit> = merged
        .into_iter()
        .filter_map(|(id, p)| store.get(id).ok().flatten().map(|f| (f, p)))
        .filter(|(f, _)| q.filters.matches(cfg, f))
        .map(|(f, p)| {
            let v = p.vector.unwrap_or(0.0);
            let b = p.bm25.unwrap_or(0.0);
            let mut score = sc.vector_weight * v + sc.bm25_weight * b;
            if p.vector.is_some() && p.bm25.is_some() && v >= sc.vector_threshold {
                score += sc.bm25_bonus * v;
            }
            SearchHit::from_fact(f, Some(score))
        })
        .collect();

    sort_hits(&mut hits);
    hits.truncate(limit);
    hits
}

/// Descending score; ties go to the more recent `start_time`.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.start_time.cmp(&a.start_time))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FactInput;

    fn seeded() -> (FactStore, Config) {
        let db = FactStore::open(":memory:").unwrap();
        let cfg = Config::default();
        db.upsert(&FactInput::new("user.editor.primary", "vscode", 1_000)).unwrap();
        db.upsert(&FactInput::new("auth.gog_keyring_password", "<redacted>", 2_000)).unwrap();
        db.upsert(&FactInput::new("inferred.user.mood", "curious", 3_000)).unwrap();
        (db, cfg)
    }

    fn emb(db: &FactStore, key: &str, v: &[f32]) {
        let id = db.active(key).unwrap().unwrap().id;
        db.set_embedding(id, v).unwrap();
    }

    #[test]
    fn text_search_finds_exact_key_token() {
        let (db, cfg) = seeded();
        let q = SearchQuery {
            text: Some("GOG_KEYRING_PASSWORD".into()),
            ..Default::default()
        };
        let hits = search(&db, &cfg, &q, None).unwrap();
        assert_eq!(hits[0].key, "auth.gog_keyring_password");
    }

    #[test]
    fn semantic_fusion_prefers_vector_match() {
        let (db, cfg) = seeded();
        emb(&db, "user.editor.primary", &[1.0, 0.0, 0.0]);
        emb(&db, "auth.gog_keyring_password", &[0.0, 1.0, 0.0]);
        emb(&db, "inferred.user.mood", &[0.0, 0.0, 1.0]);

        let q = SearchQuery {
            semantic: Some("code editor".into()),
            ..Default::default()
        };
        // query vector close to the editor fact, unrelated to the others
        let hits = search(&db, &cfg, &q, Some(&[0.95, 0.05, 0.0])).unwrap();
        assert_eq!(hits[0].key, "user.editor.primary");
        // below the 0.3 vector threshold and no keyword hit → absent
        assert!(hits.iter().all(|h| h.key != "auth.gog_keyring_password"));
    }

    #[test]
    fn source_verified_excludes_inferred() {
        let (db, cfg) = seeded();
        let q = SearchQuery {
            prefix: Some("inferred.".into()),
            filters: VerdictFilters { source_verified: true, ..Default::default() },
            ..Default::default()
        };
        assert!(search(&db, &cfg, &q, None).unwrap().is_empty());
    }

    #[test]
    fn subject_filter_requires_substring() {
        let (db, cfg) = seeded();
        let q = SearchQuery {
            filters: VerdictFilters { subject: Some("editor".into()), ..Default::default() },
            ..Default::default()
        };
        let hits = search(&db, &cfg, &q, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "user.editor.primary");
    }

    #[test]
    fn type_filter_uses_mappings() {
        let (db, cfg) = seeded();
        let q = SearchQuery {
            filters: VerdictFilters { r#type: Some("inferred".into()), ..Default::default() },
            ..Default::default()
        };
        let hits = search(&db, &cfg, &q, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].key.starts_with("inferred."));
    }

    #[test]
    fn no_query_returns_most_recent() {
        let (db, cfg) = seeded();
        let hits = search(&db, &cfg, &SearchQuery::default(), None).unwrap();
        assert_eq!(hits[0].key, "inferred.user.mood");
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn max_age_filter() {
        let (db, cfg) = seeded();
        db.upsert(&FactInput::new("user.city", "Taipei", now_ms())).unwrap();
        let q = SearchQuery {
            filters: VerdictFilters { max_age_days: Some(1), ..Default::default() },
            ..Default::default()
        };
        let hits = search(&db, &cfg, &q, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "user.city");
    }
}
