//! Digest: a compact snapshot of the active set (counts + examples) used
//! for context injection at session start.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::MnemoError;
use crate::keys::category_of;
use crate::store::now_ms;
use crate::util::truncate_chars;

use super::Aggregator;

const SAMPLES_PER_CATEGORY: usize = 3;

#[derive(Debug, Serialize)]
pub struct Digest {
    pub generated_at: String,
    pub total_facts: usize,
    pub summary: String,
    pub categories: BTreeMap<String, DigestCategory>,
}

#[derive(Debug, Serialize)]
pub struct DigestCategory {
    pub count: usize,
    pub facts: BTreeMap<String, String>,
}

impl Aggregator<'_> {
    pub fn digest(&self) -> Result<Digest, MnemoError> {
        let active = self.store.active_all()?;
        let total_facts = active.len();
        let dc = &self.cfg.digest;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for fact in &active {
            *counts.entry(category_of(&fact.key).to_string()).or_default() += 1;
        }

        // Categories shown: configured ones always, the rest by count floor,
        // capped at max_categories_in_l0 (largest first).
        let mut by_count: Vec<(&String, &usize)> = counts.iter().collect();
        by_count.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let mut shown: Vec<String> = Vec::new();
        for (cat, count) in by_count {
            let pinned = dc.shown_categories.contains(cat);
            if !pinned && *count < dc.min_count_for_l0 {
                continue;
            }
            if !pinned && shown.len() >= dc.max_categories_in_l0 {
                continue;
            }
            shown.push(cat.clone());
        }

        let mut categories = BTreeMap::new();
        for cat in &shown {
            let mut facts = BTreeMap::new();
            // pinned keys first, then the most recent rows as samples
            for fact in active.iter().filter(|f| category_of(&f.key) == cat) {
                if dc.pinned_keys.contains(&fact.key) {
                    facts.insert(fact.key.clone(), truncate_chars(&fact.value, 120));
                }
            }
            let mut rest: Vec<_> = active
                .iter()
                .filter(|f| category_of(&f.key) == cat && !facts.contains_key(&f.key))
                .collect();
            rest.sort_by(|a, b| b.start_time.cmp(&a.start_time));
            for fact in rest {
                if facts.len() >= SAMPLES_PER_CATEGORY {
                    break;
                }
                facts.insert(fact.key.clone(), truncate_chars(&fact.value, 120));
            }
            categories.insert(
                cat.clone(),
                DigestCategory { count: counts[cat], facts },
            );
        }

        let summary = summary_line(total_facts, &counts);
        let generated_at = chrono::DateTime::from_timestamp_millis(now_ms())
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        Ok(Digest { generated_at, total_facts, summary, categories })
    }

    /// Write `digest.json`; returns the digest for callers that also want
    /// the in-memory form.
    pub fn write_digest(&self) -> Result<Digest, MnemoError> {
        let digest = self.digest()?;
        let json = serde_json::to_string_pretty(&digest)
            .map_err(|e| MnemoError::Internal(format!("digest json: {e}")))?;
        std::fs::write(self.paths.digest_file(), json)
            .map_err(|e| MnemoError::Internal(format!("write digest: {e}")))?;
        Ok(digest)
    }

    /// The compact one-liner served by the `summary` operation.
    pub fn summary_line(&self) -> Result<String, MnemoError> {
        let active = self.store.active_all()?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for fact in &active {
            *counts.entry(category_of(&fact.key).to_string()).or_default() += 1;
        }
        Ok(summary_line(active.len(), &counts))
    }
}

fn summary_line(total: usize, counts: &BTreeMap<String, usize>) -> String {
    let date = chrono::DateTime::from_timestamp_millis(now_ms())
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let mut top: Vec<(&String, &usize)> = counts.iter().collect();
    top.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    let cats = top
        .iter()
        .take(5)
        .map(|(c, n)| format!("{c}:{n}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{date} | {total} facts | {cats}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Paths};
    use crate::store::{FactInput, FactStore};

    fn seeded() -> FactStore {
        let db = FactStore::open(":memory:").unwrap();
        for i in 0..6 {
            db.upsert(&FactInput::new(
                format!("user.fact_{i}"),
                format!("value {i}"),
                1_000 + i,
            ))
            .unwrap();
        }
        db.upsert(&FactInput::new("project.lang", "Rust", 1_000)).unwrap();
        db
    }

    #[test]
    fn digest_applies_count_floor() {
        let db = seeded();
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let agg = Aggregator::new(&db, &cfg, &paths);

        let digest = agg.digest().unwrap();
        assert_eq!(digest.total_facts, 7);
        // user has 6 ≥ floor 5; project has 1 < 5
        assert!(digest.categories.contains_key("user"));
        assert!(!digest.categories.contains_key("project"));
        assert_eq!(digest.categories["user"].count, 6);
        assert!(digest.categories["user"].facts.len() <= 3);
    }

    #[test]
    fn shown_categories_bypass_floor() {
        let db = seeded();
        let mut cfg = Config::default();
        cfg.digest.shown_categories = vec!["project".into()];
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let agg = Aggregator::new(&db, &cfg, &paths);

        let digest = agg.digest().unwrap();
        assert!(digest.categories.contains_key("project"));
    }

    #[test]
    fn summary_line_shape() {
        let db = seeded();
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let agg = Aggregator::new(&db, &cfg, &paths);

        let line = agg.summary_line().unwrap();
        assert!(line.contains("7 facts"));
        assert!(line.contains("user:6"));
    }

    #[test]
    fn digest_file_written() {
        let db = seeded();
        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let agg = Aggregator::new(&db, &cfg, &paths);

        agg.write_digest().unwrap();
        let raw = std::fs::read_to_string(paths.digest_file()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["total_facts"], 7);
    }
}
