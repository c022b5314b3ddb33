//! Daily logs and weekly snapshots, rendered as markdown.

use chrono::{Datelike, NaiveDate};
use std::path::PathBuf;

use crate::error::MnemoError;
use crate::store::Fact;

use super::{group_by_category, render_value, Aggregator};

fn day_range_ms(date: NaiveDate) -> (i64, i64) {
    let start = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc().timestamp_millis();
    (start, start + 86_400_000)
}

fn render_markdown(title: &str, facts: &[Fact]) -> String {
    let mut out = format!("# {title}\n");
    let grouped = group_by_category(facts);
    for (category, subs) in &grouped {
        out.push_str(&format!("\n## {category}\n"));
        for (sub, group) in subs {
            if *sub != "_" {
                out.push_str(&format!("\n### {sub}\n"));
            }
            for fact in group {
                out.push_str(&format!("- **{}**: {}\n", fact.key, render_value(&fact.value)));
            }
        }
    }
    out
}

impl Aggregator<'_> {
    /// Write the daily log for a date: every active row whose `start_time`
    /// falls on it. Returns the file path, or None when the day was empty.
    pub fn write_daily(&self, date: NaiveDate) -> Result<Option<PathBuf>, MnemoError> {
        let (from, to) = day_range_ms(date);
        let facts = self.store.active_in_range(from, to)?;
        if facts.is_empty() {
            return Ok(None);
        }
        let md = render_markdown(&date.format("%Y-%m-%d").to_string(), &facts);
        let path = self.paths.daily_dir().join(format!("{}.md", date.format("%Y-%m-%d")));
        std::fs::write(&path, md)
            .map_err(|e| MnemoError::Internal(format!("write daily log: {e}")))?;
        Ok(Some(path))
    }

    /// Write the snapshot for the ISO week containing `date`: one file per
    /// category plus an index. Returns the written paths.
    pub fn write_weekly(&self, date: NaiveDate) -> Result<Vec<PathBuf>, MnemoError> {
        let week = date.iso_week();
        let monday = NaiveDate::from_isoywd_opt(week.year(), week.week(), chrono::Weekday::Mon)
            .ok_or_else(|| MnemoError::Internal("iso week out of range".into()))?;
        let (from, _) = day_range_ms(monday);
        let to = from + 7 * 86_400_000;

        let facts = self.store.active_in_range(from, to)?;
        let week_tag = format!("{}-W{:02}", week.year(), week.week());
        let dir = self.paths.topics_dir().join(&week_tag);
        std::fs::create_dir_all(&dir)
            .map_err(|e| MnemoError::Internal(format!("weekly dir: {e}")))?;

        let mut written = Vec::new();
        let grouped = group_by_category(&facts);
        let mut index = format!("# Week {week_tag}\n\n");
        for (category, subs) in &grouped {
            let count: usize = subs.values().map(Vec::len).sum();
            let cat_facts: Vec<Fact> = subs
                .values()
                .flatten()
                .map(|f| (*f).clone())
                .collect();
            let md = render_markdown(&format!("{category} — {week_tag}"), &cat_facts);
            let path = dir.join(format!("{category}.md"));
            std::fs::write(&path, md)
                .map_err(|e| MnemoError::Internal(format!("write weekly file: {e}")))?;
            index.push_str(&format!("- [{category}]({category}.md) — {count}\n"));
            written.push(path);
        }
        let index_path = dir.join("index.md");
        std::fs::write(&index_path, index)
            .map_err(|e| MnemoError::Internal(format!("write weekly index: {e}")))?;
        written.push(index_path);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Paths};
    use crate::store::{FactInput, FactStore};

    // 2026-01-01 (Thursday) 10:00 UTC
    const JAN1: i64 = 1_767_261_600_000;

    fn setup() -> (FactStore, Config, tempfile::TempDir) {
        let db = FactStore::open(":memory:").unwrap();
        db.upsert(&FactInput::new("user.city", "Taipei", JAN1)).unwrap();
        db.upsert(&FactInput::new("user.editor.primary", "vscode", JAN1 + 60_000)).unwrap();
        db.upsert(&FactInput::new("project.lang", "Rust", JAN1 + 10 * 86_400_000)).unwrap();
        (db, Config::default(), tempfile::tempdir().unwrap())
    }

    #[test]
    fn daily_log_filters_by_date() {
        let (db, cfg, dir) = setup();
        let paths = Paths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let agg = Aggregator::new(&db, &cfg, &paths);

        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let path = agg.write_daily(date).unwrap().unwrap();
        let md = std::fs::read_to_string(path).unwrap();
        assert!(md.contains("# 2026-01-01"));
        assert!(md.contains("user.city"));
        assert!(md.contains("`Taipei`"));
        assert!(!md.contains("project.lang"), "other days stay out");

        let empty = agg.write_daily(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn weekly_snapshot_writes_per_category_plus_index() {
        let (db, cfg, dir) = setup();
        let paths = Paths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let agg = Aggregator::new(&db, &cfg, &paths);

        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let written = agg.write_weekly(date).unwrap();
        // user.md + index.md (project fact is in a later week)
        assert_eq!(written.len(), 2);
        let index = std::fs::read_to_string(written.last().unwrap()).unwrap();
        assert!(index.contains("[user](user.md) — 2"));
    }
}
