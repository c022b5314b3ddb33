//! Rolling topic files: one markdown file per category over the whole
//! active set, with history timelines for keys that changed over time,
//! plus an index ordered by count.

use std::path::PathBuf;

use crate::error::MnemoError;
use crate::util::truncate_chars;

use super::{group_by_category, render_value, Aggregator};

/// Timeline tables show at most this many historical rows. A display
/// default, not an invariant.
const TIMELINE_ROWS: usize = 5;

impl Aggregator<'_> {
    /// Regenerate every rolling topic file and the index. Returns written
    /// paths (index last).
    pub fn write_topics(&self) -> Result<Vec<PathBuf>, MnemoError> {
        let active = self.store.active_all()?;
        let grouped = group_by_category(&active);

        let mut written = Vec::new();
        let mut index_entries: Vec<(String, usize)> = Vec::new();

        for (category, subs) in &grouped {
            let count: usize = subs.values().map(Vec::len).sum();
            let mut md = format!("# {category}\n");
            for (sub, group) in subs {
                if *sub != "_" {
                    md.push_str(&format!("\n## {sub}\n"));
                }
                for fact in group {
                    md.push_str(&format!(
                        "\n### {}\n\n{}\n",
                        fact.key,
                        render_value(&fact.value)
                    ));
                    let history = self.store.history(&fact.key)?;
                    if history.len() > 1 {
                        md.push_str(&timeline_table(&history));
                    }
                }
            }
            let path = self.paths.topics_dir().join(format!("{category}.md"));
            std::fs::write(&path, md)
                .map_err(|e| MnemoError::Internal(format!("write topic file: {e}")))?;
            written.push(path);
            index_entries.push((category.clone(), count));
        }

        index_entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut index = String::from("# Topics\n\n");
        for (category, count) in &index_entries {
            index.push_str(&format!("- [{category}]({category}.md) — {count}\n"));
        }
        let index_path = self.paths.topics_dir().join("index.md");
        std::fs::write(&index_path, index)
            .map_err(|e| MnemoError::Internal(format!("write topics index: {e}")))?;
        written.push(index_path);
        Ok(written)
    }
}

fn timeline_table(history: &[crate::store::Fact]) -> String {
    let mut out = String::from("\n| since | value |\n|---|---|\n");
    // newest rows first, truncated
    for fact in history.iter().rev().take(TIMELINE_ROWS) {
        let since = chrono::DateTime::from_timestamp_millis(fact.start_time)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let value = truncate_chars(&fact.value.replace('\n', " "), 60).replace('|', "\\|");
        out.push_str(&format!("| {since} | {value} |\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Paths};
    use crate::store::{FactInput, FactStore};

    const JAN1: i64 = 1_767_261_600_000;

    #[test]
    fn topics_files_and_index() {
        let db = FactStore::open(":memory:").unwrap();
        db.upsert(&FactInput::new("user.city", "Taipei", JAN1)).unwrap();
        db.upsert(&FactInput::new("user.city", "Hsinchu", JAN1 + 86_400_000)).unwrap();
        db.upsert(&FactInput::new("project.lang", "Rust", JAN1)).unwrap();
        db.upsert(&FactInput::new("project.build", "cargo", JAN1)).unwrap();

        let cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure_dirs().unwrap();
        let agg = Aggregator::new(&db, &cfg, &paths);

        let written = agg.write_topics().unwrap();
        // user.md, project.md, index.md
        assert_eq!(written.len(), 3);

        let user_md =
            std::fs::read_to_string(paths.topics_dir().join("user.md")).unwrap();
        assert!(user_md.contains("### user.city"));
        assert!(user_md.contains("`Hsinchu`"), "latest value shown");
        assert!(user_md.contains("| since | value |"), "timeline for changed key");
        assert!(user_md.contains("Taipei"), "history row present");

        let index =
            std::fs::read_to_string(paths.topics_dir().join("index.md")).unwrap();
        // project (2 active) sorts above user (1 active)
        let project_pos = index.find("[project]").unwrap();
        let user_pos = index.find("[user]").unwrap();
        assert!(project_pos < user_pos);
    }
}
