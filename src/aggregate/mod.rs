//! Aggregator: derived artifacts over the active fact set — digest JSON,
//! daily markdown logs, weekly snapshots, and rolling topic files. All
//! output is regenerable; nothing here is read back by the pipeline.

mod daily;
mod digest;
mod topics;

pub use digest::{Digest, DigestCategory};

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::{Config, Paths};
use crate::error::MnemoError;
use crate::keys::{category_of, subcategory_of};
use crate::store::{Fact, FactStore};

pub struct Aggregator<'a> {
    pub store: &'a FactStore,
    pub cfg: &'a Config,
    pub paths: &'a Paths,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a FactStore, cfg: &'a Config, paths: &'a Paths) -> Self {
        Self { store, cfg, paths }
    }

    /// Regenerate everything a pipeline run touches: the digest, the daily
    /// log for each given date, this week's snapshot, and the rolling topic
    /// files.
    pub fn run(&self, dates: &[NaiveDate]) -> Result<(), MnemoError> {
        self.paths
            .ensure_dirs()
            .map_err(|e| MnemoError::Internal(format!("aggregate dirs: {e}")))?;
        self.write_digest()?;
        for date in dates {
            self.write_daily(*date)?;
        }
        if let Some(date) = dates.iter().max() {
            self.write_weekly(*date)?;
        }
        self.write_topics()?;
        Ok(())
    }
}

/// Group facts by top-level category, then by second key segment.
/// BTreeMaps keep the output deterministic.
pub(crate) fn group_by_category(
    facts: &[Fact],
) -> BTreeMap<String, BTreeMap<String, Vec<&Fact>>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<&Fact>>> = BTreeMap::new();
    for fact in facts {
        let category = category_of(&fact.key).to_string();
        let sub = subcategory_of(&fact.key).unwrap_or("_").to_string();
        grouped.entry(category).or_default().entry(sub).or_default().push(fact);
    }
    grouped
}

/// Render a value for markdown: short plain values inline, long or
/// JSON-shaped values as fenced blocks.
pub(crate) fn render_value(value: &str) -> String {
    let looks_structured = value.starts_with('{') || value.starts_with('[');
    if !looks_structured && value.chars().count() <= 80 && !value.contains('\n') {
        format!("`{value}`")
    } else {
        format!("\n```\n{value}\n```")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(key: &str, value: &str, at: i64) -> Fact {
        Fact {
            id: 0,
            key: key.into(),
            value: value.into(),
            source: "session:test".into(),
            start_time: at,
            end_time: None,
            embedding: None,
        }
    }

    #[test]
    fn grouping_is_two_level() {
        let facts = vec![
            fact("user.city", "Taipei", 0),
            fact("user.editor.primary", "vscode", 0),
            fact("agent.case.test_failure.a1", "{}", 0),
        ];
        let grouped = group_by_category(&facts);
        assert_eq!(grouped.len(), 2);
        assert!(grouped["user"].contains_key("city"));
        assert!(grouped["user"].contains_key("editor"));
        assert!(grouped["agent"].contains_key("case"));
    }

    #[test]
    fn values_render_inline_or_fenced() {
        assert_eq!(render_value("Taipei"), "`Taipei`");
        assert!(render_value(r#"{"problem":"x"}"#).starts_with("\n```"));
        assert!(render_value(&"y".repeat(200)).starts_with("\n```"));
    }
}
