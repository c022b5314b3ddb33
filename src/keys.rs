//! Dotted-key grammar: `<category>(.<segment>)+`, lowercase, singular
//! category prefix. The category set is configuration, seeded with the
//! defaults below; plural forms are aliased to singular at ingest.

use std::collections::{HashMap, HashSet};

use crate::error::MnemoError;

/// Default category set. Extractor prompts enumerate the same list, so a
/// deployment that narrows or extends the set only touches configuration.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "user",
    "project",
    "task",
    "system",
    "config",
    "preference",
    "location",
    "tool",
    "agent",
    "workflow",
    "team",
    "environment",
    "model",
    "auth",
    "channel",
    "gateway",
    "plugin",
    "binding",
    "command",
    "meta",
    "error",
    "correction",
    "event",
    "entity",
    "inferred",
];

/// Compiled key rules: category set plus plural→singular aliases.
#[derive(Debug, Clone)]
pub struct KeyRules {
    categories: HashSet<String>,
    aliases: HashMap<String, String>,
}

impl Default for KeyRules {
    fn default() -> Self {
        Self::new(
            DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )
    }
}

impl KeyRules {
    pub fn new(categories: Vec<String>, mut aliases: HashMap<String, String>) -> Self {
        let categories: HashSet<String> =
            categories.into_iter().map(|c| c.to_lowercase()).collect();
        // Naive English plurals of every known category alias back to it.
        for cat in &categories {
            aliases.entry(format!("{cat}s")).or_insert_with(|| cat.clone());
            if cat.ends_with('y') {
                let stem = &cat[..cat.len() - 1];
                aliases.entry(format!("{stem}ies")).or_insert_with(|| cat.clone());
            }
        }
        Self { categories, aliases }
    }

    pub fn categories(&self) -> &HashSet<String> {
        &self.categories
    }

    /// Normalize a raw key: lowercase, `/`→`.`, collapse empty segments,
    /// alias the category to its singular form. Errors on grammar or
    /// category violations; callers in the pipeline drop the fact with a
    /// warning, callers at the API surface report 400.
    pub fn normalize(&self, raw: &str) -> Result<String, MnemoError> {
        let cleaned = raw.trim().to_lowercase().replace('/', ".");
        if cleaned.is_empty() {
            return Err(MnemoError::EmptyKey);
        }

        let segments: Vec<&str> = cleaned
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() < 2 {
            return Err(MnemoError::InvalidKey(raw.to_string()));
        }
        for seg in &segments {
            if !seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(MnemoError::InvalidKey(raw.to_string()));
            }
        }

        let category = self
            .aliases
            .get(segments[0])
            .map(String::as_str)
            .unwrap_or(segments[0]);
        if !self.categories.contains(category) {
            return Err(MnemoError::UnknownCategory(segments[0].to_string()));
        }

        let mut out = String::with_capacity(cleaned.len());
        out.push_str(category);
        for seg in &segments[1..] {
            out.push('.');
            out.push_str(seg);
        }
        Ok(out)
    }
}

/// First dotted segment — the aggregation category.
pub fn category_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

/// Second dotted segment, if any — used for sub-grouping in reports.
pub fn subcategory_of(key: &str) -> Option<&str> {
    key.split('.').nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes_and_case() {
        let rules = KeyRules::default();
        assert_eq!(rules.normalize("User/Name").unwrap(), "user.name");
        assert_eq!(rules.normalize("  project.lang  ").unwrap(), "project.lang");
    }

    #[test]
    fn aliases_plural_category() {
        let rules = KeyRules::default();
        assert_eq!(rules.normalize("users.name").unwrap(), "user.name");
        assert_eq!(rules.normalize("preferences.editor").unwrap(), "preference.editor");
        assert_eq!(rules.normalize("entities.acme").unwrap(), "entity.acme");
    }

    #[test]
    fn rejects_bad_grammar() {
        let rules = KeyRules::default();
        assert!(matches!(rules.normalize(""), Err(MnemoError::EmptyKey)));
        assert!(matches!(rules.normalize("user"), Err(MnemoError::InvalidKey(_))));
        assert!(matches!(
            rules.normalize("user.na me"),
            Err(MnemoError::InvalidKey(_))
        ));
        assert!(matches!(
            rules.normalize("banana.color"),
            Err(MnemoError::UnknownCategory(_))
        ));
    }

    #[test]
    fn collapses_empty_segments() {
        let rules = KeyRules::default();
        assert_eq!(rules.normalize("user..name").unwrap(), "user.name");
        assert_eq!(rules.normalize("user.name.").unwrap(), "user.name");
    }

    #[test]
    fn category_helpers() {
        assert_eq!(category_of("agent.case.test_failure.abc"), "agent");
        assert_eq!(subcategory_of("agent.case.test_failure.abc"), Some("case"));
        assert_eq!(subcategory_of("agent"), None);
    }
}
