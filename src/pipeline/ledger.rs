//! Processed-source ledger: an append-only text file of `<source-id>|<mtime>`
//! lines. Used only for idempotency — a source whose mtime hasn't changed is
//! never reprocessed. Adapter prefixes (`gemini:`) keep host ids from
//! colliding.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::MnemoError;

pub struct Ledger {
    path: PathBuf,
    entries: HashMap<String, i64>,
}

impl Ledger {
    /// Load the ledger; a missing file is an empty ledger. Later lines win,
    /// so re-appending after an mtime change needs no rewriting.
    pub fn load(path: &Path) -> Result<Self, MnemoError> {
        let mut entries = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| MnemoError::Internal(format!("read ledger: {e}")))?;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                // source ids may themselves contain '|'; mtime never does
                let Some((id, mtime)) = line.rsplit_once('|') else {
                    continue;
                };
                if let Ok(mtime) = mtime.parse::<i64>() {
                    entries.insert(id.to_string(), mtime);
                }
            }
        }
        Ok(Self { path: path.to_path_buf(), entries })
    }

    /// Already processed at this exact mtime?
    pub fn is_processed(&self, source_id: &str, mtime: i64) -> bool {
        self.entries.get(source_id) == Some(&mtime)
    }

    /// Record a processed source. Appends to the file and updates the
    /// in-memory view.
    pub fn record(&mut self, source_id: &str, mtime: i64) -> Result<(), MnemoError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| MnemoError::Internal(format!("open ledger: {e}")))?;
        writeln!(file, "{source_id}|{mtime}")
            .map_err(|e| MnemoError::Internal(format!("append ledger: {e}")))?;
        self.entries.insert(source_id.to_string(), mtime);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// File mtime in epoch seconds; 0 when unreadable.
pub fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(&dir.path().join("ledger")).unwrap();
        assert!(ledger.is_empty());
        assert!(!ledger.is_processed("a.jsonl", 100));
    }

    #[test]
    fn record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_sources.ledger");

        let mut ledger = Ledger::load(&path).unwrap();
        ledger.record("a.jsonl", 100).unwrap();
        ledger.record("gemini:sess-1", 200).unwrap();
        assert!(ledger.is_processed("a.jsonl", 100));
        assert!(!ledger.is_processed("a.jsonl", 101));

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.is_processed("gemini:sess-1", 200));
    }

    #[test]
    fn later_lines_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        let mut ledger = Ledger::load(&path).unwrap();
        ledger.record("a.jsonl", 100).unwrap();
        ledger.record("a.jsonl", 150).unwrap();

        let reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_processed("a.jsonl", 150));
        assert!(!reloaded.is_processed("a.jsonl", 100));
    }

    #[test]
    fn tolerates_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        std::fs::write(&path, "not-a-ledger-line\na.jsonl|100\nb|notanumber\n").unwrap();
        let ledger = Ledger::load(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_processed("a.jsonl", 100));
    }
}
