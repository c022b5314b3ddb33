//! Temporal aligner: raw extracted facts → timed facts with
//! `[start_time, end_time)` intervals derived per (key, value).

use serde::Serialize;

/// A fact fresh out of the extractor: key already normalized, timestamp is
/// the transcript's message time.
#[derive(Debug, Clone)]
pub struct RawFact {
    pub key: String,
    pub value: String,
    pub source: String,
    pub message_timestamp: i64,
}

/// A fact with its validity interval. `end_time = None` means still active
/// as far as this batch knows.
#[derive(Debug, Clone, Serialize)]
pub struct TimedFact {
    pub key: String,
    pub value: String,
    pub source: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
}

fn canonical(value: &str) -> &str {
    value.trim()
}

/// Group by key, order by time, collapse consecutive identical values, and
/// chain intervals: each entry ends where the next one starts.
///
/// When different values share a timestamp the input order decides, and all
/// but the last get a zero-length interval — an accepted edge case.
pub fn align(facts: Vec<RawFact>) -> Vec<TimedFact> {
    let mut groups: Vec<(String, Vec<RawFact>)> = Vec::new();
    for fact in facts {
        match groups.iter_mut().find(|(k, _)| *k == fact.key) {
            Some((_, group)) => group.push(fact),
            None => groups.push((fact.key.clone(), vec![fact])),
        }
    }

    let mut out = Vec::new();
    for (key, mut group) in groups {
        // stable: input order is the tie-break for equal timestamps
        group.sort_by_key(|f| f.message_timestamp);

        let mut deduped: Vec<RawFact> = Vec::with_capacity(group.len());
        for fact in group {
            match deduped.last() {
                Some(prev) if canonical(&prev.value) == canonical(&fact.value) => {}
                _ => deduped.push(fact),
            }
        }

        let ends: Vec<Option<i64>> = deduped
            .iter()
            .skip(1)
            .map(|next| Some(next.message_timestamp))
            .chain(std::iter::once(None))
            .collect();

        for (fact, end_time) in deduped.into_iter().zip(ends) {
            out.push(TimedFact {
                key: key.clone(),
                value: fact.value,
                source: fact.source,
                start_time: fact.message_timestamp,
                end_time,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(key: &str, value: &str, ts: i64) -> RawFact {
        RawFact {
            key: key.into(),
            value: value.into(),
            source: "session:test".into(),
            message_timestamp: ts,
        }
    }

    #[test]
    fn chains_intervals_per_key() {
        let timed = align(vec![
            raw("user.city", "Taipei", 1_000),
            raw("user.city", "Hsinchu", 5_000),
            raw("user.name", "Alice", 2_000),
        ]);

        let city: Vec<&TimedFact> = timed.iter().filter(|f| f.key == "user.city").collect();
        assert_eq!(city.len(), 2);
        assert_eq!(city[0].value, "Taipei");
        assert_eq!(city[0].start_time, 1_000);
        assert_eq!(city[0].end_time, Some(5_000));
        assert_eq!(city[1].value, "Hsinchu");
        assert_eq!(city[1].end_time, None);

        let name: Vec<&TimedFact> = timed.iter().filter(|f| f.key == "user.name").collect();
        assert_eq!(name[0].end_time, None);
    }

    #[test]
    fn sorts_within_group() {
        let timed = align(vec![
            raw("user.city", "Hsinchu", 5_000),
            raw("user.city", "Taipei", 1_000),
        ]);
        assert_eq!(timed[0].value, "Taipei");
        assert_eq!(timed[1].value, "Hsinchu");
    }

    #[test]
    fn collapses_consecutive_identical_values() {
        let timed = align(vec![
            raw("user.city", "Taipei", 1_000),
            raw("user.city", " Taipei ", 3_000),
            raw("user.city", "Hsinchu", 5_000),
            raw("user.city", "Hsinchu", 9_000),
        ]);
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].start_time, 1_000);
        assert_eq!(timed[0].end_time, Some(5_000));
        assert_eq!(timed[1].end_time, None);
    }

    #[test]
    fn identical_values_at_same_timestamp_collapse_fully() {
        let timed = align(vec![
            raw("user.city", "Taipei", 1_000),
            raw("user.city", "Taipei", 1_000),
        ]);
        assert_eq!(timed.len(), 1);
    }

    #[test]
    fn different_values_at_same_timestamp_keep_insertion_order() {
        let timed = align(vec![
            raw("user.city", "Taipei", 1_000),
            raw("user.city", "Hsinchu", 1_000),
        ]);
        assert_eq!(timed.len(), 2);
        assert_eq!(timed[0].value, "Taipei");
        // zero-length interval for the earlier one
        assert_eq!(timed[0].end_time, Some(1_000));
        assert_eq!(timed[1].end_time, None);
    }
}
