use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Partial results per record, keyed by the record's natural key.
///
/// A record is handed back exactly once, as soon as results from all
/// expected targets have arrived.
pub struct PendingAggregates<K, R, V> {
    expected_targets: usize,
    pending: HashMap<K, Pending<R, V>>,
}

struct Pending<R, V> {
    record: R,
    results: BTreeMap<String, V>,
}

pub type Completed<R, V> = (R, BTreeMap<String, V>);

impl<K, R, V> PendingAggregates<K, R, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(expected_targets: usize) -> Self {
        Self {
            expected_targets,
            pending: HashMap::new(),
        }
    }

    pub fn merge(
        &mut self,
        key: K,
        record: R,
        target_uid: impl Into<String>,
        result: V,
    ) -> Option<Completed<R, V>> {
        let entry = self.pending.entry(key.clone()).or_insert_with(|| Pending {
            record,
            results: BTreeMap::new(),
        });
        entry.results.insert(target_uid.into(), result);
        if entry.results.len() < self.expected_targets {
            return None;
        }
        self.pending
            .remove(&key)
            .map(|done| (done.record, done.results))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes every record still waiting on results.
    pub fn drain_incomplete(&mut self) -> Vec<(K, Completed<R, V>)> {
        self.pending
            .drain()
            .map(|(key, pending)| (key, (pending.record, pending.results)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_once_all_targets_reported() {
        let mut aggregates: PendingAggregates<String, &str, u32> = PendingAggregates::new(2);

        assert!(aggregates.merge("1".into(), "row", "a", 1).is_none());
        assert_eq!(aggregates.len(), 1);

        let (record, results) = aggregates.merge("1".into(), "row", "b", 2).unwrap();
        assert_eq!(record, "row");
        assert_eq!(results.get("a"), Some(&1));
        assert_eq!(results.get("b"), Some(&2));
        assert!(aggregates.is_empty());
    }

    #[test]
    fn duplicate_target_does_not_complete_record() {
        let mut aggregates: PendingAggregates<u32, (), u32> = PendingAggregates::new(2);
        assert!(aggregates.merge(7, (), "a", 1).is_none());
        assert!(aggregates.merge(7, (), "a", 2).is_none());

        let incomplete = aggregates.drain_incomplete();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].1.1.get("a"), Some(&2));
    }
}
