use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracker_types::{Layer, TimelineEntry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceKey {
    pub plan_id: String,
    pub slice: u32,
}

impl SliceKey {
    pub fn new(plan_id: &str, slice: u32) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            slice,
        }
    }
}

/// Working state captured when the dashboard leaves a slice.
#[derive(Debug, Clone, Default)]
pub struct SliceRecord {
    pub job_id: Option<String>,
    pub layers: Arc<Vec<Layer>>,
    pub transcript: Vec<TimelineEntry>,
    pub logs: Vec<String>,
}

/// In-process store of per-slice working state, keyed by (plan, slice).
#[derive(Debug, Default)]
pub struct SliceStore {
    records: HashMap<SliceKey, SliceRecord>,
}

impl SliceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SliceKey) -> Option<&SliceRecord> {
        self.records.get(key)
    }

    pub fn insert(&mut self, key: SliceKey, record: SliceRecord) {
        self.records.insert(key, record);
    }

    pub fn remove(&mut self, key: &SliceKey) -> Option<SliceRecord> {
        self.records.remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops records of `plan_id` whose slice is not in `completed`. Completed slices keep
    /// their layers so they can be shown again without a fetch. Returns the evicted job ids.
    pub fn evict_unless_completed(
        &mut self,
        plan_id: &str,
        completed: &BTreeSet<u32>,
    ) -> Vec<String> {
        let mut evicted_jobs = Vec::new();
        self.records.retain(|key, record| {
            let keep = key.plan_id != plan_id || completed.contains(&key.slice);
            if !keep {
                if let Some(job_id) = record.job_id.take() {
                    evicted_jobs.push(job_id);
                }
            }
            keep
        });
        evicted_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::layers;
    use tracker_types::WorkStatus;

    fn record(job: &str) -> SliceRecord {
        SliceRecord {
            job_id: Some(job.to_string()),
            layers: Arc::new(layers(1, 1, WorkStatus::Completed)),
            transcript: Vec::new(),
            logs: vec!["started".to_string()],
        }
    }

    #[test]
    fn eviction_keeps_completed_slices_and_other_plans() {
        let mut store = SliceStore::new();
        store.insert(SliceKey::new("plan-a", 1), record("j1"));
        store.insert(SliceKey::new("plan-a", 2), record("j2"));
        store.insert(SliceKey::new("plan-b", 2), record("j3"));

        let completed: BTreeSet<u32> = [1].into_iter().collect();
        let evicted = store.evict_unless_completed("plan-a", &completed);

        assert_eq!(evicted, vec!["j2".to_string()]);
        assert_eq!(store.len(), 2);
        assert!(store.get(&SliceKey::new("plan-a", 1)).is_some());
        assert!(store.get(&SliceKey::new("plan-a", 2)).is_none());
        assert!(store.get(&SliceKey::new("plan-b", 2)).is_some());
    }

    #[test]
    fn remove_returns_record() {
        let mut store = SliceStore::new();
        store.insert(SliceKey::new("p", 4), record("j"));
        let removed = store.remove(&SliceKey::new("p", 4));
        assert_eq!(removed.and_then(|r| r.job_id).as_deref(), Some("j"));
        assert!(store.is_empty());
    }
}
