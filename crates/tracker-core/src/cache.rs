use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::Level;
use tracker_observability::{emit_event, Component, TrackerEvent};
use tracker_types::{Layer, TimelineEntry};

/// Raw key/value persistence underneath [`SessionCache`].
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    fn put(&self, key: &str, value: Value) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory; survives process restarts.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create cache dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

impl CacheBackend for FileCache {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read cache entry {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("parse cache entry {}", path.display()))?;
        Ok(Some(value))
    }

    fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let content = serde_json::to_string_pretty(&value)?;
        atomic_write(&path, &content)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("remove cache entry {}", path.display()))?;
        }
        Ok(())
    }
}

fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .with_context(|| format!("write temp file {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("rename temp file to {}", path.display()))?;
    Ok(())
}

/// Keys may contain `:` and arbitrary ids; anything outside `[A-Za-z0-9._-]` is hex-escaped so
/// distinct keys never share a file.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("~{:02x}", other)),
        }
    }
    out
}

pub fn completed_slices_key(run_group_id: &str) -> String {
    format!("completed_slices:{}", run_group_id)
}

pub fn task_splitting_key(plan_id: &str, slice: u32) -> String {
    format!("task_splitting:{}:{}", plan_id, slice)
}

pub fn transcript_key(job_id: &str) -> String {
    format!("thinking_transcript:{}", job_id)
}

pub fn layers_snapshot_key(job_id: &str) -> String {
    format!("layers_snapshot:{}", job_id)
}

/// Typed, best-effort view over a [`CacheBackend`]. Every failure is logged and reported as
/// "nothing cached" so callers fall back to starting fresh.
#[derive(Clone)]
pub struct SessionCache {
    backend: Arc<dyn CacheBackend>,
}

impl SessionCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// File-backed cache in `dir`, or an in-memory one if the directory is unusable.
    pub fn file_or_memory(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::in_memory();
        };
        match FileCache::new(dir) {
            Ok(cache) => Self::new(Arc::new(cache)),
            Err(e) => {
                report_failure("cache.open_failed", &e);
                Self::in_memory()
            }
        }
    }

    pub fn completed_slices(&self, run_group_id: &str) -> BTreeSet<u32> {
        self.read(&completed_slices_key(run_group_id))
            .unwrap_or_default()
    }

    /// Adds `slice` to the persisted set and returns the merged set. Never removes entries.
    pub fn add_completed_slice(&self, run_group_id: &str, slice: u32) -> BTreeSet<u32> {
        let key = completed_slices_key(run_group_id);
        let mut slices: BTreeSet<u32> = self.read(&key).unwrap_or_default();
        if slices.insert(slice) {
            let as_list: Vec<u32> = slices.iter().copied().collect();
            self.write(&key, &as_list);
        }
        slices
    }

    pub fn job_for_slice(&self, plan_id: &str, slice: u32) -> Option<String> {
        self.read::<String>(&task_splitting_key(plan_id, slice))
            .filter(|id| !id.trim().is_empty())
    }

    pub fn remember_job(&self, plan_id: &str, slice: u32, job_id: &str) {
        self.write(&task_splitting_key(plan_id, slice), &job_id);
    }

    pub fn forget_job(&self, plan_id: &str, slice: u32) {
        let key = task_splitting_key(plan_id, slice);
        if let Err(e) = self.backend.remove(&key) {
            report_failure("cache.remove_failed", &e);
        }
    }

    pub fn transcript(&self, job_id: &str) -> Option<Vec<TimelineEntry>> {
        self.read::<Vec<TimelineEntry>>(&transcript_key(job_id))
            .filter(|entries| !entries.is_empty())
    }

    pub fn save_transcript(&self, job_id: &str, entries: &[TimelineEntry]) {
        if entries.is_empty() {
            return;
        }
        self.write(&transcript_key(job_id), &entries);
    }

    pub fn layers(&self, job_id: &str) -> Option<Vec<Layer>> {
        self.read::<Vec<Layer>>(&layers_snapshot_key(job_id))
            .filter(|layers| !layers.is_empty())
    }

    pub fn save_layers(&self, job_id: &str, layers: &[Layer]) {
        if layers.is_empty() {
            return;
        }
        self.write(&layers_snapshot_key(job_id), &layers);
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = match self.backend.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                report_failure("cache.read_failed", &e);
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Discarding malformed cache entry {}: {}", key, e);
                None
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.backend.put(key, value) {
            report_failure("cache.write_failed", &e);
        }
    }
}

fn report_failure(event: &str, err: &anyhow::Error) {
    let detail = format!("{:#}", err);
    emit_event(
        Level::WARN,
        Component::Cache,
        TrackerEvent::new(event)
            .error_code("CACHE_UNAVAILABLE")
            .detail(&detail),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_types::{ToolCallStatus, WorkStatus};

    struct BrokenCache;

    impl CacheBackend for BrokenCache {
        fn get(&self, _key: &str) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("storage disabled")
        }

        fn put(&self, _key: &str, _value: Value) -> anyhow::Result<()> {
            anyhow::bail!("storage disabled")
        }

        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage disabled")
        }
    }

    #[test]
    fn completed_slices_only_grow() {
        let cache = SessionCache::in_memory();
        cache.add_completed_slice("run-1", 2);
        let merged = cache.add_completed_slice("run-1", 1);
        assert_eq!(merged.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        let again = cache.add_completed_slice("run-1", 2);
        assert_eq!(again.len(), 2);
        assert!(cache.completed_slices("run-2").is_empty());
    }

    #[test]
    fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = SessionCache::file_or_memory(Some(dir.path()));
            cache.remember_job("plan:a", 3, "job-9");
            cache.save_transcript(
                "job-9",
                &[TimelineEntry::Tool {
                    id: "c1".to_string(),
                    label: "write_file".to_string(),
                    status: ToolCallStatus::Done,
                    detail: None,
                    result: Some("ok".to_string()),
                }],
            );
            cache.save_layers("job-9", &[Layer::new(1, WorkStatus::Completed, Vec::new())]);
        }

        let reopened = SessionCache::file_or_memory(Some(dir.path()));
        assert_eq!(reopened.job_for_slice("plan:a", 3).as_deref(), Some("job-9"));
        assert_eq!(reopened.transcript("job-9").unwrap().len(), 1);
        assert_eq!(reopened.layers("job-9").unwrap()[0].order, 1);
        assert_eq!(reopened.job_for_slice("plan:a", 4), None);

        reopened.forget_job("plan:a", 3);
        assert_eq!(reopened.job_for_slice("plan:a", 3), None);
    }

    #[test]
    fn broken_backend_degrades_to_empty() {
        let cache = SessionCache::new(Arc::new(BrokenCache));
        cache.remember_job("plan", 1, "job");
        assert_eq!(cache.job_for_slice("plan", 1), None);
        let slices = cache.add_completed_slice("run", 1);
        assert!(slices.contains(&1));
        assert!(cache.completed_slices("run").is_empty());
        assert!(cache.transcript("job").is_none());
    }

    #[test]
    fn malformed_entry_is_ignored() {
        let backend = Arc::new(MemoryCache::new());
        backend
            .put(&completed_slices_key("run"), Value::String("oops".to_string()))
            .unwrap();
        let cache = SessionCache::new(backend);
        assert!(cache.completed_slices("run").is_empty());
    }

    #[test]
    fn encoded_keys_do_not_collide() {
        assert_ne!(encode_key("a:b_c"), encode_key("a_b:c"));
        assert_eq!(encode_key("job-1.x"), "job-1.x");
    }

    #[test]
    fn empty_transcripts_are_not_written() {
        let cache = SessionCache::in_memory();
        cache.save_transcript("job", &[]);
        assert!(cache.transcript("job").is_none());
    }
}
