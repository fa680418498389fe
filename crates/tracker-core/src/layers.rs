use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;
use tracker_client::{BackendError, JobBackend};
use tracker_observability::{emit_event, Component, TrackerEvent};
use tracker_types::{JobSnapshot, JobStatus, Layer};

/// Whether a poll result warrants a full hierarchy fetch.
pub fn should_fetch_layers(
    previous: Option<&JobSnapshot>,
    next: &JobSnapshot,
    cache_empty: bool,
) -> bool {
    if cache_empty || next.codegen_status == Some(JobStatus::InProgress) {
        return true;
    }
    let Some(previous) = previous else {
        return false;
    };
    if previous.current_step != next.current_step {
        return true;
    }
    previous.codegen_status != Some(JobStatus::Completed)
        && next.codegen_status == Some(JobStatus::Completed)
}

/// Positional shallow diff: layer count, layer status, task count, then per-task status and
/// change count. Content inside tasks is not compared; tasks and changes are append-only and
/// status only moves forward, so a regressed status or a removed change goes unnoticed.
pub fn layers_differ(cached: &[Layer], incoming: &[Layer]) -> bool {
    if cached.len() != incoming.len() {
        return true;
    }
    cached.iter().zip(incoming).any(|(old, new)| {
        old.status != new.status
            || old.tasks.len() != new.tasks.len()
            || old.tasks.iter().zip(&new.tasks).any(|(old_task, new_task)| {
                old_task.status != new_task.status
                    || old_task.changes.len() != new_task.changes.len()
            })
    })
}

/// Returns the replacement array when `incoming` differs from `cached`, `None` otherwise.
pub fn merge_layers(cached: &Arc<Vec<Layer>>, incoming: Vec<Layer>) -> Option<Arc<Vec<Layer>>> {
    if layers_differ(cached, &incoming) {
        Some(Arc::new(incoming))
    } else {
        None
    }
}

#[derive(Default)]
struct JobLayers {
    cached: Arc<Vec<Layer>>,
    in_flight: bool,
}

/// Paginated layer retrieval with a per-job merge cache and single-flight guard.
pub struct LayerFetcher {
    backend: Arc<dyn JobBackend>,
    page_size: u32,
    jobs: Mutex<HashMap<String, JobLayers>>,
}

struct InFlight<'a> {
    jobs: &'a Mutex<HashMap<String, JobLayers>>,
    job_id: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.jobs.lock().get_mut(self.job_id) {
            entry.in_flight = false;
        }
    }
}

impl LayerFetcher {
    pub fn new(backend: Arc<dyn JobBackend>, page_size: u32) -> Self {
        Self {
            backend,
            page_size: page_size.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, job_id: &str) -> Arc<Vec<Layer>> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.cached.clone())
            .unwrap_or_default()
    }

    /// Seeds the cache, e.g. from a persisted snapshot.
    pub fn seed(&self, job_id: &str, layers: Arc<Vec<Layer>>) {
        self.jobs.lock().entry(job_id.to_string()).or_default().cached = layers;
    }

    pub fn evict(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
    }

    /// Fetches every page and merges the result. While another fetch for the same job is
    /// running this returns the cached layers without touching the network; on failure the
    /// last good snapshot is returned.
    pub async fn fetch(&self, job_id: &str) -> Arc<Vec<Layer>> {
        {
            let mut jobs = self.jobs.lock();
            let entry = jobs.entry(job_id.to_string()).or_default();
            if entry.in_flight {
                tracing::debug!("Layer fetch already running for {}; serving cache", job_id);
                return entry.cached.clone();
            }
            entry.in_flight = true;
        }
        let _in_flight = InFlight {
            jobs: &self.jobs,
            job_id,
        };

        let fetched = self.fetch_all_pages(job_id).await;

        let mut jobs = self.jobs.lock();
        let entry = jobs.entry(job_id.to_string()).or_default();
        match fetched {
            Ok(layers) => {
                if let Some(replacement) = merge_layers(&entry.cached, layers) {
                    tracing::debug!(
                        "Layer cache updated for {} ({} layers)",
                        job_id,
                        replacement.len()
                    );
                    entry.cached = replacement;
                }
            }
            Err(e) => {
                let detail = e.to_string();
                emit_event(
                    Level::WARN,
                    Component::Layers,
                    TrackerEvent::new("layers.fetch_failed")
                        .job(job_id)
                        .error_code("LAYER_FETCH_FAILED")
                        .detail(&detail),
                );
            }
        }
        entry.cached.clone()
    }

    /// Walks the `start` cursor until the server reports no next page.
    pub async fn fetch_all_pages(&self, job_id: &str) -> Result<Vec<Layer>, BackendError> {
        let mut start = 0u32;
        let mut all = Vec::new();
        loop {
            let page = self.backend.items(job_id, start, self.page_size).await?;
            all.extend(page.layers);
            match page.next_layer_order {
                None => break,
                Some(next) if next <= start => {
                    return Err(BackendError::Parse(format!(
                        "layer cursor did not advance (start={}, next={})",
                        start, next
                    )));
                }
                Some(next) => start = next,
            }
        }
        Ok(all)
    }
}
