use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracker_client::{BackendError, EventStream, JobBackend, Result};
use tracker_types::{JobSnapshot, JobStatus, Layer, LayersPage, StreamEvent, Task, WorkStatus};

/// Scripted in-process backend. Status responses are consumed in order and the last one
/// repeats; layers are served from a fixed list honoring the page cursor.
#[derive(Default)]
pub struct ScriptedBackend {
    statuses: Mutex<VecDeque<Result<JobSnapshot>>>,
    last_status: Mutex<Option<JobSnapshot>>,
    layers: Mutex<Vec<Layer>>,
    fail_items: Mutex<bool>,
    forced_cursor: Mutex<Option<u32>>,
    items_gate: Mutex<Option<Arc<Semaphore>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    pub status_calls: AtomicUsize,
    pub items_calls: AtomicUsize,
    pub stream_connects: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub pr_calls: AtomicUsize,
}

pub struct StreamScript {
    pub events: Vec<StreamEvent>,
    /// Keep the connection open after the scripted events
    pub hold_open: bool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_status(&self, snapshot: JobSnapshot) {
        self.statuses.lock().push_back(Ok(snapshot));
    }

    pub fn push_status_error(&self) {
        self.statuses
            .lock()
            .push_back(Err(BackendError::Request("connection reset".to_string())));
    }

    pub fn set_layers(&self, layers: Vec<Layer>) {
        *self.layers.lock() = layers;
    }

    pub fn set_fail_items(&self, fail: bool) {
        *self.fail_items.lock() = fail;
    }

    /// Every page reports `next` as its cursor regardless of position.
    pub fn force_next_cursor(&self, next: u32) {
        *self.forced_cursor.lock() = Some(next);
    }

    /// Blocks every `items` call until a permit is added to the returned semaphore.
    pub fn gate_items(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.items_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn push_stream(&self, events: Vec<StreamEvent>, hold_open: bool) {
        self.streams
            .lock()
            .push_back(StreamScript { events, hold_open });
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn status(&self, _job_id: &str) -> Result<JobSnapshot> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().pop_front();
        match next {
            Some(Ok(snapshot)) => {
                *self.last_status.lock() = Some(snapshot.clone());
                Ok(snapshot)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last_status
                .lock()
                .clone()
                .ok_or_else(|| BackendError::Request("no scripted status".to_string())),
        }
    }

    async fn items(&self, _job_id: &str, start: u32, page_size: u32) -> Result<LayersPage> {
        self.items_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.items_gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| BackendError::Request(e.to_string()))?;
            permit.forget();
        }
        if *self.fail_items.lock() {
            return Err(BackendError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        let all = self.layers.lock().clone();
        let page: Vec<Layer> = all
            .iter()
            .filter(|layer| layer.order >= start)
            .take(page_size as usize)
            .cloned()
            .collect();
        let next_layer_order = page
            .last()
            .and_then(|last| all.iter().find(|layer| layer.order > last.order))
            .map(|layer| layer.order);
        let next_layer_order = self.forced_cursor.lock().or(next_layer_order);
        Ok(LayersPage {
            layers: page,
            next_layer_order,
        })
    }

    async fn create_pull_request(&self, _job_id: &str) -> Result<()> {
        self.pr_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn submit_job(&self, plan_item_id: &str, _recipe_id: &str) -> Result<String> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("job-{}-{}", plan_item_id, n))
    }

    async fn connect_stream(&self, _job_id: &str) -> Result<EventStream> {
        self.stream_connects.fetch_add(1, Ordering::SeqCst);
        let script = self.streams.lock().pop_front().unwrap_or(StreamScript {
            events: Vec::new(),
            hold_open: true,
        });
        let events = stream::iter(script.events.into_iter().map(Ok));
        if script.hold_open {
            Ok(Box::pin(futures::StreamExt::chain(events, stream::pending())))
        } else {
            Ok(Box::pin(events))
        }
    }
}

pub fn snapshot(status: JobStatus, codegen: Option<JobStatus>) -> JobSnapshot {
    JobSnapshot::new(status, codegen)
}

/// `count` layers numbered from 1, each holding `tasks` tasks with the given status.
pub fn layers(count: u32, tasks: usize, status: WorkStatus) -> Vec<Layer> {
    (1..=count)
        .map(|order| {
            Layer::new(
                order,
                WorkStatus::InProgress,
                (0..tasks).map(|_| Task::with_status(status)).collect(),
            )
        })
        .collect()
}
