use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracker_client::{HttpJobBackend, JobBackend};
use tracker_observability::{emit_event, Component, TrackerEvent};
use tracker_types::{JobSnapshot, Layer, Slice, SliceState, StreamEvent};

use crate::cache::SessionCache;
use crate::completion::{
    evaluate_completion, next_slice, slice_state, CompletionCheck, CompletionCommand,
};
use crate::config::EngineConfig;
use crate::dispatcher::{Notification, NotificationBus, SideEffectDispatcher};
use crate::error::{Result, TrackerError};
use crate::layers::{should_fetch_layers, LayerFetcher};
use crate::poller::{polling_finished, pr_watch_finished, SnapshotSlot};
use crate::store::{SliceKey, SliceRecord, SliceStore};
use crate::timeline::{ActivityRows, LiveTimeline, TimelineView};

/// The externally supplied plan the dashboard walks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanContext {
    pub plan_id: String,
    /// Groups the persisted completed-slice set for one overall run
    pub run_group_id: String,
    pub recipe_id: String,
    pub slices: Vec<Slice>,
}

impl PlanContext {
    pub fn slice(&self, item_number: u32) -> Option<&Slice> {
        self.slices
            .iter()
            .find(|slice| slice.item_number == item_number)
    }

    /// Lowest-numbered slice not yet completed.
    pub fn first_open_slice(&self, completed: &BTreeSet<u32>) -> Option<u32> {
        self.slices
            .iter()
            .map(|slice| slice.item_number)
            .filter(|item| !completed.contains(item))
            .min()
    }
}

/// Everything the dashboard renders, published after every engine step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    pub active_slice: Option<u32>,
    pub job_id: Option<String>,
    pub snapshot: Option<Arc<JobSnapshot>>,
    pub layers: Arc<Vec<Layer>>,
    pub timeline: TimelineView,
    pub logs: Vec<String>,
    pub completed_slices: BTreeSet<u32>,
    pub slice_states: BTreeMap<u32, SliceState>,
    /// Run indicator
    pub running: bool,
    pub streaming: bool,
    pub polling: bool,
    pub pr_watching: bool,
    /// The active slice was restored from the session cache
    pub restored: bool,
}

#[derive(Debug)]
enum EngineCommand {
    SelectSlice(u32),
    StartSlice(u32),
    RunAll,
    CreatePullRequest,
    Shutdown,
}

/// Results of spawned work. `session` and `epoch` identify the observing session or stream
/// connection that issued the work; anything older than the current one is discarded.
enum Internal {
    Status {
        session: u64,
        result: tracker_client::Result<JobSnapshot>,
    },
    PrStatus {
        session: u64,
        result: tracker_client::Result<JobSnapshot>,
    },
    Layers {
        session: u64,
        layers: Arc<Vec<Layer>>,
    },
    Submitted {
        session: u64,
        slice: u32,
        result: tracker_client::Result<String>,
    },
    PrRequested {
        session: u64,
        result: tracker_client::Result<()>,
    },
    Stream {
        epoch: u64,
        event: StreamEvent,
    },
    StreamClosed {
        epoch: u64,
        reason: Option<String>,
    },
}

struct PendingAdvance {
    slice: u32,
    at: Instant,
}

pub struct TrackerEngine;

impl TrackerEngine {
    /// Starts an engine talking to the HTTP backend described by `config`.
    pub fn connect(
        config: EngineConfig,
        plan: PlanContext,
        initial_slice: Option<u32>,
    ) -> Result<EngineHandle> {
        if config.base_url.trim().is_empty() {
            return Err(TrackerError::InvalidConfig("base_url is empty".to_string()));
        }
        let backend = HttpJobBackend::new(config.client_config())?;
        let cache = SessionCache::file_or_memory(config.resolved_cache_dir().as_deref());
        Ok(Self::spawn(config, Arc::new(backend), cache, plan, initial_slice))
    }

    pub fn spawn(
        config: EngineConfig,
        backend: Arc<dyn JobBackend>,
        cache: SessionCache,
        plan: PlanContext,
        initial_slice: Option<u32>,
    ) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DashboardState::default());
        let notifications = NotificationBus::new();
        let shutdown = CancellationToken::new();

        let completed = cache.completed_slices(&plan.run_group_id);
        let actor = EngineActor {
            fetcher: Arc::new(LayerFetcher::new(backend.clone(), config.page_size)),
            config,
            backend,
            cache,
            plan,
            state_tx,
            notifications: notifications.clone(),
            internal_tx,
            session_token: shutdown.child_token(),
            shutdown: shutdown.clone(),
            session: 0,
            stream_epoch: 0,
            active_slice: None,
            job_id: None,
            snapshot: SnapshotSlot::new(),
            layers: Arc::new(Vec::new()),
            live: LiveTimeline::new(),
            activity_rows: ActivityRows::default(),
            logs: Vec::new(),
            completed,
            dispatcher: SideEffectDispatcher::new(),
            store: SliceStore::new(),
            running: false,
            run_all: false,
            restored: false,
            transcript_saved: false,
            status_in_flight: false,
            pr_in_flight: false,
            submitting: false,
            poll_at: None,
            pr_at: None,
            advance: None,
            stream: None,
            stream_key: None,
        };
        let task = tokio::spawn(actor.run(command_rx, internal_rx, initial_slice));

        EngineHandle {
            commands: command_tx,
            state: state_rx,
            notifications,
            shutdown,
            task,
        }
    }
}

/// Caller-side handle. Dropping it without `shutdown` leaves the engine running until the
/// command channel closes.
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    state: watch::Receiver<DashboardState>,
    notifications: NotificationBus,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn state(&self) -> watch::Receiver<DashboardState> {
        self.state.clone()
    }

    pub fn current(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Switches the dashboard to `slice` without starting work.
    pub async fn select_slice(&self, slice: u32) -> Result<()> {
        self.send(EngineCommand::SelectSlice(slice)).await
    }

    /// Resumes the slice's cached job, or submits a new one.
    pub async fn start_slice(&self, slice: u32) -> Result<()> {
        self.send(EngineCommand::StartSlice(slice)).await
    }

    /// Starts the first open slice and keeps advancing until the plan is done.
    pub async fn run_all(&self) -> Result<()> {
        self.send(EngineCommand::RunAll).await
    }

    pub async fn create_pull_request(&self) -> Result<()> {
        self.send(EngineCommand::CreatePullRequest).await
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Tracker engine task ended abnormally: {}", e);
        }
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TrackerError::EngineStopped)
    }
}

struct EngineActor {
    config: EngineConfig,
    backend: Arc<dyn JobBackend>,
    cache: SessionCache,
    fetcher: Arc<LayerFetcher>,
    plan: PlanContext,
    state_tx: watch::Sender<DashboardState>,
    notifications: NotificationBus,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shutdown: CancellationToken,
    /// Cancelled on every slice or job switch
    session_token: CancellationToken,
    session: u64,
    stream_epoch: u64,

    active_slice: Option<u32>,
    job_id: Option<String>,
    snapshot: SnapshotSlot,
    layers: Arc<Vec<Layer>>,
    live: LiveTimeline,
    activity_rows: ActivityRows,
    logs: Vec<String>,
    completed: BTreeSet<u32>,
    dispatcher: SideEffectDispatcher,
    store: SliceStore,
    running: bool,
    run_all: bool,
    restored: bool,
    transcript_saved: bool,

    status_in_flight: bool,
    pr_in_flight: bool,
    submitting: bool,
    poll_at: Option<Instant>,
    pr_at: Option<Instant>,
    advance: Option<PendingAdvance>,
    stream: Option<CancellationToken>,
    /// Job whose in-progress condition the current (or last) stream was opened for
    stream_key: Option<String>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl EngineActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        initial_slice: Option<u32>,
    ) {
        tracing::info!(
            "Tracker engine started for plan {} ({} slices, {} completed)",
            self.plan.plan_id,
            self.plan.slices.len(),
            self.completed.len()
        );
        if let Some(slice) = initial_slice {
            self.activate_slice(slice);
        }
        self.publish();

        let shutdown = self.shutdown.clone();
        loop {
            let poll_at = self.poll_at;
            let pr_at = self.pr_at;
            let advance_at = self.advance.as_ref().map(|advance| advance.at);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = sleep_until_opt(poll_at) => self.on_poll_tick(),
                _ = sleep_until_opt(pr_at) => self.on_pr_tick(),
                _ = sleep_until_opt(advance_at) => self.fire_advance(),
            }
            self.publish();
        }

        self.teardown_session();
        self.publish();
        emit_event(Level::INFO, Component::Engine, self.obs("engine.stopped"));
    }

    fn handle_command(&mut self, command: EngineCommand) {
        tracing::debug!("engine command: {:?}", command);
        match command {
            EngineCommand::SelectSlice(slice) => {
                if self.active_slice != Some(slice) {
                    self.activate_slice(slice);
                }
            }
            EngineCommand::StartSlice(slice) => {
                if self.active_slice != Some(slice) {
                    self.activate_slice(slice);
                }
                self.run_all = false;
                self.start_active_slice();
            }
            EngineCommand::RunAll => self.start_run_all(),
            EngineCommand::CreatePullRequest => self.create_pull_request(),
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Status { session, result } if session == self.session => {
                self.on_status(result)
            }
            Internal::PrStatus { session, result } if session == self.session => {
                self.on_pr_status(result)
            }
            Internal::Layers { session, layers } if session == self.session => {
                self.on_layers(layers)
            }
            Internal::Submitted {
                session,
                slice,
                result,
            } if session == self.session => self.on_submitted(slice, result),
            Internal::PrRequested { session, result } if session == self.session => {
                self.on_pr_requested(result)
            }
            Internal::Stream { epoch, event } if self.is_current_stream(epoch) => {
                self.on_stream_event(event)
            }
            Internal::StreamClosed { epoch, reason } if self.is_current_stream(epoch) => {
                self.on_stream_closed(reason)
            }
            _ => tracing::debug!("Discarding result from a torn-down session"),
        }
    }

    fn obs<'a>(&'a self, event: &'a str) -> TrackerEvent<'a> {
        let mut out = TrackerEvent::new(event).plan(&self.plan.plan_id);
        if let Some(slice) = self.active_slice {
            out = out.slice(slice);
        }
        if let Some(job_id) = self.job_id.as_deref() {
            out = out.job(job_id);
        }
        out
    }

    fn push_log(&mut self, line: String) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.logs.push(format!("[{}] {}", stamp, line));
    }

    fn notify(&self, notification: Notification) {
        emit_event(
            Level::INFO,
            Component::Dispatcher,
            self.obs("notification.published").detail(notification.kind()),
        );
        self.notifications.publish(notification);
    }

    fn spawn_guarded<F>(&self, work: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let token = self.session_token.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                message = work => {
                    let _ = tx.send(message);
                }
            }
        });
    }

    // ---- slice lifecycle ----

    /// Cancels everything tied to the current observing session.
    fn teardown_session(&mut self) {
        self.session_token.cancel();
        self.session_token = self.shutdown.child_token();
        self.session += 1;
        self.status_in_flight = false;
        self.pr_in_flight = false;
        self.submitting = false;
        self.poll_at = None;
        self.pr_at = None;
        self.advance = None;
        self.stop_stream();
        self.stream_key = None;
    }

    fn reset_job_state(&mut self) {
        self.job_id = None;
        self.snapshot = SnapshotSlot::new();
        self.layers = Arc::new(Vec::new());
        self.live.clear();
        self.dispatcher.reset_session();
        self.transcript_saved = false;
        self.restored = false;
    }

    fn stash_active_slice(&mut self) {
        let Some(slice) = self.active_slice else {
            return;
        };
        let record = SliceRecord {
            job_id: self.job_id.clone(),
            layers: self.layers.clone(),
            transcript: self.timeline_view().entries().to_vec(),
            logs: std::mem::take(&mut self.logs),
        };
        self.store
            .insert(SliceKey::new(&self.plan.plan_id, slice), record);
    }

    fn activate_slice(&mut self, slice: u32) {
        if self.plan.slice(slice).is_none() {
            tracing::warn!("Slice {} is not part of plan {}", slice, self.plan.plan_id);
            return;
        }
        self.teardown_session();
        self.stash_active_slice();
        for job_id in self
            .store
            .evict_unless_completed(&self.plan.plan_id, &self.completed)
        {
            self.fetcher.evict(&job_id);
        }

        self.reset_job_state();
        self.logs.clear();
        self.running = false;
        self.run_all = false;
        self.active_slice = Some(slice);
        self.job_id = self.cache.job_for_slice(&self.plan.plan_id, slice);
        emit_event(Level::INFO, Component::Engine, self.obs("slice.selected"));

        if self.completed.contains(&slice) {
            self.restore_completed(slice);
        } else if let Some(job_id) = self.job_id.clone() {
            self.begin_observing(job_id);
        }
    }

    /// Shows a completed slice from memory or the session cache. Nothing is polled.
    fn restore_completed(&mut self, slice: u32) {
        let key = SliceKey::new(&self.plan.plan_id, slice);
        let (layers, mut transcript, logs) = match self.store.get(&key) {
            Some(record) => {
                if self.job_id.is_none() {
                    self.job_id = record.job_id.clone();
                }
                (
                    record.layers.clone(),
                    record.transcript.clone(),
                    record.logs.clone(),
                )
            }
            None => {
                let layers = self
                    .job_id
                    .as_deref()
                    .and_then(|job_id| self.cache.layers(job_id))
                    .unwrap_or_default();
                (Arc::new(layers), Vec::new(), Vec::new())
            }
        };
        if transcript.is_empty() {
            transcript = self
                .job_id
                .as_deref()
                .and_then(|job_id| self.cache.transcript(job_id))
                .unwrap_or_default();
        }

        if let Some(job_id) = self.job_id.as_deref() {
            self.fetcher.seed(job_id, layers.clone());
        }
        self.layers = layers;
        self.live = LiveTimeline::from_entries(transcript);
        self.logs = logs;
        self.restored = true;
        self.transcript_saved = true;
        emit_event(Level::INFO, Component::Cache, self.obs("session.restored"));
    }

    fn begin_observing(&mut self, job_id: String) {
        self.job_id = Some(job_id);
        emit_event(Level::INFO, Component::Poller, self.obs("poller.started"));
        self.request_status();
    }

    fn start_active_slice(&mut self) {
        let Some(slice) = self.active_slice else {
            return;
        };
        if self.completed.contains(&slice) {
            self.push_log(format!("Slice {} already completed", slice));
            if self.run_all {
                self.schedule_after(slice, Duration::ZERO);
            }
            return;
        }

        self.running = true;
        if let Some(job_id) = self.job_id.clone() {
            let failed = self
                .snapshot
                .current()
                .map(|snapshot| snapshot.is_failed())
                .unwrap_or(false);
            if !failed {
                self.push_log(format!("Resuming slice {} (job {})", slice, job_id));
                if self.snapshot.current().is_none() && !self.status_in_flight {
                    self.begin_observing(job_id);
                }
                return;
            }
            self.push_log(format!("Retrying slice {} after failed job {}", slice, job_id));
            self.cache.forget_job(&self.plan.plan_id, slice);
            self.teardown_session();
            self.reset_job_state();
        }
        self.submit_job(slice);
    }

    fn submit_job(&mut self, slice: u32) {
        if self.submitting {
            return;
        }
        let Some(plan_item_id) = self
            .plan
            .slice(slice)
            .map(|slice| slice.plan_item_id.clone())
        else {
            return;
        };
        self.submitting = true;
        self.push_log(format!("Starting slice {}", slice));

        let backend = self.backend.clone();
        let recipe_id = self.plan.recipe_id.clone();
        let session = self.session;
        self.spawn_guarded(async move {
            let result = backend.submit_job(&plan_item_id, &recipe_id).await;
            Internal::Submitted {
                session,
                slice,
                result,
            }
        });
    }

    fn on_submitted(&mut self, slice: u32, result: tracker_client::Result<String>) {
        self.submitting = false;
        match result {
            Ok(job_id) => {
                self.cache.remember_job(&self.plan.plan_id, slice, &job_id);
                emit_event(
                    Level::INFO,
                    Component::Engine,
                    TrackerEvent::new("job.submitted")
                        .plan(&self.plan.plan_id)
                        .slice(slice)
                        .job(&job_id),
                );
                self.begin_observing(job_id);
            }
            Err(e) => {
                let message = e.to_string();
                self.running = false;
                self.run_all = false;
                self.push_log(format!("✗ Failed to start slice {}: {}", slice, message));
                emit_event(
                    Level::ERROR,
                    Component::Engine,
                    self.obs("job.submit_failed")
                        .error_code("JOB_SUBMIT_FAILED")
                        .detail(&message),
                );
                self.notify(Notification::JobSubmitFailed { slice, message });
            }
        }
    }

    fn start_run_all(&mut self) {
        let target = self
            .active_slice
            .filter(|slice| !self.completed.contains(slice))
            .or_else(|| self.plan.first_open_slice(&self.completed));
        let Some(target) = target else {
            self.push_log("All slices already completed".to_string());
            return;
        };
        if self.active_slice != Some(target) {
            self.activate_slice(target);
        }
        self.run_all = true;
        self.start_active_slice();
    }

    fn schedule_after(&mut self, slice: u32, delay: Duration) {
        match next_slice(&self.plan.slices, slice) {
            Some(next) => {
                tracing::info!("Advancing to slice {} in {:?}", next.item_number, delay);
                self.advance = Some(PendingAdvance {
                    slice: next.item_number,
                    at: Instant::now() + delay,
                });
            }
            None => self.stop_run(),
        }
    }

    fn stop_run(&mut self) {
        if self.running || self.run_all {
            self.push_log("Run finished".to_string());
        }
        self.running = false;
        self.run_all = false;
    }

    fn fire_advance(&mut self) {
        let Some(advance) = self.advance.take() else {
            return;
        };
        let continue_run = self.run_all;
        self.activate_slice(advance.slice);
        emit_event(Level::INFO, Component::Completion, self.obs("slice.advanced"));
        if continue_run {
            self.run_all = true;
            self.start_active_slice();
        }
    }

    // ---- status polling ----

    fn request_status(&mut self) {
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        if self.status_in_flight {
            tracing::debug!("Status fetch for {} still pending; skipping tick", job_id);
            return;
        }
        self.status_in_flight = true;
        let backend = self.backend.clone();
        let session = self.session;
        self.spawn_guarded(async move {
            let result = backend.status(&job_id).await;
            Internal::Status { session, result }
        });
    }

    fn on_poll_tick(&mut self) {
        self.poll_at = Some(Instant::now() + self.config.poll_interval());
        self.request_status();
    }

    fn on_status(&mut self, result: tracker_client::Result<JobSnapshot>) {
        self.status_in_flight = false;
        match result {
            Ok(snapshot) => {
                let finished = polling_finished(&snapshot);
                self.apply_snapshot(snapshot);
                if finished {
                    if self.poll_at.take().is_some() {
                        emit_event(Level::INFO, Component::Poller, self.obs("poller.finished"));
                    }
                } else if self.poll_at.is_none() {
                    self.poll_at = Some(Instant::now() + self.config.poll_interval());
                }
            }
            Err(e) => {
                let detail = e.to_string();
                emit_event(
                    Level::WARN,
                    Component::Poller,
                    self.obs("poller.fetch_failed")
                        .error_code("STATUS_FETCH_FAILED")
                        .detail(&detail),
                );
                if self.poll_at.is_none() {
                    self.poll_at = Some(Instant::now() + self.config.poll_interval());
                }
            }
        }
    }

    /// Shared by the main poller and the pull-request watcher.
    fn apply_snapshot(&mut self, snapshot: JobSnapshot) {
        let update = self.snapshot.apply(snapshot);
        let current = update.current().clone();
        if update.is_changed() {
            tracing::debug!(
                "Job {:?} status={} codegen={}",
                self.job_id,
                current.status.as_str(),
                current.codegen_status.map(|s| s.as_str()).unwrap_or("-")
            );
        }

        for notification in self.dispatcher.on_snapshot(&current) {
            self.notify(notification);
        }

        if current.is_failed() && update.is_changed() && self.running {
            let reason = current.error_text().unwrap_or("job failed").to_string();
            if let Some(slice) = self.active_slice {
                self.push_log(format!("✗ Slice {} failed: {}", slice, reason));
            }
            self.running = false;
            self.run_all = false;
        }

        self.reconcile_stream(&current);

        let previous = update.previous().map(Arc::as_ref);
        if should_fetch_layers(previous, &current, self.layers.is_empty()) {
            self.request_layers();
        }

        if current.codegen_completed() {
            self.persist_transcript();
        }
        self.check_completion();
    }

    fn persist_transcript(&mut self) {
        if self.transcript_saved {
            return;
        }
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        let view = self.timeline_view();
        if view.entries().is_empty() {
            return;
        }
        self.cache.save_transcript(&job_id, view.entries());
        self.transcript_saved = true;
    }

    // ---- layers and completion ----

    fn request_layers(&self) {
        let Some(job_id) = self.job_id.clone() else {
            return;
        };
        let fetcher = self.fetcher.clone();
        let session = self.session;
        self.spawn_guarded(async move {
            let layers = fetcher.fetch(&job_id).await;
            Internal::Layers { session, layers }
        });
    }

    fn on_layers(&mut self, layers: Arc<Vec<Layer>>) {
        if !Arc::ptr_eq(&self.layers, &layers) {
            for notification in self.dispatcher.on_layers(&layers) {
                self.notify(notification);
            }
            self.layers = layers;
        }
        self.check_completion();
    }

    fn check_completion(&mut self) {
        let Some(slice) = self.active_slice else {
            return;
        };
        let commands = evaluate_completion(CompletionCheck {
            slice,
            layers: &self.layers,
            completed: &self.completed,
            slices: &self.plan.slices,
            advance_delay: self.config.advance_delay(),
        });
        for command in commands {
            match command {
                CompletionCommand::AppendLog(line) => self.push_log(line),
                CompletionCommand::MarkSliceCompleted(slice) => self.mark_completed(slice),
                CompletionCommand::ScheduleAdvance { slice, after } => {
                    tracing::info!("Advancing to slice {} in {:?}", slice, after);
                    self.advance = Some(PendingAdvance {
                        slice,
                        at: Instant::now() + after,
                    });
                }
                CompletionCommand::StopRun => self.stop_run(),
            }
        }
    }

    fn mark_completed(&mut self, slice: u32) {
        let persisted = self
            .cache
            .add_completed_slice(&self.plan.run_group_id, slice);
        self.completed.extend(persisted);
        self.completed.insert(slice);
        if let Some(job_id) = self.job_id.as_deref() {
            self.cache.save_layers(job_id, &self.layers);
        }
        emit_event(
            Level::INFO,
            Component::Completion,
            self.obs("slice.completed").status("completed"),
        );
        self.notify(Notification::SliceCompleted { slice });
    }

    // ---- pull request ----

    fn create_pull_request(&mut self) {
        let Some(job_id) = self.job_id.clone() else {
            tracing::warn!("Pull request requested without an active job");
            return;
        };
        self.dispatcher.begin_pr_attempt();
        self.pr_at = None;
        emit_event(Level::INFO, Component::PrPoller, self.obs("pr.requested"));

        let backend = self.backend.clone();
        let session = self.session;
        self.spawn_guarded(async move {
            let result = backend.create_pull_request(&job_id).await;
            Internal::PrRequested { session, result }
        });
    }

    fn on_pr_requested(&mut self, result: tracker_client::Result<()>) {
        match result {
            Ok(()) => {
                self.pr_at = Some(Instant::now() + self.config.pr_poll_interval());
            }
            Err(e) => {
                let message = e.to_string();
                emit_event(
                    Level::WARN,
                    Component::PrPoller,
                    self.obs("pr.request_failed")
                        .error_code("PR_CREATE_FAILED")
                        .detail(&message),
                );
                if let Some(notification) = self.dispatcher.on_pr_request_failed(message) {
                    self.notify(notification);
                }
            }
        }
    }

    fn on_pr_tick(&mut self) {
        self.pr_at = Some(Instant::now() + self.config.pr_poll_interval());
        if self.pr_in_flight {
            return;
        }
        let Some(job_id) = self.job_id.clone() else {
            self.pr_at = None;
            return;
        };
        self.pr_in_flight = true;
        let backend = self.backend.clone();
        let session = self.session;
        self.spawn_guarded(async move {
            let result = backend.status(&job_id).await;
            Internal::PrStatus { session, result }
        });
    }

    fn on_pr_status(&mut self, result: tracker_client::Result<JobSnapshot>) {
        self.pr_in_flight = false;
        match result {
            Ok(snapshot) => {
                let done = pr_watch_finished(&snapshot);
                self.apply_snapshot(snapshot);
                if done {
                    self.pr_at = None;
                    emit_event(Level::INFO, Component::PrPoller, self.obs("pr.watch_finished"));
                }
            }
            Err(e) => {
                tracing::warn!("Pull request status fetch failed: {}", e);
            }
        }
    }

    // ---- live stream ----

    fn is_current_stream(&self, epoch: u64) -> bool {
        self.stream.is_some() && epoch == self.stream_epoch
    }

    /// Opens a connection while the job is in progress. Reconnects only when the job or the
    /// in-progress condition changes; an ended stream stays closed otherwise.
    fn reconcile_stream(&mut self, snapshot: &JobSnapshot) {
        let key = self.job_id.clone().filter(|_| snapshot.is_in_progress());
        if key == self.stream_key {
            return;
        }
        self.stop_stream();
        self.stream_key = key.clone();
        if let Some(job_id) = key {
            self.open_stream(job_id);
        }
    }

    fn open_stream(&mut self, job_id: String) {
        self.stream_epoch += 1;
        let epoch = self.stream_epoch;
        let token = self.session_token.child_token();
        self.stream = Some(token.clone());
        self.live.clear();
        emit_event(Level::INFO, Component::Stream, self.obs("stream.opened"));

        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut events = tokio::select! {
                _ = token.cancelled() => return,
                connected = backend.connect_stream(&job_id) => match connected {
                    Ok(events) => events,
                    Err(e) => {
                        let _ = tx.send(Internal::StreamClosed {
                            epoch,
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                },
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            let closes = event.closes_stream();
                            if tx.send(Internal::Stream { epoch, event }).is_err() || closes {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Internal::StreamClosed {
                                epoch,
                                reason: Some(e.to_string()),
                            });
                            return;
                        }
                        None => {
                            let _ = tx.send(Internal::StreamClosed { epoch, reason: None });
                            return;
                        }
                    },
                }
            }
        });
    }

    fn stop_stream(&mut self) {
        if let Some(token) = self.stream.take() {
            token.cancel();
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        tracing::trace!("stream event: {}", event.event_type());
        let reason = match &event {
            StreamEvent::Error { message } => Some(
                message
                    .clone()
                    .unwrap_or_else(|| "stream reported an error".to_string()),
            ),
            _ => None,
        };
        if self.live.apply(&event) {
            self.on_stream_closed(reason);
        }
    }

    /// `reason` is set when the connection failed rather than ended. A failed stream drops its
    /// partial live timeline so the view falls back to rows rebuilt from polled activity.
    fn on_stream_closed(&mut self, reason: Option<String>) {
        self.stop_stream();
        match reason {
            Some(reason) => {
                self.live.clear();
                emit_event(
                    Level::WARN,
                    Component::Stream,
                    self.obs("stream.closed")
                        .error_code("STREAM_DISCONNECTED")
                        .detail(&reason),
                );
            }
            None => emit_event(Level::INFO, Component::Stream, self.obs("stream.closed")),
        }
    }

    // ---- publishing ----

    fn timeline_view(&mut self) -> TimelineView {
        TimelineView::select_cached(
            &self.live,
            &mut self.activity_rows,
            self.snapshot.current(),
            self.config.activity_preview_chars,
        )
    }

    fn dashboard_state(&mut self) -> DashboardState {
        let slice_states = self
            .plan
            .slices
            .iter()
            .map(|slice| {
                let state = slice_state(
                    slice.item_number,
                    self.active_slice,
                    self.running,
                    &self.completed,
                );
                (slice.item_number, state)
            })
            .collect();
        let timeline = self.timeline_view();
        DashboardState {
            active_slice: self.active_slice,
            job_id: self.job_id.clone(),
            snapshot: self.snapshot.current().cloned(),
            layers: self.layers.clone(),
            timeline,
            logs: self.logs.clone(),
            completed_slices: self.completed.clone(),
            slice_states,
            running: self.running,
            streaming: self.stream.is_some(),
            polling: self.poll_at.is_some(),
            pr_watching: self.pr_at.is_some(),
            restored: self.restored,
        }
    }

    fn publish(&mut self) {
        let next = self.dashboard_state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{layers, snapshot, ScriptedBackend};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tracker_types::{AgentActivity, JobStatus, TimelineEntry, ToolCallStatus, WorkStatus};

    fn plan(slices: &[u32]) -> PlanContext {
        PlanContext {
            plan_id: "plan-1".to_string(),
            run_group_id: "group-1".to_string(),
            recipe_id: "recipe-1".to_string(),
            slices: slices
                .iter()
                .map(|n| Slice::new(*n, format!("item-{}", n)))
                .collect(),
        }
    }

    async fn wait_for(
        handle: &EngineHandle,
        predicate: impl FnMut(&DashboardState) -> bool,
    ) -> DashboardState {
        let mut rx = handle.state();
        let state = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for dashboard state")
            .expect("engine stopped");
        state.clone()
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            out.push(notification);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn completed_slice_restores_without_network() {
        let backend = ScriptedBackend::new();
        let cache = SessionCache::in_memory();
        cache.add_completed_slice("group-1", 1);
        cache.add_completed_slice("group-1", 2);
        cache.remember_job("plan-1", 2, "J");
        let transcript = vec![TimelineEntry::Text {
            content: "all done".to_string(),
        }];
        cache.save_transcript("J", &transcript);
        cache.save_layers("J", &layers(2, 1, WorkStatus::Completed));

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1, 2, 3]),
            Some(2),
        );
        let state = wait_for(&handle, |s| s.restored).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(state.job_id.as_deref(), Some("J"));
        assert_eq!(state.layers.len(), 2);
        assert!(state.timeline.is_live());
        assert_eq!(state.timeline.entries(), transcript.as_slice());
        assert_eq!(state.slice_states.get(&2), Some(&SliceState::Completed));
        assert_eq!(state.slice_states.get(&3), Some(&SliceState::Pending));
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.items_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.stream_connects.load(Ordering::SeqCst), 0);
        assert!(!handle.current().streaming);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completion_side_effects_fire_once_across_ticks() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::InProgress, Some(JobStatus::InProgress)));
        backend.set_layers(layers(2, 2, WorkStatus::Completed));
        let cache = SessionCache::in_memory();

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache.clone(),
            plan(&[1]),
            Some(1),
        );
        let mut notifications = handle.subscribe_notifications();
        handle.start_slice(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(33)).await;

        let state = handle.current();
        assert!(backend.status_calls.load(Ordering::SeqCst) >= 10);
        let completion_lines = state
            .logs
            .iter()
            .filter(|line| line.contains("Slice 1 completed"))
            .count();
        assert_eq!(completion_lines, 1);
        let completed_notes = drain(&mut notifications)
            .into_iter()
            .filter(|n| matches!(n, Notification::SliceCompleted { slice: 1 }))
            .count();
        assert_eq!(completed_notes, 1);
        assert_eq!(
            cache.completed_slices("group-1").into_iter().collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(
            cache.job_for_slice("plan-1", 1).as_deref(),
            Some("job-item-1-1")
        );
        assert!(!state.running);
        assert!(state.polling);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_stream_feeds_the_timeline() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::InProgress, Some(JobStatus::InProgress)));
        backend.push_stream(
            vec![
                StreamEvent::Chunk {
                    content: "Plan".to_string(),
                },
                StreamEvent::Chunk {
                    content: "ning".to_string(),
                },
                StreamEvent::ToolCallStart {
                    tool: "read_file".to_string(),
                    call_id: Some("c1".to_string()),
                },
                StreamEvent::ToolCallEnd {
                    tool: "read_file".to_string(),
                    call_id: Some("c1".to_string()),
                    result: Some(json!({"lines": 3})),
                },
            ],
            true,
        );
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-live");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1, 2]),
            Some(1),
        );
        let state = wait_for(&handle, |s| {
            matches!(
                s.timeline.entries().last(),
                Some(TimelineEntry::Tool {
                    status: ToolCallStatus::Done,
                    ..
                })
            )
        })
        .await;
        assert!(state.timeline.is_live());
        assert_eq!(
            state.timeline.entries()[0],
            TimelineEntry::Text {
                content: "Planning".to_string()
            }
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.stream_connects.load(Ordering::SeqCst), 1);
        assert!(handle.current().streaming);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_is_not_reopened_under_same_condition() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::InProgress, Some(JobStatus::InProgress)));
        backend.push_stream(
            vec![
                StreamEvent::Chunk {
                    content: "hello".to_string(),
                },
                StreamEvent::End,
            ],
            false,
        );
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-end");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        tokio::time::sleep(Duration::from_secs(20)).await;

        let state = handle.current();
        assert!(!state.streaming);
        assert_eq!(backend.stream_connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.timeline.entries(),
            &[TimelineEntry::Text {
                content: "hello".to_string()
            }]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_notification_is_shown_once() {
        let backend = ScriptedBackend::new();
        let mut failed = snapshot(JobStatus::Failed, Some(JobStatus::InProgress));
        failed.error_message = Some("tests failed".to_string());
        backend.push_status(failed);
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-f");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        let mut notifications = handle.subscribe_notifications();
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(backend.status_calls.load(Ordering::SeqCst) >= 5);
        let failures: Vec<_> = drain(&mut notifications)
            .into_iter()
            .filter(|n| matches!(n, Notification::JobFailed { .. }))
            .collect();
        assert_eq!(
            failures,
            vec![Notification::JobFailed {
                message: "tests failed".to_string()
            }]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_first_fetch_never_arms_polling() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::Completed, Some(JobStatus::Completed)));
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-done");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 1);
        assert!(!handle.current().polling);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_advances_through_the_plan() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::Completed, Some(JobStatus::Completed)));
        backend.set_layers(layers(1, 1, WorkStatus::Completed));
        let cache = SessionCache::in_memory();

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache.clone(),
            plan(&[1, 2]),
            None,
        );
        handle.run_all().await.unwrap();
        let state = wait_for(&handle, |s| s.completed_slices.len() == 2 && !s.running).await;

        assert_eq!(state.active_slice, Some(2));
        assert_eq!(backend.submit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.job_for_slice("plan-1", 2).as_deref(),
            Some("job-item-2-2")
        );
        assert_eq!(
            cache.completed_slices("group-1").into_iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn switching_slices_drops_pending_advance() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::Completed, Some(JobStatus::Completed)));
        backend.set_layers(layers(1, 1, WorkStatus::Completed));
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-1");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1, 2, 3]),
            Some(1),
        );
        wait_for(&handle, |s| s.completed_slices.contains(&1)).await;
        handle.select_slice(3).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = handle.current();
        assert_eq!(state.active_slice, Some(3));
        assert!(state.layers.is_empty());
        assert!(state.logs.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pull_request_outcome_is_notified_once() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::Completed, Some(JobStatus::Completed)));
        let mut with_pr = snapshot(JobStatus::Completed, Some(JobStatus::Completed));
        with_pr.pr_status = Some(tracker_types::PrStatus::Completed);
        with_pr.pr_url = Some("https://example.test/pr/1".to_string());
        backend.push_status(with_pr);
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-pr");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        let mut notifications = handle.subscribe_notifications();
        wait_for(&handle, |s| s.snapshot.is_some()).await;
        handle.create_pull_request().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let created: Vec<_> = drain(&mut notifications)
            .into_iter()
            .filter(|n| matches!(n, Notification::PullRequestCreated { .. }))
            .collect();
        assert_eq!(
            created,
            vec![Notification::PullRequestCreated {
                url: "https://example.test/pr/1".to_string()
            }]
        );
        assert_eq!(backend.pr_calls.load(Ordering::SeqCst), 1);
        assert!(!handle.current().pr_watching);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stream_falls_back_to_polled_activity() {
        let backend = ScriptedBackend::new();
        let mut running = snapshot(JobStatus::InProgress, Some(JobStatus::InProgress));
        running.agent_activity.push(AgentActivity {
            tool: "read_file".to_string(),
            params: Some(json!("src/lib.rs")),
            layer_order: Some(1),
            task_index: Some(0),
            timestamp: None,
        });
        backend.push_status(running);
        backend.push_stream(
            vec![
                StreamEvent::Chunk {
                    content: "half".to_string(),
                },
                StreamEvent::Error { message: None },
            ],
            false,
        );
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-err");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        tokio::time::sleep(Duration::from_secs(20)).await;

        let state = handle.current();
        assert!(!state.streaming);
        assert!(!state.timeline.is_live());
        match state.timeline.entries() {
            [TimelineEntry::Tool { label, .. }] => assert_eq!(label, "read_file"),
            other => panic!("unexpected timeline: {other:?}"),
        }
        assert_eq!(backend.stream_connects.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_failure_keeps_state_and_retries() {
        let backend = ScriptedBackend::new();
        let mut planning = snapshot(JobStatus::InProgress, Some(JobStatus::InProgress));
        planning.current_step = Some("planning".to_string());
        let mut coding = planning.clone();
        coding.current_step = Some("codegen".to_string());
        backend.push_status(planning);
        backend.push_status_error();
        backend.push_status(coding);
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-flaky");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1]),
            Some(1),
        );
        tokio::time::sleep(Duration::from_millis(4500)).await;

        let state = handle.current();
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 2);
        assert!(state.polling);
        let step = state.snapshot.as_ref().and_then(|s| s.current_step.clone());
        assert_eq!(step.as_deref(), Some("planning"));

        let state = wait_for(&handle, |s| {
            s.snapshot
                .as_ref()
                .is_some_and(|snap| snap.current_step.as_deref() == Some("codegen"))
        })
        .await;
        assert!(state.polling);
        assert_eq!(backend.status_calls.load(Ordering::SeqCst), 3);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_reopens_when_the_job_changes() {
        let backend = ScriptedBackend::new();
        backend.push_status(snapshot(JobStatus::InProgress, Some(JobStatus::InProgress)));
        backend.push_stream(
            vec![StreamEvent::Chunk {
                content: "from a".to_string(),
            }],
            true,
        );
        backend.push_stream(
            vec![StreamEvent::Chunk {
                content: "from b".to_string(),
            }],
            true,
        );
        let cache = SessionCache::in_memory();
        cache.remember_job("plan-1", 1, "job-a");
        cache.remember_job("plan-1", 2, "job-b");

        let handle = TrackerEngine::spawn(
            EngineConfig::default(),
            backend.clone(),
            cache,
            plan(&[1, 2]),
            Some(1),
        );
        wait_for(&handle, |s| s.streaming && !s.timeline.entries().is_empty()).await;
        handle.select_slice(2).await.unwrap();

        let state = wait_for(&handle, |s| {
            s.job_id.as_deref() == Some("job-b") && s.streaming && !s.timeline.entries().is_empty()
        })
        .await;
        assert_eq!(backend.stream_connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            state.timeline.entries(),
            &[TimelineEntry::Text {
                content: "from b".to_string()
            }]
        );
        handle.shutdown().await;
    }
}
