use serde::Serialize;
use tokio::sync::broadcast;
use tracker_types::{JobSnapshot, JobStatus, Layer, PrStatus};

/// User-visible notifications (toasts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    JobFailed { message: String },
    JobCompletedWithWarnings { message: String },
    LayerAppeared { order: u32, name: String },
    PullRequestCreated { url: String },
    PullRequestFailed { message: String },
    SliceCompleted { slice: u32 },
    JobSubmitFailed { slice: u32, message: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::JobFailed { .. } => "job_failed",
            Notification::JobCompletedWithWarnings { .. } => "job_completed_with_warnings",
            Notification::LayerAppeared { .. } => "layer_appeared",
            Notification::PullRequestCreated { .. } => "pull_request_created",
            Notification::PullRequestFailed { .. } => "pull_request_failed",
            Notification::SliceCompleted { .. } => "slice_completed",
            Notification::JobSubmitFailed { .. } => "job_submit_failed",
        }
    }
}

/// Fan-out of notifications to every subscribed observer.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        tracing::debug!("notification: {:?}", notification);
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns job-state observations into notifications, each at most once per onset of its
/// condition.
#[derive(Debug, Default)]
pub struct SideEffectDispatcher {
    failure_shown: bool,
    warning_shown: bool,
    layer_baseline: Option<usize>,
    pr_attempt_open: bool,
    pr_outcome_shown: bool,
}

impl SideEffectDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything tied to the previous observing session.
    pub fn reset_session(&mut self) {
        *self = Self::default();
    }

    pub fn begin_pr_attempt(&mut self) {
        self.pr_attempt_open = true;
        self.pr_outcome_shown = false;
    }

    pub fn on_snapshot(&mut self, snapshot: &JobSnapshot) -> Vec<Notification> {
        let mut out = Vec::new();
        let error_text = snapshot.error_text();

        if snapshot.is_failed() {
            if !self.failure_shown {
                self.failure_shown = true;
                out.push(Notification::JobFailed {
                    message: error_text.unwrap_or("Job failed").to_string(),
                });
            }
        } else if error_text.is_none() {
            self.failure_shown = false;
        }

        let completed_with_warning = !snapshot.is_failed()
            && snapshot.status == JobStatus::Completed
            && error_text.is_some();
        match (completed_with_warning, error_text) {
            (true, Some(message)) if !self.warning_shown => {
                self.warning_shown = true;
                out.push(Notification::JobCompletedWithWarnings {
                    message: message.to_string(),
                });
            }
            (_, None) => self.warning_shown = false,
            _ => {}
        }

        if self.pr_attempt_open && !self.pr_outcome_shown {
            if let Some(url) = snapshot.pr_url_text() {
                self.pr_outcome_shown = true;
                out.push(Notification::PullRequestCreated {
                    url: url.to_string(),
                });
            } else if snapshot.pr_status == Some(PrStatus::Failed) {
                self.pr_outcome_shown = true;
                out.push(Notification::PullRequestFailed {
                    message: snapshot.pr_error_message.clone().unwrap_or_default(),
                });
            }
        }

        out
    }

    /// The POST that starts a pull request was itself rejected.
    pub fn on_pr_request_failed(&mut self, message: String) -> Option<Notification> {
        if !self.pr_attempt_open || self.pr_outcome_shown {
            return None;
        }
        self.pr_outcome_shown = true;
        Some(Notification::PullRequestFailed { message })
    }

    /// The first non-empty layer set only establishes the baseline.
    pub fn on_layers(&mut self, layers: &[Layer]) -> Vec<Notification> {
        let Some(baseline) = self.layer_baseline else {
            if !layers.is_empty() {
                self.layer_baseline = Some(layers.len());
            }
            return Vec::new();
        };
        if layers.len() <= baseline {
            return Vec::new();
        }
        self.layer_baseline = Some(layers.len());
        layers[baseline..]
            .iter()
            .map(|layer| Notification::LayerAppeared {
                order: layer.order,
                name: layer.display_name(),
            })
            .collect()
    }
}
