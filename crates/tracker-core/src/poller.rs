use std::sync::Arc;

use tracker_types::{JobSnapshot, PrStatus};

/// True when any field the dashboard reacts to differs. Activity is compared by length since
/// the log is append-only.
pub fn snapshot_changed(previous: &JobSnapshot, next: &JobSnapshot) -> bool {
    previous.status != next.status
        || previous.codegen_status != next.codegen_status
        || previous.current_step != next.current_step
        || previous.pr_status != next.pr_status
        || previous.pr_url != next.pr_url
        || previous.pr_error_message != next.pr_error_message
        || previous.error_message != next.error_message
        || previous.agent_activity.len() != next.agent_activity.len()
}

/// Main polling stops once both statuses are terminal, or when there is no codegen sub-run.
pub fn polling_finished(snapshot: &JobSnapshot) -> bool {
    match snapshot.codegen_status {
        None => true,
        Some(codegen) => snapshot.status.is_terminal() && codegen.is_terminal(),
    }
}

/// The pull-request watcher stops once a URL exists or creation failed.
pub fn pr_watch_finished(snapshot: &JobSnapshot) -> bool {
    snapshot.pr_url_text().is_some() || snapshot.pr_status == Some(PrStatus::Failed)
}

#[derive(Debug, Clone)]
pub enum SnapshotUpdate {
    Unchanged(Arc<JobSnapshot>),
    Changed {
        previous: Option<Arc<JobSnapshot>>,
        current: Arc<JobSnapshot>,
    },
}

impl SnapshotUpdate {
    pub fn current(&self) -> &Arc<JobSnapshot> {
        match self {
            SnapshotUpdate::Unchanged(current) => current,
            SnapshotUpdate::Changed { current, .. } => current,
        }
    }

    pub fn previous(&self) -> Option<&Arc<JobSnapshot>> {
        match self {
            SnapshotUpdate::Unchanged(current) => Some(current),
            SnapshotUpdate::Changed { previous, .. } => previous.as_ref(),
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, SnapshotUpdate::Changed { .. })
    }
}

/// Holds the latest job snapshot and only swaps the shared reference when a relevant field
/// changed, so readers can compare with `Arc::ptr_eq`.
#[derive(Debug, Default)]
pub struct SnapshotSlot {
    current: Option<Arc<JobSnapshot>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Arc<JobSnapshot>> {
        self.current.as_ref()
    }

    pub fn apply(&mut self, next: JobSnapshot) -> SnapshotUpdate {
        if let Some(current) = &self.current {
            if !snapshot_changed(current, &next) {
                return SnapshotUpdate::Unchanged(current.clone());
            }
        }
        let current = Arc::new(next);
        let previous = self.current.replace(current.clone());
        SnapshotUpdate::Changed { previous, current }
    }
}
