use serde::{Deserialize, Serialize};

/// Status reported for layers and tasks. Backends differ in casing, so both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    #[serde(alias = "PENDING")]
    Pending,
    #[serde(alias = "IN_PROGRESS", alias = "running")]
    InProgress,
    #[serde(alias = "COMPLETED", alias = "done")]
    Completed,
    #[serde(alias = "FAILED")]
    Failed,
    #[serde(other)]
    Unknown,
}

impl WorkStatus {
    pub fn is_completed(self) -> bool {
        self == WorkStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TestResults {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub test_results: Option<TestResults>,
}

/// One ordered phase of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub order: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Layer {
    pub fn new(order: u32, status: WorkStatus, tasks: Vec<Task>) -> Self {
        Self {
            order,
            name: None,
            status,
            tasks,
        }
    }

    /// Completed either by its own rolled-up status or because every task reports completed.
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
            || (!self.tasks.is_empty() && self.tasks.iter().all(|task| task.status.is_completed()))
    }

    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Phase {}", self.order),
        }
    }
}

impl Task {
    pub fn with_status(status: WorkStatus) -> Self {
        Self {
            id: None,
            title: None,
            status,
            changes: Vec::new(),
            logs: Vec::new(),
            test_results: None,
        }
    }
}

/// One page of the layer hierarchy; `next_layer_order` is the cursor for the following page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayersPage {
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub next_layer_order: Option<u32>,
}
