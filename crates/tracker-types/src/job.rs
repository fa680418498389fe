use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a task-splitting job and of its codegen sub-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "in_progress", alias = "running")]
    InProgress,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrStatus {
    #[default]
    #[serde(alias = "idle")]
    Idle,
    #[serde(alias = "in_progress")]
    InProgress,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
}

/// One tool invocation recorded by the backend agent, as reported through status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    #[serde(alias = "tool_name")]
    pub tool: String,
    #[serde(default, alias = "parameters", alias = "args")]
    pub params: Option<Value>,
    #[serde(default, alias = "phase")]
    pub layer_order: Option<u32>,
    #[serde(default, alias = "task")]
    pub task_index: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Polled job state. Field names follow the backend status payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(default)]
    pub codegen_status: Option<JobStatus>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub pr_status: Option<PrStatus>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_error_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub agent_activity: Vec<AgentActivity>,
}

impl JobSnapshot {
    pub fn new(status: JobStatus, codegen_status: Option<JobStatus>) -> Self {
        Self {
            status,
            codegen_status,
            current_step: None,
            pr_status: None,
            pr_url: None,
            pr_error_message: None,
            error_message: None,
            agent_activity: Vec::new(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == JobStatus::InProgress || self.codegen_status == Some(JobStatus::InProgress)
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed || self.codegen_status == Some(JobStatus::Failed)
    }

    pub fn codegen_completed(&self) -> bool {
        self.codegen_status == Some(JobStatus::Completed)
    }

    pub fn error_text(&self) -> Option<&str> {
        self.error_message
            .as_deref()
            .map(str::trim)
            .filter(|msg| !msg.is_empty())
    }

    pub fn pr_url_text(&self) -> Option<&str> {
        self.pr_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub plan_item_id: String,
    pub recipe_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}
