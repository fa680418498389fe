use serde::{Deserialize, Serialize};

/// Top-level unit of work from an externally supplied plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub item_number: u32,
    pub plan_item_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl Slice {
    pub fn new(item_number: u32, plan_item_id: impl Into<String>) -> Self {
        Self {
            item_number,
            plan_item_id: plan_item_id.into(),
            title: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceState {
    Pending,
    Running,
    Completed,
}
