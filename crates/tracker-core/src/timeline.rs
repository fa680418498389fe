use std::sync::Arc;

use serde_json::Value;
use tracker_types::{AgentActivity, JobSnapshot, StreamEvent, TimelineEntry, ToolCallStatus};

/// Timeline assembled from live stream events, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveTimeline {
    entries: Vec<TimelineEntry>,
}

impl LiveTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TimelineEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Applies one event. Returns `true` when the event closes the connection.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Chunk { content } => {
                self.append_text(content);
                false
            }
            StreamEvent::ToolCallStart { tool, call_id } => {
                let id = call_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4()));
                self.entries.push(TimelineEntry::Tool {
                    id,
                    label: tool.clone(),
                    status: ToolCallStatus::Running,
                    detail: None,
                    result: None,
                });
                false
            }
            StreamEvent::ToolCallEnd {
                tool,
                call_id,
                result,
            } => {
                self.finish_tool_call(tool, call_id.as_deref(), result.as_ref());
                false
            }
            StreamEvent::End | StreamEvent::Error { .. } => true,
        }
    }

    fn append_text(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        if let Some(TimelineEntry::Text { content: last }) = self.entries.last_mut() {
            last.push_str(content);
            return;
        }
        self.entries.push(TimelineEntry::Text {
            content: content.to_string(),
        });
    }

    fn finish_tool_call(&mut self, tool: &str, call_id: Option<&str>, result: Option<&Value>) {
        let by_id = call_id.filter(|id| !id.trim().is_empty()).and_then(|wanted| {
            self.entries.iter().rposition(|entry| {
                matches!(entry, TimelineEntry::Tool { id, status: ToolCallStatus::Running, .. } if id == wanted)
            })
        });
        let index = by_id.or_else(|| {
            self.entries.iter().rposition(|entry| {
                matches!(entry, TimelineEntry::Tool { label, status: ToolCallStatus::Running, .. } if label == tool)
            })
        });

        let Some(index) = index else {
            tracing::debug!("Ignoring tool_call_end without a running call ({})", tool);
            return;
        };
        if let TimelineEntry::Tool {
            status,
            result: slot,
            ..
        } = &mut self.entries[index]
        {
            *status = ToolCallStatus::Done;
            *slot = result.and_then(format_tool_result);
        }
    }
}

/// Structured results are pretty-printed; strings are kept verbatim.
fn format_tool_result(result: &Value) -> Option<String> {
    match result {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(_) | Value::Array(_) => {
            Some(serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string()))
        }
        other => Some(other.to_string()),
    }
}

/// One done tool row per polled activity record.
pub fn reconstruct_from_activity(
    activity: &[AgentActivity],
    preview_chars: usize,
) -> Vec<TimelineEntry> {
    activity
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let mut parts = Vec::new();
            if let Some(preview) = params_preview(record.params.as_ref(), preview_chars) {
                parts.push(preview);
            }
            match (record.layer_order, record.task_index) {
                (Some(layer), Some(task)) => parts.push(format!("Phase {} · Task {}", layer, task + 1)),
                (Some(layer), None) => parts.push(format!("Phase {}", layer)),
                (None, Some(task)) => parts.push(format!("Task {}", task + 1)),
                (None, None) => {}
            }
            TimelineEntry::Tool {
                id: format!("activity-{}", index),
                label: record.tool.clone(),
                status: ToolCallStatus::Done,
                detail: if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(" · "))
                },
                result: None,
            }
        })
        .collect()
}

fn params_preview(params: Option<&Value>, max_chars: usize) -> Option<String> {
    let raw = match params? {
        Value::Null => return None,
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let raw = raw.trim();
    if raw.is_empty() || max_chars == 0 {
        return None;
    }
    if raw.chars().count() <= max_chars {
        return Some(raw.to_string());
    }
    let mut preview: String = raw.chars().take(max_chars).collect();
    preview.push('…');
    Some(preview)
}

/// Rows rebuilt from the activity of one snapshot, reused until a different snapshot arrives.
#[derive(Debug, Default)]
pub struct ActivityRows {
    source: Option<Arc<JobSnapshot>>,
    rows: Vec<TimelineEntry>,
}

impl ActivityRows {
    pub fn rows_for(
        &mut self,
        snapshot: Option<&Arc<JobSnapshot>>,
        preview_chars: usize,
    ) -> &[TimelineEntry] {
        let fresh = match (&self.source, snapshot) {
            (Some(seen), Some(current)) => Arc::ptr_eq(seen, current),
            (None, None) => true,
            _ => false,
        };
        if !fresh {
            self.rows = snapshot
                .map(|s| reconstruct_from_activity(&s.agent_activity, preview_chars))
                .unwrap_or_default();
            self.source = snapshot.cloned();
        }
        &self.rows
    }
}

/// The single authoritative timeline for a job at a given moment.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineView {
    Live(Vec<TimelineEntry>),
    Reconstructed(Vec<TimelineEntry>),
}

impl Default for TimelineView {
    fn default() -> Self {
        TimelineView::Reconstructed(Vec::new())
    }
}

impl TimelineView {
    /// A non-empty live timeline wins; otherwise rows are rebuilt from polled activity.
    pub fn select(live: &LiveTimeline, activity: &[AgentActivity], preview_chars: usize) -> Self {
        if !live.is_empty() {
            TimelineView::Live(live.entries().to_vec())
        } else {
            TimelineView::Reconstructed(reconstruct_from_activity(activity, preview_chars))
        }
    }

    /// Same rule as [`TimelineView::select`], reusing rows already rebuilt for `snapshot`.
    pub fn select_cached(
        live: &LiveTimeline,
        rows: &mut ActivityRows,
        snapshot: Option<&Arc<JobSnapshot>>,
        preview_chars: usize,
    ) -> Self {
        if !live.is_empty() {
            TimelineView::Live(live.entries().to_vec())
        } else {
            TimelineView::Reconstructed(rows.rows_for(snapshot, preview_chars).to_vec())
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        match self {
            TimelineView::Live(entries) | TimelineView::Reconstructed(entries) => entries,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TimelineView::Live(_))
    }
}
