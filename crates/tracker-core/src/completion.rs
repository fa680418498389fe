use std::collections::BTreeSet;
use std::time::Duration;

use tracker_types::{Layer, Slice, SliceState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionCommand {
    AppendLog(String),
    MarkSliceCompleted(u32),
    ScheduleAdvance { slice: u32, after: Duration },
    StopRun,
}

/// Inputs for one completion check of the active slice.
pub struct CompletionCheck<'a> {
    pub slice: u32,
    pub layers: &'a [Layer],
    pub completed: &'a BTreeSet<u32>,
    pub slices: &'a [Slice],
    pub advance_delay: Duration,
}

/// Every layer of the job is done, by rolled-up or per-task status.
pub fn job_layers_complete(layers: &[Layer]) -> bool {
    !layers.is_empty() && layers.iter().all(Layer::is_completed)
}

/// The slice ordered right after `current` by item number.
pub fn next_slice(slices: &[Slice], current: u32) -> Option<&Slice> {
    slices
        .iter()
        .filter(|slice| slice.item_number > current)
        .min_by_key(|slice| slice.item_number)
}

/// Runs on every poll tick. Emits the one-time completion commands only while the slice is not
/// yet recorded in `completed`, so repeated ticks after completion produce nothing.
pub fn evaluate_completion(check: CompletionCheck<'_>) -> Vec<CompletionCommand> {
    if check.completed.contains(&check.slice) || !job_layers_complete(check.layers) {
        return Vec::new();
    }

    let mut commands = vec![
        CompletionCommand::AppendLog(format!(
            "✓ Slice {} completed ({} phases)",
            check.slice,
            check.layers.len()
        )),
        CompletionCommand::MarkSliceCompleted(check.slice),
    ];
    match next_slice(check.slices, check.slice) {
        Some(next) => commands.push(CompletionCommand::ScheduleAdvance {
            slice: next.item_number,
            after: check.advance_delay,
        }),
        None => commands.push(CompletionCommand::StopRun),
    }
    commands
}

pub fn slice_state(
    slice: u32,
    active: Option<u32>,
    running: bool,
    completed: &BTreeSet<u32>,
) -> SliceState {
    if completed.contains(&slice) {
        SliceState::Completed
    } else if active == Some(slice) && running {
        SliceState::Running
    } else {
        SliceState::Pending
    }
}
