mod error;
mod http;
mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tracker_types::{JobSnapshot, LayersPage, StreamEvent};

pub use error::{BackendError, Result};
pub use http::{ClientConfig, HttpJobBackend};
pub use sse::{decode_stream_event, parse_sse_frame, push_utf8_chunk, SseFrame};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Operations the engine consumes from the job backend.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn status(&self, job_id: &str) -> Result<JobSnapshot>;

    /// One page of layers starting at layer order `start`.
    async fn items(&self, job_id: &str, start: u32, page_size: u32) -> Result<LayersPage>;

    /// Fire-and-forget; the outcome is observed through `status`.
    async fn create_pull_request(&self, job_id: &str) -> Result<()>;

    /// Returns the new job id.
    async fn submit_job(&self, plan_item_id: &str, recipe_id: &str) -> Result<String>;

    async fn connect_stream(&self, job_id: &str) -> Result<EventStream>;
}
