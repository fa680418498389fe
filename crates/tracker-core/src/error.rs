use thiserror::Error;
use tracker_client::BackendError;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine is no longer running")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, TrackerError>;
