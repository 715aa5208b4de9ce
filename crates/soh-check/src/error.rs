use soh_c2::C2Error;
use soh_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SohError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("C2 error: {0}")]
    C2(#[from] C2Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("status store error: {0}")]
    Store(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("Directory error: {0}")]
    Directory(String),

    /// Per-host detail lives in the stored status.
    #[error("{0} state of health checks failed")]
    ChecksFailed(usize),

    #[error("state of health run cancelled")]
    Cancelled,
}
