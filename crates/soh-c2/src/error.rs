use thiserror::Error;

#[derive(Error, Debug)]
pub enum C2Error {
    #[error("C2 client not active for VM")]
    ClientNotActive,

    #[error("{0}")]
    ValidationFailed(String),

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("VM {0} does not exist")]
    VmNotFound(String),

    #[error("minimega error: {0}")]
    Substrate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<C2Error>,
    },
}

impl C2Error {
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        C2Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context layers.
    #[must_use]
    pub fn root(&self) -> &C2Error {
        match self {
            C2Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_client_not_active(&self) -> bool {
        matches!(self.root(), C2Error::ClientNotActive)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), C2Error::Cancelled)
    }
}
