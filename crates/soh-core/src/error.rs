use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Failed to parse HCL: {0}")]
    HclParse(String),

    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    #[error("Invalid state-of-health config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
