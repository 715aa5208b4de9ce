use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid response for command '{command}': {response}")]
    InvalidResponse { command: String, response: String },

    #[error("no response for command '{0}'")]
    EmptyResponse(String),

    #[error("invalid connection test: {0}")]
    InvalidConnTest(String),
}
