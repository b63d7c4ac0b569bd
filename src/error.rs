use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Account error: {0}")]
    Account(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request aborted by client")]
    Aborted,
}
impl Serialize for RelayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}
pub type RelayResult<T> = Result<T, RelayError>;
