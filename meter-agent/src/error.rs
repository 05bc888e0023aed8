//! Error taxonomy shared by every agent component
//!
//! Each variant maps to one failure class of the gateway:
//! - `Transport`: serial bus / modem channel I/O, already retried where a budget exists
//! - `Protocol`: the device answered, but with an error or unexpected token
//! - `Parse`: malformed NMEA sentence, register block or manifest
//! - `Connectivity`: manifest or firmware fetch could not reach the server

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),
    #[error("Protocol error on `{command}`: {response}")]
    Protocol { command: String, response: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Connectivity(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
