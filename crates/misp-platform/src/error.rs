//! Error types for misp-platform

use thiserror::Error;

/// Errors that can occur while talking to the container runtime or MISP
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Docker (or the compose plugin) is not installed
    #[error("docker is not installed or not in PATH")]
    DockerNotFound,

    /// A container command exited non-zero
    #[error("command `{command}` failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A container command or health poll exceeded its deadline
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// A service reported itself unhealthy
    #[error("service {service} is unhealthy")]
    Unhealthy { service: String },

    /// No API key is available yet
    #[error("MISP API key is not available: {0}")]
    MissingApiKey(String),

    /// MISP answered with a non-success status
    #[error("MISP API {method} {path} returned {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Response body did not have the expected shape
    #[error("unexpected MISP response: {0}")]
    UnexpectedResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        PlatformError::Http(err.to_string())
    }
}
