use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Why a call to the generation service failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailure {
    Timeout,
    RateLimited,
    Malformed,
    Unavailable,
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GenerationFailure::Timeout => "timeout",
            GenerationFailure::RateLimited => "rate limited",
            GenerationFailure::Malformed => "malformed response",
            GenerationFailure::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generation failed ({reason}): {message}")]
pub struct GenerationError {
    pub reason: GenerationFailure,
    pub message: String,
}

impl GenerationError {
    pub fn new(reason: GenerationFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Only rate limiting is worth retrying; timeouts and bad output are final.
    pub fn is_retryable(&self) -> bool {
        self.reason == GenerationFailure::RateLimited
    }
}

/// Why a call to the PR host failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFailure {
    NotFound,
    Auth,
    RateLimited,
    Conflict,
    Timeout,
    Unavailable,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostFailure::NotFound => "not found",
            HostFailure::Auth => "auth",
            HostFailure::RateLimited => "rate limited",
            HostFailure::Conflict => "conflict",
            HostFailure::Timeout => "timeout",
            HostFailure::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pr host error ({reason}): {message}")]
pub struct HostError {
    pub reason: HostFailure,
    pub message: String,
}

impl HostError {
    pub fn new(reason: HostFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("reconciliation conflict on thread {fingerprint}: stale revision")]
    ReconciliationConflict { fingerprint: String },

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("thread store error: {0}")]
    ThreadStore(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
