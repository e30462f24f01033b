// src/error.rs
// Crate-wide error enums for the module boundaries that need a closed error set.
// Call sites that aggregate several fallible steps use `anyhow::Result` instead,
// matching the teacher's mixed style.

use thiserror::Error;

/// Error raised by a single provider adapter call.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error raised by the LLM Router once every candidate provider has failed.
#[derive(Error, Debug)]
#[error("all providers exhausted, last error: {last_error}")]
pub struct AllProvidersExhausted {
    pub last_error: String,
}

/// Error raised by the Improvement Queue's persistence layer.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Error raised by the Evolution Engine's planning step.
#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("could not parse LLM plan as JSON: {0}")]
    InvalidJson(String),
    #[error("plan had no changes")]
    EmptyPlan,
    #[error("plan marked high risk: {0}")]
    HighRisk(String),
}

/// Trait for converting foreign errors into this crate's error vocabulary,
/// matching `backend/src/git/error.rs`'s `IntoGitError` pattern.
pub trait IntoProviderError {
    fn into_provider_error(self) -> ProviderError;
}

impl IntoProviderError for reqwest::Error {
    fn into_provider_error(self) -> ProviderError {
        if self.is_timeout() || self.is_connect() {
            return ProviderError::Transient(self.to_string());
        }
        if let Some(status) = self.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return ProviderError::Transient(format!("{status}: {self}"));
            }
        }
        ProviderError::Permanent(self.to_string())
    }
}
