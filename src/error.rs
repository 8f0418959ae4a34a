// src/error.rs
//
// =============================================================================
// RAILYARD: TYPED ERRORS
// =============================================================================
//
// The store and the wrapper each expose one sum-typed error enum instead of
// letting `anyhow::Error` leak past their boundary — callers (the API
// handlers, the agent's execution slot) need to match on *what* happened,
// not just print it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl StoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        // Wrap free-form internal failures (JSON decode, bad row data) the
        // same way a rusqlite error would land — both are the store's own
        // fault, not something a caller can retry around.
        StoreError::Internal(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("failed to spawn workload: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("target process {0} does not exist")]
    NoSuchProcess(i32),

    #[error("governance primitive failed: {0}")]
    Governance(String),

    #[error("workload timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("registration rejected by master: {0}")]
    RegistrationRejected(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("master reported unknown node, re-registration required")]
    UnknownNode,
}
