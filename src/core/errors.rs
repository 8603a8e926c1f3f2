// src/core/errors.rs

//! Defines the primary error type for the entire engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum VigilError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient IO error: {0}")]
    TransientIo(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("State persistence error: {0}")]
    StatePersist(String),

    #[error("Invariant violation for '{object}': {reason}")]
    InvariantViolation { object: String, reason: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Unknown object: {0}")]
    UnknownObject(String),

    #[error("Unknown attribute '{attr}' on type '{kind}'")]
    UnknownAttribute { kind: String, attr: String },

    #[error("Attribute '{0}' is config-class and immutable after load")]
    ImmutableAttribute(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for VigilError {
    fn from(err: std::io::Error) -> Self {
        VigilError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(err: serde_json::Error) -> Self {
        VigilError::Serialization(err.to_string())
    }
}

impl VigilError {
    /// Maps the error onto the process exit-code contract: `1` for configuration
    /// errors, `2` for persistent I/O failures on a critical state path, `3` for
    /// everything else that is unrecoverable.
    pub fn exit_code(&self) -> i32 {
        match self {
            VigilError::Config(_) => 1,
            VigilError::Io(_) | VigilError::StatePersist(_) => 2,
            _ => 3,
        }
    }
}
