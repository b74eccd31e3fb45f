//! Engine error taxonomy

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::{AuthorizationStatus, ErrorCode, FrameError};

/// Errors surfaced by the charge point engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Correlation id already outstanding: {0}")]
    DuplicateId(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout waiting for {action} response")]
    RequestTimeout { action: String },

    #[error("CALLERROR from central system: {code} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid endpoint URL: {0}")]
    Url(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Engine shut down")]
    Shutdown,
}

impl From<FrameError> for EngineError {
    fn from(e: FrameError) -> Self {
        EngineError::Decode(e.to_string())
    }
}

/// Failures of the start/stop sub-flows of a charging session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A charging session is already active")]
    AlreadyActive,

    #[error("No charging session is active")]
    NoActiveSession,

    #[error("Transaction id {0} does not match the active session")]
    UnknownTransaction(i64),

    #[error("Authorization refused: {0:?}")]
    NotAuthorized(AuthorizationStatus),

    #[error("Start failed: {0}")]
    StartFailed(Box<EngineError>),

    #[error("Stop failed: {0}")]
    StopFailed(Box<EngineError>),

    #[error("Session simulator stopped")]
    Shutdown,
}
