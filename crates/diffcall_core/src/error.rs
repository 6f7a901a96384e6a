//! Failure taxonomy for the custom-call boundary.

use thiserror::Error;

use crate::registry::CallbackMode;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Every way a single custom call can fail. None of these are recovered
/// inside the bridge; they surface at the entry point.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no {mode} callback is registered")]
    UnregisteredCallback { mode: CallbackMode },

    #[error("shape mismatch in {context}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("argument {position} (`{name}`) of `{target}` is a null address")]
    NullArgument {
        target: &'static str,
        position: usize,
        name: &'static str,
    },

    #[error("extent `{name}` of `{target}` is negative ({value})")]
    NegativeExtent {
        target: &'static str,
        name: &'static str,
        value: i64,
    },

    #[error("extents of `{target}` describe more than {max} elements")]
    ExtentOverflow { target: &'static str, max: usize },

    #[error("parameter index {index} is out of range (expected 0..{count})")]
    InvalidParameterIndex { index: i64, count: usize },

    #[error("{mode} callback failed: {source:#}")]
    Callback {
        mode: CallbackMode,
        #[source]
        source: anyhow::Error,
    },

    #[error("{mode} callback panicked: {message}")]
    Panicked { mode: CallbackMode, message: String },
}

/// Status values written by the status-returning entry points.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    UnregisteredCallback = 1,
    ShapeMismatch = 2,
    InvalidArgument = 3,
    CallbackFailed = 4,
    Panicked = 5,
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::UnregisteredCallback { .. } => StatusCode::UnregisteredCallback,
            BridgeError::ShapeMismatch { .. } => StatusCode::ShapeMismatch,
            BridgeError::NullArgument { .. }
            | BridgeError::NegativeExtent { .. }
            | BridgeError::ExtentOverflow { .. }
            | BridgeError::InvalidParameterIndex { .. } => StatusCode::InvalidArgument,
            BridgeError::Callback { .. } => StatusCode::CallbackFailed,
            BridgeError::Panicked { .. } => StatusCode::Panicked,
        }
    }

    pub(crate) fn shape(context: &'static str, expected: usize, actual: usize) -> Self {
        BridgeError::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }
}

/// Converts a `catch_unwind` payload into a printable message.
pub fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
