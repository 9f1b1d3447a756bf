use thiserror::Error;

/// Errors raised by the pure wire codec (`codec` module).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("line does not match any known shape: {0:?}")]
    InvalidLine(String),

    #[error("tag mismatch: expected {expected}, got {got}")]
    TagMismatch { expected: char, got: char },

    #[error("unrecognized device error banner: {0:?}")]
    UnknownErrorBanner(String),
}

/// Errors raised by a `Transport` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    #[error("I/O error on serial link: {0}")]
    Io(#[from] std::io::Error),
}

/// The engine's public error taxonomy, surfaced from `InstrumentController`
/// verbs. Each variant is a distinct tag per spec.md §7, not a free-form
/// string.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    #[error("I/O error on serial link: {0}")]
    SerialIo(String),

    #[error("expected MENU_PROMPT did not arrive within the timeout")]
    MenuTimeout,

    #[error("invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("device response did not parse as expected: {0}")]
    InvalidResponse(String),

    #[error("verb not legal from state {current:?}: {attempted}")]
    InvalidState {
        current: crate::reading::ControllerState,
        attempted: &'static str,
    },

    #[error("connection lost mid-session")]
    ConnectionLost,
}

impl From<CodecError> for ControllerError {
    fn from(e: CodecError) -> Self {
        ControllerError::InvalidResponse(e.to_string())
    }
}

impl From<TransportError> for ControllerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PortUnavailable(s) => ControllerError::PortUnavailable(s),
            TransportError::Io(err) => ControllerError::SerialIo(err.to_string()),
        }
    }
}

/// Errors raised by the `ChunkedRecorder`.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder filesystem error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("controller is not in an acquisition state")]
    InvalidState,

    #[error("manifest serialization failed: {0}")]
    Manifest(#[from] serde_json::Error),
}
