//! Custom error types for the driver.
//!
//! This module defines the primary error type, [`StewardError`], using the
//! `thiserror` crate. Two propagation paths exist and must not be mixed:
//!
//! - Errors raised while handling a *tracked* request (a directive or a
//!   command transaction) travel back inside that request's reply and are
//!   re-raised to the original caller at the facade boundary.
//! - Errors raised outside any tracked request (autonomous status polling)
//!   are pushed to the worker's exception slot and handled solely by the
//!   watchdog: logged, and escalated to a disconnect/reconnect cycle only
//!   when they carry the distinguished port-disconnected classification.
//!
//! Per-command failures inside a transaction are *not* errors at this level;
//! they are [`DeviceFault`] values embedded in the corresponding
//! [`Response`](crate::message::Response) so that one bad command does not
//! abort the rest of the transaction.

use std::time::Duration;

use thiserror::Error;

use crate::message::Response;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, StewardError>;

/// Classification of a transport-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Opening the port failed.
    Open,
    /// A write to the port failed.
    Write,
    /// A read from the port failed.
    Read,
    /// No reply arrived within the configured read timeout.
    Timeout,
    /// Applying a port setting (baud rate, conditioning) failed.
    Configure,
    /// The port has gone away (unplugged device, closed handle). The
    /// watchdog treats this kind as grounds for a full reconnect.
    Disconnected,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Write => "write",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Configure => "configure",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A structured per-command failure carried inside a
/// [`Response`](crate::message::Response).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DeviceFault {
    /// What failed.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DeviceFault {
    /// Build a fault with the given classification.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// True when the fault indicates the port itself is gone.
    pub fn is_port_gone(&self) -> bool {
        self.kind == TransportErrorKind::Disconnected
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
/// Errors surfaced by the facade and the worker.
pub enum StewardError {
    /// Missing or invalid construction arguments, or an unknown port.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No running worker when a directive or command was attempted.
    #[error("no running worker to accept the request")]
    WorkerUnavailable,

    /// The device is not connected.
    #[error("device is not connected")]
    NotConnected,

    /// A status read was attempted while monitoring is disabled.
    #[error("monitoring is not enabled")]
    NotMonitoring,

    /// Unrecognized directive name or a set value of the wrong type.
    #[error("invalid directive: {0}")]
    InvalidDirective(String),

    /// A transport-layer failure outside any single command's response.
    #[error("transport {kind} error: {message}")]
    Transport {
        /// Failure classification.
        kind: TransportErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// A reply was rejected by the configured validator.
    #[error("reply rejected by validator: {0}")]
    Validation(String),

    /// No status report appeared within the allotted wait.
    #[error("no status report within {0:?}")]
    StatusTimeout(Duration),

    /// A command was submitted while another transaction is outstanding.
    /// Logged and returned to the caller; the pending transaction is left
    /// untouched.
    #[error("device is busy with a previous transaction")]
    DeviceBusy,

    /// One or more commands in a transaction failed. Carries the full
    /// response list so the caller can inspect every command's outcome.
    #[error("command {index} failed: {fault}")]
    CommandFailed {
        /// Index of the first failed command in the submitted list.
        index: usize,
        /// The failure recorded for that command.
        fault: DeviceFault,
        /// The complete response list, same length and order as the input.
        responses: Vec<Response>,
    },
}

impl StewardError {
    /// Build a transport error.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// True when this error indicates the port has been disconnected, the
    /// one untracked failure the watchdog escalates to a reconnect.
    pub fn is_port_disconnected(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Disconnected,
                ..
            }
        )
    }

    /// Demote this error to a per-command fault for embedding in a response.
    pub(crate) fn into_fault(self) -> DeviceFault {
        match self {
            Self::Transport { kind, message } => DeviceFault { kind, message },
            Self::Validation(message) => DeviceFault {
                kind: TransportErrorKind::Read,
                message,
            },
            other => DeviceFault {
                kind: TransportErrorKind::Read,
                message: other.to_string(),
            },
        }
    }
}

impl From<DeviceFault> for StewardError {
    fn from(fault: DeviceFault) -> Self {
        Self::Transport {
            kind: fault.kind,
            message: fault.message,
        }
    }
}

/// Map an I/O error from the port into a transport error, promoting the
/// error kinds that signal a vanished port to [`TransportErrorKind::Disconnected`].
pub(crate) fn classify_io(op: TransportErrorKind, err: &std::io::Error) -> StewardError {
    use std::io::ErrorKind;

    let kind = match err.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotFound => TransportErrorKind::Disconnected,
        ErrorKind::TimedOut => TransportErrorKind::Timeout,
        _ => op,
    };
    StewardError::transport(kind, err.to_string())
}
