//! Data-plane and control-plane value types.
//!
//! A [`Command`] is one line written to the device; an ordered list of
//! commands forms a transaction executed back-to-back under one busy-guard
//! acquisition. A [`Directive`] is a control-plane request about the worker
//! or connection itself and is never forwarded to the device as bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeviceFault, Result, StewardError};

/// One data-plane unit: a line to write to the device, optionally awaiting
/// a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// The line to write, without the terminator (appended by the transport).
    pub payload: String,
    /// Whether a reply line should be read after writing.
    #[serde(default)]
    pub expects_reply: bool,
}

impl Command {
    /// A fire-and-forget command: write the payload, read nothing.
    pub fn write(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            expects_reply: false,
        }
    }

    /// A query: write the payload, then read one reply line.
    pub fn query(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            expects_reply: true,
        }
    }
}

/// The outcome of one [`Command`] within a transaction.
///
/// A transaction yields exactly one response per command, in submission
/// order. A failed command carries its fault here instead of aborting the
/// surrounding transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The reply line with the terminator stripped, or the recorded fault.
    /// Commands that expect no reply carry an empty value.
    pub value: std::result::Result<String, DeviceFault>,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

impl Response {
    /// A successful response carrying a reply line.
    pub fn ok(value: impl Into<String>) -> Self {
        Self {
            value: Ok(value.into()),
            timestamp: Utc::now(),
        }
    }

    /// The response for a command that expects no reply.
    pub fn empty() -> Self {
        Self::ok("")
    }

    /// A response recording a per-command failure.
    pub fn fault(fault: DeviceFault) -> Self {
        Self {
            value: Err(fault),
            timestamp: Utc::now(),
        }
    }

    /// True when this response recorded a failure.
    pub fn is_fault(&self) -> bool {
        self.value.is_err()
    }
}

/// Connection life-cycle state, owned by the worker and mirrored
/// (read-only, best-effort) to the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport open.
    #[default]
    Disconnected,
    /// A connect attempt (possibly retrying) is in progress.
    Connecting,
    /// The transport is open and configured.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// A typed directive value, for both set requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveValue {
    /// A boolean flag (connected, locked, monitoring).
    Bool(bool),
    /// A baud rate.
    Baud(u32),
    /// Acknowledgement with no payload (quit).
    Ack,
}

/// A control-plane request to the worker. An absent value is a get; a
/// present value is a set. Exactly one directive may be pending at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Query or change the connection state.
    Connected(Option<bool>),
    /// Query or change the transport baud rate.
    BaudRate(Option<u32>),
    /// Query or toggle the caller-held exclusivity flag.
    Locked(Option<bool>),
    /// Query or toggle autonomous status polling.
    Monitoring(Option<bool>),
    /// Terminate the worker loop, disconnecting first if needed.
    Quit,
}

impl Directive {
    /// The directive's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::BaudRate(_) => "baud_rate",
            Self::Locked(_) => "locked",
            Self::Monitoring(_) => "monitoring",
            Self::Quit => "quit",
        }
    }

    /// True when this directive only reads state.
    pub fn is_get(&self) -> bool {
        matches!(
            self,
            Self::Connected(None) | Self::BaudRate(None) | Self::Locked(None) | Self::Monitoring(None)
        )
    }

    /// Build a directive from a name and an optional value, validating the
    /// value's type. Unrecognized names and mistyped values are rejected
    /// with [`StewardError::InvalidDirective`].
    pub fn from_parts(name: &str, value: Option<DirectiveValue>) -> Result<Self> {
        match (name, value) {
            ("connected", None) => Ok(Self::Connected(None)),
            ("connected", Some(DirectiveValue::Bool(v))) => Ok(Self::Connected(Some(v))),
            ("baud_rate", None) => Ok(Self::BaudRate(None)),
            ("baud_rate", Some(DirectiveValue::Baud(v))) => Ok(Self::BaudRate(Some(v))),
            ("locked", None) => Ok(Self::Locked(None)),
            ("locked", Some(DirectiveValue::Bool(v))) => Ok(Self::Locked(Some(v))),
            ("monitoring", None) => Ok(Self::Monitoring(None)),
            ("monitoring", Some(DirectiveValue::Bool(v))) => Ok(Self::Monitoring(Some(v))),
            ("quit", None) => Ok(Self::Quit),
            ("connected" | "baud_rate" | "locked" | "monitoring" | "quit", Some(v)) => Err(
                StewardError::InvalidDirective(format!("'{name}' does not accept value {v:?}")),
            ),
            _ => Err(StewardError::InvalidDirective(format!(
                "unrecognized directive '{name}'"
            ))),
        }
    }
}
