//! Construction-time configuration.
//!
//! A device is described by a [`StewardConfig`], built either in code with
//! the `with_*` builder methods or declared in TOML:
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! terminator = "cr"
//! read_timeout = "1s"
//! status_interval = "2s"
//! status_commands = [{ payload = "ST?", expects_reply = true }]
//! ```
//!
//! Callback fields (reply validator, port conditioner) cannot come from a
//! file and are attached in code.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::{Result, StewardError};
use crate::message::Command;
use crate::transport::Transport;

/// Line terminator style for commands and replies.
///
/// Unterminated (binary streaming) mode is unsupported; every dialect this
/// driver speaks is line-framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    /// Carriage return (`\r`).
    Cr,
    /// Line feed (`\n`).
    Lf,
    /// Carriage return + line feed (`\r\n`).
    CrLf,
    /// Line feed + carriage return (`\n\r`).
    LfCr,
}

impl LineTerminator {
    /// The terminator bytes as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cr => "\r",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::LfCr => "\n\r",
        }
    }

    /// The byte that marks the end of an incoming reply (the terminator's
    /// final byte).
    pub fn delimiter(&self) -> u8 {
        match self {
            Self::Cr | Self::LfCr => b'\r',
            Self::Lf | Self::CrLf => b'\n',
        }
    }
}

impl FromStr for LineTerminator {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CR" => Ok(Self::Cr),
            "LF" => Ok(Self::Lf),
            "CR/LF" | "CRLF" => Ok(Self::CrLf),
            "LF/CR" | "LFCR" => Ok(Self::LfCr),
            other => Err(StewardError::Configuration(format!(
                "unknown line terminator '{other}' (expected CR, LF, CR/LF or LF/CR)"
            ))),
        }
    }
}

/// Reply validator callback. Invoked on each reply after terminator
/// stripping; an `Err` becomes that command's fault response.
pub type Validator = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Port-conditioning callback, invoked once on the freshly opened transport
/// after a successful connect (e.g. a wake-up or mode-select exchange).
pub type Conditioner =
    Arc<dyn for<'a> Fn(&'a mut dyn Transport) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

fn default_baud() -> u32 {
    115_200
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_inter_command_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_connect_retries() -> Option<u32> {
    Some(3)
}

fn default_connect_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_idle_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_status_wait() -> Duration {
    Duration::from_secs(2)
}

fn default_directive_log_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_period() -> Duration {
    Duration::from_secs(1)
}

/// Full configuration for one supervised device.
#[derive(Clone, Deserialize)]
pub struct StewardConfig {
    /// Serial port path (e.g. `/dev/ttyUSB0`, `COM3`). Required; must name
    /// a port known to the system.
    pub port: String,

    /// Baud rate. Default 115200.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,

    /// Line terminator style. Required; there is no unterminated mode.
    pub terminator: LineTerminator,

    /// Per-read reply timeout.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Minimum quiet time between autonomous status polls.
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,

    /// Delay between consecutive commands of one transaction.
    #[serde(with = "humantime_serde", default = "default_inter_command_delay")]
    pub inter_command_delay: Duration,

    /// Settle time between writing a command and reading its reply.
    #[serde(with = "humantime_serde", default)]
    pub settle_time: Duration,

    /// Maximum connect attempts; `None` retries forever.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: Option<u32>,

    /// Delay between connect attempts.
    #[serde(with = "humantime_serde", default = "default_connect_retry_delay")]
    pub connect_retry_delay: Duration,

    /// End-of-loop yield delay for the worker when idle.
    #[serde(with = "humantime_serde", default = "default_idle_delay")]
    pub idle_delay: Duration,

    /// Commands issued autonomously while monitoring and idle. Enabling
    /// monitoring with this list empty is a configuration error.
    #[serde(default)]
    pub status_commands: Vec<Command>,

    /// How long a status read waits for a report before timing out.
    #[serde(with = "humantime_serde", default = "default_status_wait")]
    pub status_wait: Duration,

    /// How often a still-pending directive wait logs progress.
    #[serde(with = "humantime_serde", default = "default_directive_log_interval")]
    pub directive_log_interval: Duration,

    /// Watchdog tick period.
    #[serde(with = "humantime_serde", default = "default_watchdog_period")]
    pub watchdog_period: Duration,

    /// Reply validator; attached in code.
    #[serde(skip)]
    pub validator: Option<Validator>,

    /// Port-conditioning callback; attached in code.
    #[serde(skip)]
    pub conditioner: Option<Conditioner>,
}

impl StewardConfig {
    /// Create a configuration with defaults for everything but the two
    /// required fields.
    pub fn new(port: impl Into<String>, terminator: LineTerminator) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud(),
            terminator,
            read_timeout: default_read_timeout(),
            status_interval: default_status_interval(),
            inter_command_delay: default_inter_command_delay(),
            settle_time: Duration::ZERO,
            connect_retries: default_connect_retries(),
            connect_retry_delay: default_connect_retry_delay(),
            idle_delay: default_idle_delay(),
            status_commands: Vec::new(),
            status_wait: default_status_wait(),
            directive_log_interval: default_directive_log_interval(),
            watchdog_period: default_watchdog_period(),
            validator: None,
            conditioner: None,
        }
    }

    /// Parse and validate a configuration from TOML text. Callback fields
    /// stay unset and can be attached with the builder methods afterwards.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| StewardError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Set the per-read reply timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the autonomous status poll interval.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Set the delay between commands of one transaction.
    pub fn with_inter_command_delay(mut self, delay: Duration) -> Self {
        self.inter_command_delay = delay;
        self
    }

    /// Set the write-to-read settle time.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle_time = settle;
        self
    }

    /// Set the connect retry policy. `None` retries forever.
    pub fn with_connect_retries(mut self, retries: Option<u32>, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay = delay;
        self
    }

    /// Set the worker's idle yield delay.
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Set the status command list used by monitoring.
    pub fn with_status_commands(mut self, commands: Vec<Command>) -> Self {
        self.status_commands = commands;
        self
    }

    /// Set the bounded wait for status reads.
    pub fn with_status_wait(mut self, wait: Duration) -> Self {
        self.status_wait = wait;
        self
    }

    /// Set the watchdog tick period.
    pub fn with_watchdog_period(mut self, period: Duration) -> Self {
        self.watchdog_period = period;
        self
    }

    /// Attach a reply validator.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Attach a port-conditioning callback.
    pub fn with_conditioner<F>(mut self, conditioner: F) -> Self
    where
        F: for<'a> Fn(&'a mut dyn Transport) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.conditioner = Some(Arc::new(conditioner));
        self
    }

    /// Structural validation, run once at facade construction.
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(StewardError::Configuration(
                "port path must not be empty".into(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(StewardError::Configuration("baud rate must be > 0".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(StewardError::Configuration(
                "read timeout must be > 0".into(),
            ));
        }
        if matches!(self.connect_retries, Some(0)) {
            return Err(StewardError::Configuration(
                "connect retries must be >= 1 (or unbounded)".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StewardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StewardConfig")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("terminator", &self.terminator)
            .field("read_timeout", &self.read_timeout)
            .field("status_interval", &self.status_interval)
            .field("inter_command_delay", &self.inter_command_delay)
            .field("settle_time", &self.settle_time)
            .field("connect_retries", &self.connect_retries)
            .field("connect_retry_delay", &self.connect_retry_delay)
            .field("idle_delay", &self.idle_delay)
            .field("status_commands", &self.status_commands)
            .field("status_wait", &self.status_wait)
            .field("watchdog_period", &self.watchdog_period)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .field("conditioner", &self.conditioner.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
