//! Supervisory driver for a single serial-line device.
//!
//! One [`Steward`] per device. It spawns a worker task that owns the serial
//! port exclusively and talks to it over two request channels: a control
//! plane of *directives* (connect, baud rate, lock, monitoring, quit) and a
//! data plane of *command transactions*, ordered command lists that run
//! back-to-back with nothing interleaved. Each channel admits one
//! outstanding request; a second transaction is rejected as busy rather
//! than queued. A watchdog task rebuilds the worker when the task dies or
//! the port disappears, and while monitoring is enabled the worker polls a
//! configured status transaction during idle time.
//!
//! ```no_run
//! use serial_steward::{Command, LineTerminator, Steward, StewardConfig};
//!
//! # async fn demo() -> serial_steward::Result<()> {
//! let config = StewardConfig::new("/dev/ttyUSB0", LineTerminator::Cr)
//!     .with_baud_rate(9_600)
//!     .with_status_commands(vec![Command::query("0 g r0xa0x")]);
//! let steward = Steward::new(config)?;
//! steward.connect().await?;
//!
//! let responses = steward.command(&[Command::query("0 g r0x32x")]).await?;
//! println!("amplifier state: {:?}", responses[0].value);
//!
//! steward.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod transport;

mod executor;
mod link;
mod steward;
mod watchdog;
mod worker;

pub use config::{Conditioner, LineTerminator, StewardConfig, Validator};
pub use error::{DeviceFault, Result, StewardError, TransportErrorKind};
pub use message::{Command, ConnectionState, Directive, DirectiveValue, Response};
pub use steward::Steward;
pub use transport::{SerialTransport, SerialTransportFactory, Transport, TransportFactory};
