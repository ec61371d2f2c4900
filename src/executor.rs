//! Per-transaction command execution.
//!
//! A transaction is an ordered command list run back-to-back against the
//! transport. Commands execute strictly sequentially; one command's failure
//! is recorded in its response and execution continues, so the caller always
//! gets one response per command, in order.

use std::time::Duration;

use crate::config::{StewardConfig, Validator};
use crate::error::{DeviceFault, TransportErrorKind};
use crate::message::{Command, Response};
use crate::transport::Transport;

/// The slice of configuration the executor needs, detached from the full
/// config so the worker can lend its transport mutably alongside it.
#[derive(Clone)]
pub(crate) struct TransactionOptions {
    pub inter_command_delay: Duration,
    pub settle_time: Duration,
    pub validator: Option<Validator>,
}

impl TransactionOptions {
    pub(crate) fn from_config(config: &StewardConfig) -> Self {
        Self {
            inter_command_delay: config.inter_command_delay,
            settle_time: config.settle_time,
            validator: config.validator.clone(),
        }
    }
}

/// Run one transaction. Returns exactly one response per command, in
/// submission order.
pub(crate) async fn run_transaction(
    transport: &mut dyn Transport,
    commands: &[Command],
    opts: &TransactionOptions,
) -> Vec<Response> {
    let mut responses = Vec::with_capacity(commands.len());

    for (index, command) in commands.iter().enumerate() {
        responses.push(execute_one(transport, command, opts).await);

        if index + 1 < commands.len() && !opts.inter_command_delay.is_zero() {
            tokio::time::sleep(opts.inter_command_delay).await;
        }
    }

    responses
}

async fn execute_one(
    transport: &mut dyn Transport,
    command: &Command,
    opts: &TransactionOptions,
) -> Response {
    // Stale bytes from a previous exchange must not be mistaken for this
    // command's reply.
    let _ = transport.drain_input().await;

    if let Err(err) = transport.write_line(&command.payload).await {
        tracing::debug!(payload = %command.payload, error = %err, "command write failed");
        return Response::fault(err.into_fault());
    }

    if !command.expects_reply {
        return Response::empty();
    }

    if !opts.settle_time.is_zero() {
        tokio::time::sleep(opts.settle_time).await;
    }

    let line = match transport.read_line().await {
        Ok(line) => line,
        Err(err) => {
            tracing::debug!(payload = %command.payload, error = %err, "command read failed");
            return Response::fault(err.into_fault());
        }
    };

    if let Some(validator) = &opts.validator {
        if let Err(reason) = validator(&line) {
            tracing::debug!(payload = %command.payload, reply = %line, %reason, "reply failed validation");
            return Response::fault(DeviceFault::new(TransportErrorKind::Read, reason));
        }
    }

    Response::ok(line)
}
