//! The [`Steward`] facade.
//!
//! Callers hold a cheap clonable handle; all port traffic happens on the
//! worker task it supervises. The facade translates method calls into
//! directives and command transactions, correlates their replies, and keeps
//! a watchdog running that rebuilds the worker when the device or the task
//! itself goes away.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::StewardConfig;
use crate::error::{Result, StewardError};
use crate::link::{ExceptionSlot, SubmitError};
use crate::message::{Command, Directive, DirectiveValue, Response};
use crate::transport::{SerialTransportFactory, TransportFactory};
use crate::watchdog;
use crate::worker::{self, DirectiveRequester, WorkerHandle};

/// How long a graceful quit may take before the worker task is aborted.
const QUIT_GRACE: Duration = Duration::from_millis(500);

/// Supervisory handle for one serial-line device.
///
/// Cloning shares the underlying worker and watchdog. The facade never
/// touches the port itself; [`connect`](Self::connect) spawns a worker that
/// owns the transport exclusively, and every method here is a conversation
/// with that worker.
pub struct Steward {
    inner: Arc<StewardInner>,
}

impl Clone for Steward {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Steward {
    /// Create a steward for a real serial port.
    pub fn new(config: StewardConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(SerialTransportFactory))
    }

    /// Create a steward with a custom transport factory.
    pub fn with_factory(config: StewardConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(StewardInner {
                config,
                factory,
                worker: tokio::sync::Mutex::new(None),
                watchdog: parking_lot::Mutex::new(None),
                connected: AtomicBool::new(false),
                cached_monitoring: AtomicBool::new(false),
                cached_locked: AtomicBool::new(false),
                command_in_flight: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
            }),
        })
    }

    /// The configuration this steward was built with.
    pub fn config(&self) -> &StewardConfig {
        &self.inner.config
    }

    /// Spawn a worker, open the port, and start the watchdog.
    ///
    /// Any previous worker is torn down first, so calling this on an
    /// already-connected steward reconnects from scratch.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        // Clear the intent first so the watchdog stands down while the old
        // worker goes away and the new one comes up.
        inner.connected.store(false, Ordering::SeqCst);
        let (requester, exceptions) = {
            let mut slot = inner.worker.lock().await;
            inner.teardown_worker(&mut slot).await;
            let handle = worker::spawn(inner.config.clone(), Arc::clone(&inner.factory));
            let channel = (handle.directives.clone(), Arc::clone(&handle.exceptions));
            *slot = Some(handle);
            channel
        };
        ensure_watchdog(inner);

        inner
            .send_directive(&requester, &exceptions, Directive::Connected(Some(true)))
            .await?;
        inner.connected.store(true, Ordering::SeqCst);
        inner.restore_flags(&requester, &exceptions).await;
        tracing::info!(port = %inner.config.port, "steward connected");
        Ok(())
    }

    /// Close the port and stop the worker and watchdog. Idempotent.
    ///
    /// A failure to disconnect gracefully is reported, but the worker is
    /// torn down regardless.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);

        let mut graceful = Ok(());
        if let Ok((requester, exceptions)) = inner.directive_channel().await {
            graceful = inner
                .send_directive(&requester, &exceptions, Directive::Connected(Some(false)))
                .await
                .map(|_| ());
        }

        {
            let mut slot = inner.worker.lock().await;
            inner.teardown_worker(&mut slot).await;
        }
        if let Some(handle) = inner.watchdog.lock().take() {
            handle.abort();
        }
        inner.cached_monitoring.store(false, Ordering::SeqCst);
        inner.cached_locked.store(false, Ordering::SeqCst);
        tracing::info!(port = %inner.config.port, "steward disconnected");
        graceful
    }

    /// Tear everything down, swallowing a graceful-disconnect failure.
    /// Useful on exit paths where the error has nowhere to go.
    pub async fn shutdown(&self) {
        if let Err(err) = self.disconnect().await {
            tracing::warn!(error = %err, "graceful disconnect failed during shutdown");
        }
    }

    /// True when a worker is serving requests and holds an open port.
    pub async fn connected(&self) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        matches!(
            self.inner.directive(Directive::Connected(None)).await,
            Ok(DirectiveValue::Bool(true))
        )
    }

    /// Run one transaction: the commands execute back-to-back with nothing
    /// interleaved. Returns one response per command, in order.
    ///
    /// Fails fast with [`StewardError::DeviceBusy`] when another transaction
    /// is outstanding, and with [`StewardError::CommandFailed`] when any
    /// command in the list faulted (the full response list rides along).
    pub async fn command(&self, commands: &[Command]) -> Result<Vec<Response>> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            return Err(StewardError::NotConnected);
        }
        let (requester, exceptions) = {
            let slot = inner.worker.lock().await;
            match slot.as_ref() {
                Some(handle) if handle.is_alive() => {
                    (handle.commands.clone(), Arc::clone(&handle.exceptions))
                }
                _ => return Err(StewardError::WorkerUnavailable),
            }
        };
        // The precondition checks come first: an empty transaction is a
        // no-op only on a live connection.
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let Some(_in_flight) = InFlightGuard::acquire(&inner.command_in_flight) else {
            tracing::warn!(count = commands.len(), "transaction rejected, device busy");
            return Err(StewardError::DeviceBusy);
        };
        let _outstanding = OutstandingGuard::new(&inner.outstanding);
        let rx = match requester.try_submit(commands.to_vec()) {
            Ok(rx) => rx,
            Err(SubmitError::Busy) => return Err(StewardError::DeviceBusy),
            Err(SubmitError::Gone) => return Err(StewardError::WorkerUnavailable),
        };
        let responses = match rx.await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(exceptions.take().unwrap_or(StewardError::WorkerUnavailable)),
        };
        raise_first_fault(responses)
    }

    /// The most recent autonomous status report, waiting up to the
    /// configured `status_wait` for the first one after enabling monitoring.
    pub async fn status(&self) -> Result<Vec<Response>> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            return Err(StewardError::NotConnected);
        }
        if !inner.cached_monitoring.load(Ordering::SeqCst) {
            return Err(StewardError::NotMonitoring);
        }
        let mut status = {
            let slot = inner.worker.lock().await;
            match slot.as_ref() {
                Some(handle) if handle.is_alive() => handle.status.clone(),
                _ => return Err(StewardError::WorkerUnavailable),
            }
        };

        let _outstanding = OutstandingGuard::new(&inner.outstanding);
        let wait = inner.config.status_wait;
        let report = tokio::time::timeout(wait, async {
            loop {
                if let Some(report) = status.borrow_and_update().clone() {
                    return Ok(report);
                }
                if status.changed().await.is_err() {
                    return Err(StewardError::WorkerUnavailable);
                }
            }
        })
        .await
        .map_err(|_| StewardError::StatusTimeout(wait))??;
        raise_first_fault(report.responses)
    }

    /// Generic name-based directive entry point: an absent value is a get,
    /// a present value a set. Recognized names are `connected`, `baud_rate`,
    /// `locked`, `monitoring`, and `quit`; the value's type is checked
    /// against the name before anything reaches the worker.
    ///
    /// The typed methods on this type are usually the better interface.
    /// Note that `quit` stops the worker without clearing the connected
    /// intent, so the watchdog will rebuild it; use
    /// [`disconnect`](Self::disconnect) to stay down.
    pub async fn directive(
        &self,
        name: &str,
        value: Option<DirectiveValue>,
    ) -> Result<DirectiveValue> {
        let directive = Directive::from_parts(name, value)?;
        let outcome = self.inner.directive(directive).await?;
        // Keep the facade-side caches coherent with what the worker applied.
        match directive {
            Directive::Connected(Some(up)) => self.inner.connected.store(up, Ordering::SeqCst),
            Directive::Monitoring(Some(on)) => {
                self.inner.cached_monitoring.store(on, Ordering::SeqCst);
            }
            Directive::Locked(Some(on)) => self.inner.cached_locked.store(on, Ordering::SeqCst),
            _ => {}
        }
        Ok(outcome)
    }

    /// Whether autonomous status polling is enabled.
    pub async fn monitoring(&self) -> bool {
        match self.inner.directive(Directive::Monitoring(None)).await {
            Ok(DirectiveValue::Bool(enabled)) => enabled,
            _ => self.inner.cached_monitoring.load(Ordering::SeqCst),
        }
    }

    /// Enable or disable autonomous status polling.
    ///
    /// Takes effect immediately when connected and is remembered across
    /// reconnects either way. Enabling requires a non-empty
    /// `status_commands` list.
    pub async fn set_monitoring(&self, enabled: bool) -> Result<()> {
        let inner = &self.inner;
        if enabled && inner.config.status_commands.is_empty() {
            return Err(StewardError::Configuration(
                "monitoring requires at least one status command".into(),
            ));
        }
        if inner.connected.load(Ordering::SeqCst) {
            inner.directive(Directive::Monitoring(Some(enabled))).await?;
        }
        inner.cached_monitoring.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the caller-held exclusivity flag is set.
    pub async fn locked(&self) -> bool {
        match self.inner.directive(Directive::Locked(None)).await {
            Ok(DirectiveValue::Bool(locked)) => locked,
            _ => self.inner.cached_locked.load(Ordering::SeqCst),
        }
    }

    /// Set or clear the exclusivity flag. While locked, autonomous status
    /// polls pause and the caller's transactions have the port to themselves.
    pub async fn set_locked(&self, locked: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.connected.load(Ordering::SeqCst) {
            inner.directive(Directive::Locked(Some(locked))).await?;
        }
        inner.cached_locked.store(locked, Ordering::SeqCst);
        Ok(())
    }

    /// The transport's current baud rate. Requires a connection.
    pub async fn baud_rate(&self) -> Result<u32> {
        match self.inner.directive(Directive::BaudRate(None)).await? {
            DirectiveValue::Baud(baud) => Ok(baud),
            other => Err(StewardError::InvalidDirective(format!(
                "unexpected baud_rate reply: {other:?}"
            ))),
        }
    }

    /// Change the baud rate on the live transport. The change is serialized
    /// behind the directive channel, so it never lands mid-transaction.
    pub async fn set_baud_rate(&self, baud: u32) -> Result<()> {
        self.inner
            .directive(Directive::BaudRate(Some(baud)))
            .await
            .map(|_| ())
    }
}

pub(crate) struct StewardInner {
    pub(crate) config: StewardConfig,
    factory: Arc<dyn TransportFactory>,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Caller intent: set after a successful connect, cleared on disconnect.
    /// The watchdog only acts while this is set.
    connected: AtomicBool,
    cached_monitoring: AtomicBool,
    cached_locked: AtomicBool,
    /// Set from submission until the reply lands. This, not the channel,
    /// is what makes a concurrent transaction fail fast as busy: the
    /// channel slot frees as soon as the worker picks the request up.
    command_in_flight: AtomicBool,
    /// Tracked requests currently awaiting a reply. The watchdog leaves the
    /// exception slot alone while this is nonzero, so a request that loses
    /// its worker mid-flight gets first claim on the underlying failure.
    outstanding: AtomicUsize,
}

impl StewardInner {
    /// Clone the directive channel ends out of the worker slot.
    async fn directive_channel(&self) -> Result<(DirectiveRequester, Arc<ExceptionSlot>)> {
        let slot = self.worker.lock().await;
        match slot.as_ref() {
            Some(handle) if handle.is_alive() => {
                Ok((handle.directives.clone(), Arc::clone(&handle.exceptions)))
            }
            _ => Err(StewardError::WorkerUnavailable),
        }
    }

    async fn directive(&self, directive: Directive) -> Result<DirectiveValue> {
        let (requester, exceptions) = self.directive_channel().await?;
        self.send_directive(&requester, &exceptions, directive).await
    }

    /// Submit a directive and wait for its reply, logging progress at each
    /// `directive_log_interval` rather than giving up: connect retries can
    /// legitimately hold the worker for a long time.
    async fn send_directive(
        &self,
        requester: &DirectiveRequester,
        exceptions: &ExceptionSlot,
        directive: Directive,
    ) -> Result<DirectiveValue> {
        let _outstanding = OutstandingGuard::new(&self.outstanding);
        let mut rx = requester
            .submit(directive)
            .await
            .map_err(|_| StewardError::WorkerUnavailable)?;
        loop {
            match tokio::time::timeout(self.config.directive_log_interval, &mut rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => {
                    // Worker died before replying; the cause, if recorded,
                    // is in the exception slot.
                    return Err(exceptions.take().unwrap_or(StewardError::WorkerUnavailable));
                }
                Err(_) => {
                    tracing::info!(directive = directive.name(), "directive still pending");
                }
            }
        }
    }

    /// Re-apply remembered flags to a fresh worker. Failures are logged,
    /// not raised: the connection itself is already up.
    async fn restore_flags(&self, requester: &DirectiveRequester, exceptions: &ExceptionSlot) {
        if self.cached_monitoring.load(Ordering::SeqCst) {
            if let Err(err) = self
                .send_directive(requester, exceptions, Directive::Monitoring(Some(true)))
                .await
            {
                tracing::warn!(error = %err, "could not restore monitoring");
            }
        }
        if self.cached_locked.load(Ordering::SeqCst) {
            if let Err(err) = self
                .send_directive(requester, exceptions, Directive::Locked(Some(true)))
                .await
            {
                tracing::warn!(error = %err, "could not restore lock");
            }
        }
    }

    /// Quit the current worker, aborting it if the grace period lapses.
    async fn teardown_worker(&self, slot: &mut Option<WorkerHandle>) {
        let Some(handle) = slot.take() else { return };
        if !handle.is_alive() {
            handle.abort();
            return;
        }
        match handle.directives.try_submit(Directive::Quit) {
            Ok(rx) => {
                if tokio::time::timeout(QUIT_GRACE, rx).await.is_err() {
                    tracing::warn!("worker ignored quit, aborting task");
                    handle.abort();
                }
            }
            Err(_) => handle.abort(),
        }
    }

    /// Tear down and respawn the worker, then restore the device-facing
    /// state the caller had established. Called by the watchdog; the
    /// watchdog task itself is left untouched.
    pub(crate) async fn rebuild(self: &Arc<Self>) {
        let (requester, exceptions) = {
            let mut slot = self.worker.lock().await;
            self.teardown_worker(&mut slot).await;
            let handle = worker::spawn(self.config.clone(), Arc::clone(&self.factory));
            let channel = (handle.directives.clone(), Arc::clone(&handle.exceptions));
            *slot = Some(handle);
            channel
        };
        match self
            .send_directive(&requester, &exceptions, Directive::Connected(Some(true)))
            .await
        {
            Ok(_) => {
                tracing::info!(port = %self.config.port, "worker rebuilt and reconnected");
                self.restore_flags(&requester, &exceptions).await;
            }
            Err(err) => {
                // Leave `connected` intent set; the watchdog will try again
                // on a later tick.
                tracing::error!(port = %self.config.port, error = %err, "reconnect failed");
            }
        }
    }

    /// One watchdog tick: detect a dead worker or a lost port and rebuild.
    pub(crate) async fn watchdog_tick(self: &Arc<Self>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }

        let snapshot = {
            let slot = self.worker.lock().await;
            slot.as_ref().map(|handle| {
                (
                    handle.is_alive(),
                    Arc::clone(&handle.exceptions),
                    *handle.connection.borrow(),
                )
            })
        };
        let Some((alive, exceptions, state)) = snapshot else {
            return;
        };

        if !alive {
            tracing::warn!(port = %self.config.port, "worker task died, rebuilding");
            self.rebuild().await;
            return;
        }

        // While a tracked request is in flight, its waiter owns any failure
        // reporting; check again next tick.
        if self.outstanding.load(Ordering::SeqCst) != 0 {
            return;
        }

        let mut port_gone = false;
        for err in exceptions.drain() {
            tracing::error!(port = %self.config.port, error = %err, "device fault outside any request");
            if err.is_port_disconnected() {
                port_gone = true;
            }
        }
        if port_gone || state == crate::message::ConnectionState::Disconnected {
            tracing::warn!(port = %self.config.port, "port lost, reconnecting");
            self.rebuild().await;
        }
    }
}

impl Drop for StewardInner {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.get_mut().take() {
            handle.abort();
        }
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

/// Start the watchdog unless one is already ticking.
fn ensure_watchdog(inner: &Arc<StewardInner>) {
    let mut slot = inner.watchdog.lock();
    let stale = slot.as_ref().map_or(true, |handle| handle.is_finished());
    if stale {
        *slot = Some(watchdog::spawn(
            Arc::downgrade(inner),
            inner.config.watchdog_period,
        ));
    }
}

/// Promote the first faulted response, if any, to a transaction error
/// carrying the complete response list.
fn raise_first_fault(responses: Vec<Response>) -> Result<Vec<Response>> {
    let first_fault = responses.iter().enumerate().find_map(|(index, response)| {
        match &response.value {
            Err(fault) => Some((index, fault.clone())),
            Ok(_) => None,
        }
    });
    match first_fault {
        Some((index, fault)) => Err(StewardError::CommandFailed {
            index,
            fault,
            responses,
        }),
        None => Ok(responses),
    }
}

/// Holds the in-flight flag for the duration of one transaction.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct OutstandingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> OutstandingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceFault, TransportErrorKind};

    #[test]
    fn first_fault_wins_and_keeps_all_responses() {
        let responses = vec![
            Response::ok("fine"),
            Response::fault(DeviceFault::new(TransportErrorKind::Timeout, "no reply")),
            Response::fault(DeviceFault::new(TransportErrorKind::Read, "later")),
        ];
        match raise_first_fault(responses) {
            Err(StewardError::CommandFailed {
                index,
                fault,
                responses,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(fault.kind, TransportErrorKind::Timeout);
                assert_eq!(responses.len(), 3);
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn clean_responses_pass_through() {
        let responses = vec![Response::ok("a"), Response::empty()];
        let passed = raise_first_fault(responses).expect("no fault");
        assert_eq!(passed.len(), 2);
    }

    #[test]
    fn in_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = InFlightGuard::acquire(&flag).expect("flag free");
        assert!(InFlightGuard::acquire(&flag).is_none());
        drop(first);
        assert!(InFlightGuard::acquire(&flag).is_some());
    }

    #[test]
    fn outstanding_guard_balances_the_counter() {
        let counter = AtomicUsize::new(0);
        {
            let _a = OutstandingGuard::new(&counter);
            let _b = OutstandingGuard::new(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
