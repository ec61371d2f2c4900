//! The worker task: sole owner of the transport.
//!
//! One worker serves one device. It loops over three sources, in strict
//! priority order: directives (control plane), then command transactions
//! (data plane), then an idle tick that may run an autonomous status poll.
//! Nothing else ever touches the port, so transaction atomicity needs no
//! locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::StewardConfig;
use crate::error::{Result, StewardError, TransportErrorKind};
use crate::executor::{run_transaction, TransactionOptions};
use crate::link::{request_slot, ExceptionSlot, Requester, Responder, StatusReport};
use crate::message::{Command, ConnectionState, Directive, DirectiveValue, Response};
use crate::transport::{Transport, TransportFactory};

pub(crate) type DirectiveRequester = Requester<Directive, Result<DirectiveValue>>;
pub(crate) type CommandRequester = Requester<Vec<Command>, Result<Vec<Response>>>;

/// Facade-side handle to a spawned worker.
pub(crate) struct WorkerHandle {
    pub directives: DirectiveRequester,
    pub commands: CommandRequester,
    pub status: watch::Receiver<Option<StatusReport>>,
    pub connection: watch::Receiver<ConnectionState>,
    pub exceptions: Arc<ExceptionSlot>,
    running: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// True while the worker task is still serving requests.
    pub(crate) fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.join.is_finished()
    }

    /// Hard-stop the worker task. Used only after a graceful quit failed.
    pub(crate) fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn a worker for the given device and hand back its facade-side ends.
pub(crate) fn spawn(config: StewardConfig, factory: Arc<dyn TransportFactory>) -> WorkerHandle {
    let (directives, directive_rx) = request_slot();
    let (commands, command_rx) = request_slot();
    let (status_tx, status) = watch::channel(None);
    let (state_tx, connection) = watch::channel(ConnectionState::Disconnected);
    let exceptions = Arc::new(ExceptionSlot::new());
    let running = Arc::new(AtomicBool::new(true));

    let worker = Worker {
        config,
        factory,
        transport: None,
        state_tx,
        status_tx,
        exceptions: Arc::clone(&exceptions),
        running: Arc::clone(&running),
        locked: false,
        monitoring: false,
        last_interaction: Instant::now(),
    };
    let join = tokio::spawn(worker.run(directive_rx, command_rx));

    WorkerHandle {
        directives,
        commands,
        status,
        connection,
        exceptions,
        running,
        join,
    }
}

struct Worker {
    config: StewardConfig,
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<Option<StatusReport>>,
    exceptions: Arc<ExceptionSlot>,
    running: Arc<AtomicBool>,
    locked: bool,
    monitoring: bool,
    last_interaction: Instant,
}

impl Worker {
    async fn run(
        mut self,
        mut directives: Responder<Directive, Result<DirectiveValue>>,
        mut commands: Responder<Vec<Command>, Result<Vec<Response>>>,
    ) {
        tracing::debug!(port = %self.config.port, "worker started");
        loop {
            tokio::select! {
                biased;

                request = directives.recv() => {
                    let Some(request) = request else { break };
                    let quit = matches!(request.payload, Directive::Quit);
                    let outcome = self.handle_directive(request.payload).await;
                    let _ = request.reply.send(outcome);
                    if quit {
                        break;
                    }
                }

                request = commands.recv() => {
                    let Some(request) = request else { break };
                    let outcome = self.handle_commands(&request.payload).await;
                    let _ = request.reply.send(outcome);
                }

                _ = tokio::time::sleep(self.config.idle_delay) => {
                    self.maybe_poll_status().await;
                }
            }
        }
        self.drop_transport();
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(port = %self.config.port, "worker stopped");
    }

    async fn handle_directive(&mut self, directive: Directive) -> Result<DirectiveValue> {
        tracing::debug!(
            directive = directive.name(),
            get = directive.is_get(),
            "handling directive"
        );
        let outcome = match directive {
            Directive::Connected(None) => Ok(DirectiveValue::Bool(self.transport.is_some())),
            Directive::Connected(Some(true)) => self
                .connect_transport()
                .await
                .map(|_| DirectiveValue::Bool(true)),
            Directive::Connected(Some(false)) => {
                self.drop_transport();
                Ok(DirectiveValue::Bool(false))
            }

            Directive::BaudRate(None) => match self.transport.as_ref() {
                Some(transport) => transport.baud_rate().map(DirectiveValue::Baud),
                None => Err(StewardError::NotConnected),
            },
            Directive::BaudRate(Some(baud)) => match self.transport.as_mut() {
                Some(transport) => match transport.set_baud_rate(baud) {
                    Ok(()) => {
                        // Keep reconnects on the new rate.
                        self.config.baud_rate = baud;
                        Ok(DirectiveValue::Baud(baud))
                    }
                    Err(err) => Err(err),
                },
                None => Err(StewardError::NotConnected),
            },

            Directive::Locked(None) => Ok(DirectiveValue::Bool(self.locked)),
            Directive::Locked(Some(locked)) => {
                self.locked = locked;
                Ok(DirectiveValue::Bool(locked))
            }

            Directive::Monitoring(None) => Ok(DirectiveValue::Bool(self.monitoring)),
            Directive::Monitoring(Some(true)) => {
                if self.config.status_commands.is_empty() {
                    Err(StewardError::Configuration(
                        "monitoring requires at least one status command".into(),
                    ))
                } else {
                    self.monitoring = true;
                    Ok(DirectiveValue::Bool(true))
                }
            }
            Directive::Monitoring(Some(false)) => {
                self.monitoring = false;
                Ok(DirectiveValue::Bool(false))
            }

            Directive::Quit => {
                self.drop_transport();
                Ok(DirectiveValue::Ack)
            }
        };
        self.last_interaction = Instant::now();
        outcome
    }

    async fn handle_commands(&mut self, commands: &[Command]) -> Result<Vec<Response>> {
        let opts = TransactionOptions::from_config(&self.config);
        let Some(transport) = self.transport.as_mut() else {
            return Err(StewardError::NotConnected);
        };
        let responses = run_transaction(transport.as_mut(), commands, &opts).await;
        self.last_interaction = Instant::now();
        self.note_port_loss(&responses);
        Ok(responses)
    }

    /// Connect with retries. Already connected is a no-op.
    async fn connect_transport(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.factory.open(&self.config).await {
                Ok(mut transport) => {
                    if let Some(conditioner) = &self.config.conditioner {
                        if let Err(err) = conditioner(transport.as_mut()).await {
                            let _ = self.state_tx.send(ConnectionState::Disconnected);
                            return Err(StewardError::transport(
                                TransportErrorKind::Configure,
                                format!("port conditioning failed: {err:#}"),
                            ));
                        }
                    }
                    self.transport = Some(transport);
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    tracing::info!(port = %self.config.port, attempt, "connected");
                    return Ok(());
                }
                Err(err) => {
                    if let Some(max) = self.config.connect_retries {
                        if attempt >= max {
                            let _ = self.state_tx.send(ConnectionState::Disconnected);
                            tracing::error!(
                                port = %self.config.port,
                                attempt,
                                error = %err,
                                "giving up on connect"
                            );
                            return Err(err);
                        }
                    }
                    tracing::warn!(
                        port = %self.config.port,
                        attempt,
                        error = %err,
                        "connect attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.connect_retry_delay).await;
                }
            }
        }
    }

    fn drop_transport(&mut self) {
        if self.transport.take().is_some() {
            tracing::info!(port = %self.config.port, "disconnected");
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        let _ = self.status_tx.send(None);
    }

    /// Run the status transaction when idle, monitoring, unlocked, and the
    /// quiet time since the last port interaction has elapsed.
    async fn maybe_poll_status(&mut self) {
        if !self.monitoring || self.locked || self.config.status_commands.is_empty() {
            return;
        }
        if self.last_interaction.elapsed() < self.config.status_interval {
            return;
        }
        let opts = TransactionOptions::from_config(&self.config);
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        let responses =
            run_transaction(transport.as_mut(), &self.config.status_commands, &opts).await;
        self.last_interaction = Instant::now();

        for response in &responses {
            if let Err(fault) = &response.value {
                tracing::debug!(fault = %fault, "status poll fault");
                if fault.is_port_gone() {
                    // Untracked failure: no caller is waiting, so it goes
                    // to the watchdog.
                    self.exceptions.push(StewardError::from(fault.clone()));
                }
            }
        }
        self.note_port_loss(&responses);
        let _ = self.status_tx.send(Some(StatusReport { responses }));
    }

    /// Drop the transport when a transaction showed the port is gone, so
    /// later requests fail fast with `NotConnected` instead of timing out.
    fn note_port_loss(&mut self, responses: &[Response]) {
        let gone = responses
            .iter()
            .any(|response| matches!(&response.value, Err(fault) if fault.is_port_gone()));
        if gone {
            tracing::warn!(port = %self.config.port, "port lost mid-transaction");
            self.drop_transport();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LineTerminator;
    use crate::transport::FramedPort;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio_test::assert_ok;

    struct EchoTransport {
        port: FramedPort<DuplexStream>,
        baud: u32,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn write_line(&mut self, payload: &str) -> Result<()> {
            self.port.write_line(payload).await
        }
        async fn read_line(&mut self) -> Result<String> {
            self.port.read_line().await
        }
        async fn drain_input(&mut self) -> usize {
            self.port.drain_input().await
        }
        fn baud_rate(&self) -> Result<u32> {
            Ok(self.baud)
        }
        fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
            self.baud = baud;
            Ok(())
        }
    }

    /// Factory that fails the first `fail_opens` attempts, then serves a
    /// device echoing `ack <payload>` to every line.
    struct EchoFactory {
        fail_opens: usize,
        opens: AtomicUsize,
    }

    impl EchoFactory {
        fn new(fail_opens: usize) -> Self {
            Self {
                fail_opens,
                opens: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransportFactory for EchoFactory {
        async fn open(&self, config: &StewardConfig) -> Result<Box<dyn Transport>> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_opens {
                return Err(StewardError::transport(
                    TransportErrorKind::Open,
                    "port refused to open",
                ));
            }
            let (device_side, host_side) = tokio::io::duplex(256);
            tokio::spawn(async move {
                let mut reader = BufReader::new(device_side);
                loop {
                    let mut buf = Vec::new();
                    match reader.read_until(b'\r', &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let reply = format!("ack {}\r", line.trim_end_matches('\r'));
                    if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(EchoTransport {
                port: FramedPort::new(
                    host_side,
                    config.terminator,
                    config.read_timeout,
                ),
                baud: config.baud_rate,
            }))
        }
    }

    fn test_config() -> StewardConfig {
        StewardConfig::new("/dev/ttyTEST0", LineTerminator::Cr)
            .with_read_timeout(Duration::from_millis(200))
            .with_connect_retries(Some(3), Duration::from_millis(5))
            .with_idle_delay(Duration::from_millis(2))
            .with_status_interval(Duration::from_millis(10))
            .with_inter_command_delay(Duration::ZERO)
    }

    async fn directive(handle: &WorkerHandle, directive: Directive) -> Result<DirectiveValue> {
        let rx = handle.directives.submit(directive).await.expect("submit");
        rx.await.expect("worker reply")
    }

    #[tokio::test]
    async fn connect_retries_until_the_port_opens() {
        let factory = Arc::new(EchoFactory::new(2));
        let handle = spawn(test_config(), Arc::clone(&factory) as Arc<dyn TransportFactory>);

        let value = directive(&handle, Directive::Connected(Some(true))).await;
        assert_eq!(value, Ok(DirectiveValue::Bool(true)));
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
        assert_eq!(*handle.connection.borrow(), ConnectionState::Connected);

        let value = directive(&handle, Directive::Connected(None)).await;
        assert_eq!(value, Ok(DirectiveValue::Bool(true)));
    }

    #[tokio::test]
    async fn connect_gives_up_after_the_retry_budget() {
        let factory = Arc::new(EchoFactory::new(10));
        let handle = spawn(test_config(), factory);

        let value = directive(&handle, Directive::Connected(Some(true))).await;
        assert!(matches!(value, Err(StewardError::Transport { .. })));
        assert_eq!(*handle.connection.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_require_a_connection() {
        let handle = spawn(test_config(), Arc::new(EchoFactory::new(0)));

        let rx = handle
            .commands
            .submit(vec![Command::query("PING?")])
            .await
            .expect("submit");
        assert_eq!(rx.await.expect("reply"), Err(StewardError::NotConnected));
    }

    #[tokio::test]
    async fn command_transaction_round_trips() {
        let handle = spawn(test_config(), Arc::new(EchoFactory::new(0)));
        assert_ok!(directive(&handle, Directive::Connected(Some(true))).await);

        let rx = handle
            .commands
            .submit(vec![Command::query("PING?"), Command::write("SET 1")])
            .await
            .expect("submit");
        let responses = rx.await.expect("reply").expect("transaction");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].value, Ok("ack PING?".to_string()));
        assert_eq!(responses[1].value, Ok(String::new()));
    }

    #[tokio::test]
    async fn conditioner_runs_once_per_connect() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&calls);
        let config = test_config().with_conditioner(move |transport| {
            let hook = Arc::clone(&hook);
            Box::pin(async move {
                hook.fetch_add(1, Ordering::SeqCst);
                transport.write_line("WAKE").await?;
                Ok(())
            })
        });
        let handle = spawn(config, Arc::new(EchoFactory::new(0)));

        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Ordinary traffic never re-runs it.
        let rx = handle
            .commands
            .submit(vec![Command::query("PING?")])
            .await
            .expect("submit");
        rx.await.expect("reply").expect("transaction");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A fresh connect does.
        directive(&handle, Directive::Connected(Some(false)))
            .await
            .expect("disconnect");
        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("reconnect");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conditioner_failure_leaves_the_worker_disconnected() {
        let config = test_config().with_conditioner(|_transport| {
            Box::pin(async { Err(anyhow::anyhow!("handshake rejected")) })
        });
        let handle = spawn(config, Arc::new(EchoFactory::new(0)));

        match directive(&handle, Directive::Connected(Some(true))).await {
            Err(StewardError::Transport { kind, .. }) => {
                assert_eq!(kind, TransportErrorKind::Configure)
            }
            other => panic!("expected configure error, got {other:?}"),
        }
        assert_eq!(*handle.connection.borrow(), ConnectionState::Disconnected);
        assert_eq!(
            directive(&handle, Directive::Connected(None)).await,
            Ok(DirectiveValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn monitoring_needs_status_commands() {
        let handle = spawn(test_config(), Arc::new(EchoFactory::new(0)));
        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");

        let value = directive(&handle, Directive::Monitoring(Some(true))).await;
        assert!(matches!(value, Err(StewardError::Configuration(_))));
        assert_eq!(
            directive(&handle, Directive::Monitoring(None)).await,
            Ok(DirectiveValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn monitoring_publishes_status_reports() {
        let config = test_config().with_status_commands(vec![Command::query("STAT?")]);
        let handle = spawn(config, Arc::new(EchoFactory::new(0)));
        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");
        directive(&handle, Directive::Monitoring(Some(true)))
            .await
            .expect("enable monitoring");

        let mut status = handle.status.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                status.changed().await.expect("worker alive");
                if status.borrow_and_update().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("status report within deadline");

        let report = status.borrow().clone().expect("report present");
        assert_eq!(report.responses[0].value, Ok("ack STAT?".to_string()));
    }

    #[tokio::test]
    async fn locking_pauses_status_polls() {
        let config = test_config().with_status_commands(vec![Command::query("STAT?")]);
        let handle = spawn(config, Arc::new(EchoFactory::new(0)));
        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");
        directive(&handle, Directive::Locked(Some(true)))
            .await
            .expect("lock");
        directive(&handle, Directive::Monitoring(Some(true)))
            .await
            .expect("enable monitoring");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            handle.status.borrow().is_none(),
            "no status polls while locked"
        );

        directive(&handle, Directive::Locked(Some(false)))
            .await
            .expect("unlock");
        let mut status = handle.status.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                status.changed().await.expect("worker alive");
                if status.borrow_and_update().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("polling resumes after unlock");
    }

    #[tokio::test]
    async fn baud_directives_require_and_use_the_transport() {
        let handle = spawn(test_config(), Arc::new(EchoFactory::new(0)));

        assert_eq!(
            directive(&handle, Directive::BaudRate(None)).await,
            Err(StewardError::NotConnected)
        );

        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");
        assert_eq!(
            directive(&handle, Directive::BaudRate(None)).await,
            Ok(DirectiveValue::Baud(115_200))
        );
        assert_eq!(
            directive(&handle, Directive::BaudRate(Some(9_600))).await,
            Ok(DirectiveValue::Baud(9_600))
        );
        assert_eq!(
            directive(&handle, Directive::BaudRate(None)).await,
            Ok(DirectiveValue::Baud(9_600))
        );
    }

    #[tokio::test]
    async fn quit_stops_the_worker() {
        let handle = spawn(test_config(), Arc::new(EchoFactory::new(0)));
        directive(&handle, Directive::Connected(Some(true)))
            .await
            .expect("connect");

        assert_eq!(
            directive(&handle, Directive::Quit).await,
            Ok(DirectiveValue::Ack)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.directives.try_submit(Directive::Connected(None)),
            Err(crate::link::SubmitError::Gone)
        ));
    }
}
