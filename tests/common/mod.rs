//! Shared test doubles: a scripted device behind a duplex pipe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

use serial_steward::transport::FramedPort;
use serial_steward::{
    Result, StewardConfig, StewardError, Transport, TransportFactory, TransportErrorKind,
};

/// Transport over one end of a duplex pipe, with a locally tracked baud.
pub struct LoopTransport {
    port: FramedPort<DuplexStream>,
    baud: u32,
}

#[async_trait]
impl Transport for LoopTransport {
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

/// Factory serving a scripted device on each open.
///
/// The device answers from a payload-to-reply table, optionally after a
/// delay; unknown payloads draw no reply at all. [`cut_links`] severs every
/// live device, which the host observes as a closed port.
///
/// [`cut_links`]: MockFactory::cut_links
pub struct MockFactory {
    opens: AtomicUsize,
    fail_opens: usize,
    replies: Vec<(String, String)>,
    reply_delay: Duration,
    echo: bool,
    cut_tx: watch::Sender<u64>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    pub fn new() -> Self {
        let (cut_tx, _) = watch::channel(0);
        Self {
            opens: AtomicUsize::new(0),
            fail_opens: 0,
            replies: Vec::new(),
            reply_delay: Duration::ZERO,
            echo: false,
            cut_tx,
        }
    }

    /// Fail the first `n` open attempts.
    pub fn with_fail_opens(mut self, n: usize) -> Self {
        self.fail_opens = n;
        self
    }

    /// Answer `payload` with `reply`.
    pub fn with_reply(mut self, payload: &str, reply: &str) -> Self {
        self.replies.push((payload.to_string(), reply.to_string()));
        self
    }

    /// Delay every reply.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Answer unmatched payloads with `ack <payload>` instead of silence.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// How many times `open` has been called, including failed attempts.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sever every currently open device link, as if the cable were pulled.
    /// Devices opened afterwards are unaffected.
    pub fn cut_links(&self) {
        self.cut_tx.send_modify(|generation| *generation += 1);
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, config: &StewardConfig) -> Result<Box<dyn Transport>> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_opens {
            return Err(StewardError::transport(
                TransportErrorKind::Open,
                "scripted open failure",
            ));
        }

        let (device_side, host_side) = tokio::io::duplex(1024);
        let replies = self.replies.clone();
        let echo = self.echo;
        let reply_delay = self.reply_delay;
        let terminator = config.terminator;
        let mut cut_rx = self.cut_tx.subscribe();

        tokio::spawn(async move {
            let serve = async move {
                let mut reader = BufReader::new(device_side);
                loop {
                    let mut buf = Vec::new();
                    match reader.read_until(terminator.delimiter(), &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let payload = line.trim_end_matches(['\r', '\n']).to_string();

                    let reply = replies
                        .iter()
                        .find(|(p, _)| *p == payload)
                        .map(|(_, r)| r.clone())
                        .or_else(|| echo.then(|| format!("ack {payload}")));
                    let Some(reply) = reply else { continue };

                    if !reply_delay.is_zero() {
                        tokio::time::sleep(reply_delay).await;
                    }
                    let framed = format!("{reply}{}", terminator.as_str());
                    if reader.get_mut().write_all(framed.as_bytes()).await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                _ = serve => {}
                _ = cut_rx.changed() => {}
            }
        });

        Ok(Box::new(LoopTransport {
            port: FramedPort::new(host_side, terminator, config.read_timeout),
            baud: config.baud_rate,
        }))
    }
}
