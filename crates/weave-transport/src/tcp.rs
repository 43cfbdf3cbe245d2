//! TCP link implementation
//!
//! Newline-framed JSON over a single TCP stream. The link owns two
//! background tasks per connection: a reader that decodes lines into an
//! inbound channel and a writer that drains an outbound channel onto the
//! socket. The tick loop talks to the channels only; reconnection is
//! rate-limited with jitter so a dead relay is not hammered.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weave_core::{SyncError, SyncResult};
use weave_wire::Request;

use crate::link::Link;

/// TCP link configuration
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Minimum delay between connection attempts
    pub reconnect_interval: Duration,
    /// Random extra delay added to each attempt
    pub reconnect_jitter: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            reconnect_interval: Duration::from_secs(1),
            reconnect_jitter: Duration::from_millis(250),
        }
    }
}

/// A reconnecting TCP link to one relay
///
/// Must be created on a Tokio runtime thread; connection tasks are
/// spawned onto the ambient runtime.
pub struct TcpLink {
    addr: SocketAddr,
    config: LinkConfig,
    handle: tokio::runtime::Handle,
    connected: Arc<AtomicBool>,
    connecting: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<Request>>,
    last_attempt: Option<Instant>,
}

impl TcpLink {
    pub fn new(addr: SocketAddr, config: LinkConfig) -> Self {
        TcpLink {
            addr,
            config,
            handle: tokio::runtime::Handle::current(),
            connected: Arc::new(AtomicBool::new(false)),
            connecting: Arc::new(AtomicBool::new(false)),
            outbound: None,
            inbound: None,
            last_attempt: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection state without triggering a reconnect
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn spawn_connect(&mut self) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Request>();
        self.outbound = Some(out_tx);
        self.inbound = Some(in_rx);

        let addr = self.addr;
        let connected = Arc::clone(&self.connected);
        let connecting = Arc::clone(&self.connecting);
        self.handle.spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!(%addr, "link connected");
                    connecting.store(false, Ordering::Release);
                    connected.store(true, Ordering::Release);
                    run_connection(stream, out_rx, in_tx).await;
                    connected.store(false, Ordering::Release);
                    info!(%addr, "link closed");
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    connecting.store(false, Ordering::Release);
                }
            }
        });
    }
}

impl Link for TcpLink {
    fn ensure_connected(&mut self) -> bool {
        if self.connected.load(Ordering::Acquire) {
            return true;
        }
        if self.connecting.load(Ordering::Acquire) {
            return false;
        }
        let jitter_ms = self.config.reconnect_jitter.as_millis() as u64;
        let backoff = self.config.reconnect_interval
            + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        if let Some(last) = self.last_attempt {
            if last.elapsed() < backoff {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());
        self.connecting.store(true, Ordering::Release);
        self.spawn_connect();
        false
    }

    fn send(&mut self, request: &Request) -> SyncResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SyncError::NotConnected);
        }
        let line = request.encode()?;
        match &self.outbound {
            Some(tx) if tx.send(line).is_ok() => Ok(()),
            _ => Err(SyncError::NotConnected),
        }
    }

    fn poll(&mut self) -> Vec<Request> {
        let mut out = Vec::new();
        if let Some(rx) = &mut self.inbound {
            while let Ok(request) = rx.try_recv() {
                out.push(request);
            }
        }
        out
    }
}

/// Drive one established connection until either side goes away
async fn run_connection(
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Request>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match Request::decode(&line) {
                    Ok(request) => {
                        if inbound.send(request).is_err() {
                            break;
                        }
                    }
                    // Malformed input never takes the link down
                    Err(e) => warn!(error = %e, "dropping malformed line"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "read error");
                    break;
                }
            },
            item = outbound.recv() => match item {
                Some(line) => {
                    if write_half.write_all(line.as_bytes()).await.is_err()
                        || write_half.write_all(b"\n").await.is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
