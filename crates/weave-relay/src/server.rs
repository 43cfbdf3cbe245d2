//! Relay TCP server
//!
//! One task per connection for reading, one for writing. Channel state
//! sits behind a `parking_lot::Mutex`; the subscriber snapshot is taken
//! under the lock and the socket writes happen outside it. A subscriber
//! whose outbox is gone is dropped silently.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use weave_core::{SyncError, SyncResult};
use weave_wire::{Request, RequestBody};

use crate::state::{ConnId, RelayState};

/// Relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
        }
    }
}

/// The relay server
pub struct RelayServer {
    config: RelayConfig,
    state: Arc<Mutex<RelayState>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        RelayServer {
            config,
            state: Arc::new(Mutex::new(RelayState::new())),
        }
    }

    pub fn state(&self) -> Arc<Mutex<RelayState>> {
        Arc::clone(&self.state)
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(&self) -> SyncResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        info!(addr = %self.config.listen_addr, "relay listening");
        serve(listener, Arc::clone(&self.state)).await
    }
}

/// Accept loop over an already-bound listener
pub async fn serve(listener: TcpListener, state: Arc<Mutex<RelayState>>) -> SyncResult<()> {
    let mut next_id: ConnId = 0;
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        next_id += 1;
        tokio::spawn(handle_connection(next_id, stream, addr, Arc::clone(&state)));
    }
}

async fn handle_connection(
    id: ConnId,
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
) {
    info!(conn = id, %addr, "peer connected");
    let (read_half, mut write_half) = stream.into_split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = outbox_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request = match Request::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = id, error = %e, "dropping malformed request");
                continue;
            }
        };
        match request.body {
            RequestBody::Subscribe => {
                // Replay goes to the new subscriber only
                let replay = {
                    let mut state = state.lock();
                    state.subscribe(&request.channel, id, outbox.clone());
                    state.replay(&request.channel)
                };
                info!(conn = id, channel = %request.channel, replayed = replay.len(), "subscribed");
                for request in replay {
                    if let Ok(line) = request.encode() {
                        if outbox.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
            RequestBody::Unsubscribe => {
                state.lock().unsubscribe(&request.channel, id);
            }
            _ => {
                let (admitted, targets) = {
                    let mut state = state.lock();
                    let admitted = state.admit(&request);
                    let targets = if admitted.is_some() {
                        state.subscribers(&request.channel, id)
                    } else {
                        Vec::new()
                    };
                    (admitted, targets)
                };
                let Some(admitted) = admitted else { continue };
                let Ok(line) = admitted.encode() else { continue };
                let mut dead = Vec::new();
                for (target, outbox) in targets {
                    if outbox.send(line.clone()).is_err() {
                        dead.push(target);
                    }
                }
                if !dead.is_empty() {
                    let mut state = state.lock();
                    for target in dead {
                        state.drop_subscriber(target);
                    }
                }
            }
        }
    }

    state.lock().drop_subscriber(id);
    writer.abort();
    info!(conn = id, %addr, "peer disconnected");
}
