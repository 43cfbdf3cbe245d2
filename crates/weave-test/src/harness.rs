//! In-memory hub and link

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use weave_core::{SyncError, SyncResult};
use weave_relay::{ConnId, RelayState};
use weave_transport::Link;
use weave_wire::{Request, RequestBody};

/// A socket-free relay shared by test peers
#[derive(Default)]
pub struct MemoryHub {
    state: Arc<Mutex<RelayState>>,
    next_id: Mutex<ConnId>,
}

impl MemoryHub {
    pub fn new() -> Self {
        MemoryHub::default()
    }

    pub fn state(&self) -> Arc<Mutex<RelayState>> {
        Arc::clone(&self.state)
    }

    /// A fresh link, as if one peer connected to the relay
    pub fn link(&self) -> MemoryLink {
        let mut next = self.next_id.lock();
        *next += 1;
        let (outbox, rx) = mpsc::unbounded_channel();
        MemoryLink {
            id: *next,
            state: Arc::clone(&self.state),
            outbox,
            rx,
            connected: true,
        }
    }
}

/// One peer's connection to the hub
///
/// `send` runs the relay's admission/replay/broadcast inline, mirroring
/// what the TCP server does per received line.
pub struct MemoryLink {
    id: ConnId,
    state: Arc<Mutex<RelayState>>,
    outbox: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
    connected: bool,
}

impl MemoryLink {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Simulate losing the connection: the relay forgets this subscriber
    pub fn go_offline(&mut self) {
        self.connected = false;
        self.state.lock().drop_subscriber(self.id);
    }

    pub fn go_online(&mut self) {
        self.connected = true;
    }
}

impl Link for MemoryLink {
    fn ensure_connected(&mut self) -> bool {
        self.connected
    }

    fn send(&mut self, request: &Request) -> SyncResult<()> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        match &request.body {
            RequestBody::Subscribe => {
                let replay = {
                    let mut state = self.state.lock();
                    state.subscribe(&request.channel, self.id, self.outbox.clone());
                    state.replay(&request.channel)
                };
                for request in replay {
                    let _ = self.outbox.send(request.encode()?);
                }
            }
            RequestBody::Unsubscribe => {
                self.state.lock().unsubscribe(&request.channel, self.id);
            }
            _ => {
                let (admitted, targets) = {
                    let mut state = self.state.lock();
                    let admitted = state.admit(request);
                    let targets = if admitted.is_some() {
                        state.subscribers(&request.channel, self.id)
                    } else {
                        Vec::new()
                    };
                    (admitted, targets)
                };
                if let Some(admitted) = admitted {
                    let line = admitted.encode()?;
                    for (_, outbox) in targets {
                        let _ = outbox.send(line.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<Request> {
        if !self.connected {
            return Vec::new();
        }
        let mut out = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            if let Ok(request) = Request::decode(&line) {
                out.push(request);
            }
        }
        out
    }
}
