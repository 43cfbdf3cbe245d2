//! Peer runtime

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use weave_core::Scene;
use weave_state::{EngineConfig, SyncEngine};
use weave_transport::Link;
use weave_wire::Request;

/// Peer configuration
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Tick interval for `run`
    pub tick_interval: Duration,
    /// Engine configuration (channels, timestamps, store policies)
    pub engine: EngineConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            tick_interval: Duration::from_millis(50),
            engine: EngineConfig::default(),
        }
    }
}

/// Peer counters
#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub subscribes_sent: u64,
    pub requests_sent: u64,
    pub requests_received: u64,
    pub last_tick_duration: Duration,
}

/// A synchronized peer: scene + engine + link
pub struct Peer<L: Link> {
    scene: Scene,
    engine: SyncEngine,
    link: L,
    config: PeerConfig,
    subscribed: bool,
    ticking: bool,
    stats: PeerStats,
}

impl<L: Link> Peer<L> {
    pub fn new(link: L, config: PeerConfig) -> Self {
        let engine = SyncEngine::new(config.engine.clone());
        Peer {
            scene: Scene::new(),
            engine,
            link,
            config,
            subscribed: false,
            ticking: false,
            stats: PeerStats::default(),
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// The host mutates the scene freely between ticks
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// One synchronization tick
    ///
    /// Offline ticks are cheap no-ops; the link reconnects in the
    /// background and subscriptions are re-sent once it returns, which
    /// makes the relay replay the channel state missed while away.
    pub fn tick(&mut self, now_ms: i64) {
        // Re-entrancy guard for hosts that call tick from inside code the
        // engine invoked
        if self.ticking {
            self.stats.skipped_ticks += 1;
            return;
        }
        self.ticking = true;
        let started = Instant::now();
        self.tick_inner(now_ms);
        self.stats.ticks += 1;
        self.stats.last_tick_duration = started.elapsed();
        self.ticking = false;
    }

    fn tick_inner(&mut self, now_ms: i64) {
        if !self.link.ensure_connected() {
            // Resubscribe from scratch when the connection comes back
            self.subscribed = false;
            return;
        }

        if !self.subscribed {
            let channels = self.engine.config().subscriptions.clone();
            for channel in channels {
                match self.link.send(&Request::subscribe(channel)) {
                    Ok(()) => self.stats.subscribes_sent += 1,
                    Err(e) => {
                        debug!(error = %e, "subscribe failed, retrying next tick");
                        return;
                    }
                }
            }
            self.subscribed = true;
        }

        for request in self.link.poll() {
            self.stats.requests_received += 1;
            self.engine.queue_incoming(request);
        }

        for request in self.engine.track_changes(&mut self.scene, now_ms) {
            match self.link.send(&request) {
                Ok(()) => self.stats.requests_sent += 1,
                Err(e) => {
                    warn!(error = %e, "send failed, dropping connection state");
                    self.subscribed = false;
                    break;
                }
            }
        }

        self.engine.apply_changes(&mut self.scene);
    }

    /// Drive ticks forever on the ambient Tokio runtime
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick(now_millis());
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
