//! Relay channel state
//!
//! Pure bookkeeping, no sockets: the server layer owns connections and
//! hands this module decoded requests plus per-connection outboxes. That
//! split keeps admission and replay unit-testable.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;
use tracing::debug;

use weave_core::ROOT_NAME;
use weave_wire::{ModulePayload, Request, RequestBody};

/// Per-connection outbox; lines are written by the connection's writer task
pub type Outbox = mpsc::UnboundedSender<String>;

/// Connection identity assigned by the server
pub type ConnId = u64;

/// Last-writer-wins admission
///
/// Timestamp 0 on either side disables the check for that comparison;
/// otherwise older-or-equal incoming state is stale.
fn stale(incoming: i64, stored: i64) -> bool {
    incoming != 0 && stored != 0 && incoming <= stored
}

#[derive(Clone, Debug)]
struct ModuleRecord {
    payload: String,
    timestamp: i64,
}

#[derive(Clone, Debug)]
struct EntityRecord {
    parent: String,
    timestamp: i64,
    modules: BTreeMap<String, ModuleRecord>,
}

#[derive(Clone, Debug)]
struct ResourceRecord {
    kind: String,
    payload: String,
    timestamp: i64,
}

/// Relay counters
#[derive(Clone, Debug, Default)]
pub struct RelayStats {
    pub admitted: u64,
    pub rejected_stale: u64,
    pub replayed: u64,
    pub subscribers_added: u64,
    pub subscribers_dropped: u64,
}

/// State of one channel
#[derive(Default)]
struct ChannelState {
    entities: HashMap<String, EntityRecord>,
    entity_order: Vec<String>,
    resources: HashMap<String, ResourceRecord>,
    resource_order: Vec<String>,
    subscribers: HashMap<ConnId, Outbox>,
}

impl ChannelState {
    fn entity_mut(&mut self, name: &str) -> &mut EntityRecord {
        if !self.entities.contains_key(name) {
            self.entity_order.push(name.to_string());
        }
        self.entities
            .entry(name.to_string())
            .or_insert_with(|| EntityRecord {
                parent: ROOT_NAME.to_string(),
                timestamp: 0,
                modules: BTreeMap::new(),
            })
    }

    fn remove_entity(&mut self, name: &str) -> bool {
        if self.entities.remove(name).is_some() {
            self.entity_order.retain(|n| n != name);
            true
        } else {
            false
        }
    }

    fn remove_resource(&mut self, name: &str) -> bool {
        if self.resources.remove(name).is_some() {
            self.resource_order.retain(|n| n != name);
            true
        } else {
            false
        }
    }
}

/// All channels plus global counters
#[derive(Default)]
pub struct RelayState {
    channels: HashMap<String, ChannelState>,
    stats: RelayStats,
}

impl RelayState {
    pub fn new() -> Self {
        RelayState::default()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Register a subscriber on a channel
    pub fn subscribe(&mut self, channel: &str, id: ConnId, outbox: Outbox) {
        let state = self.channels.entry(channel.to_string()).or_default();
        if state.subscribers.insert(id, outbox).is_none() {
            self.stats.subscribers_added += 1;
        }
    }

    pub fn unsubscribe(&mut self, channel: &str, id: ConnId) {
        if let Some(state) = self.channels.get_mut(channel) {
            if state.subscribers.remove(&id).is_some() {
                self.stats.subscribers_dropped += 1;
            }
        }
    }

    /// Remove a connection from every channel (disconnect teardown)
    pub fn drop_subscriber(&mut self, id: ConnId) {
        for state in self.channels.values_mut() {
            if state.subscribers.remove(&id).is_some() {
                self.stats.subscribers_dropped += 1;
            }
        }
    }

    /// Snapshot of a channel's outboxes, excluding the sender
    ///
    /// Callers take the snapshot under the lock and send outside it.
    pub fn subscribers(&self, channel: &str, exclude: ConnId) -> Vec<(ConnId, Outbox)> {
        self.channels
            .get(channel)
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .filter(|(id, _)| **id != exclude)
                    .map(|(id, outbox)| (*id, outbox.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Requests that bring a fresh subscriber up to the channel's latest
    /// state: resources in arrival order, then entities (placement before
    /// modules)
    pub fn replay(&mut self, channel: &str) -> Vec<Request> {
        let Some(state) = self.channels.get(channel) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for name in &state.resource_order {
            if let Some(record) = state.resources.get(name) {
                out.push(Request::new(
                    channel,
                    record.timestamp,
                    RequestBody::ResourceUpdate {
                        name: name.clone(),
                        kind: record.kind.clone(),
                        payload: record.payload.clone(),
                    },
                ));
            }
        }
        for name in &state.entity_order {
            if let Some(record) = state.entities.get(name) {
                out.push(Request::new(
                    channel,
                    record.timestamp,
                    RequestBody::ObjectUpdate {
                        name: name.clone(),
                        parent: record.parent.clone(),
                    },
                ));
                if !record.modules.is_empty() {
                    let timestamp = record.modules.values().map(|m| m.timestamp).max().unwrap_or(0);
                    out.push(Request::new(
                        channel,
                        timestamp,
                        RequestBody::ComponentUpdate {
                            name: name.clone(),
                            modules: record
                                .modules
                                .iter()
                                .map(|(tag, module)| ModulePayload {
                                    tag: tag.clone(),
                                    payload: module.payload.clone(),
                                })
                                .collect(),
                        },
                    ));
                }
            }
        }
        self.stats.replayed += out.len() as u64;
        out
    }

    /// Admit a request against the channel's stored state
    ///
    /// Returns the request to broadcast, which for component updates may
    /// be a filtered subset of the incoming modules. `None` means fully
    /// stale (or a control request): nothing is stored or forwarded.
    pub fn admit(&mut self, request: &Request) -> Option<Request> {
        let ts = request.timestamp;
        let channel = self.channels.entry(request.channel.clone()).or_default();
        let admitted = match &request.body {
            RequestBody::ObjectUpdate { name, parent } => {
                if let Some(record) = channel.entities.get(name) {
                    if stale(ts, record.timestamp) {
                        None
                    } else {
                        let record = channel.entity_mut(name);
                        record.parent = parent.clone();
                        record.timestamp = ts;
                        Some(request.body.clone())
                    }
                } else {
                    let record = channel.entity_mut(name);
                    record.parent = parent.clone();
                    record.timestamp = ts;
                    Some(request.body.clone())
                }
            }
            RequestBody::ObjectDelete { name } => {
                match channel.entities.get(name) {
                    Some(record) if stale(ts, record.timestamp) => None,
                    Some(_) => {
                        channel.remove_entity(name);
                        Some(request.body.clone())
                    }
                    // Nothing stored; forward anyway, the delete may still
                    // matter to live subscribers
                    None => Some(request.body.clone()),
                }
            }
            RequestBody::ResourceUpdate {
                name,
                kind,
                payload,
            } => {
                match channel.resources.get(name) {
                    Some(record) if stale(ts, record.timestamp) => None,
                    existing => {
                        if existing.is_none() {
                            channel.resource_order.push(name.clone());
                        }
                        channel.resources.insert(
                            name.clone(),
                            ResourceRecord {
                                kind: kind.clone(),
                                payload: payload.clone(),
                                timestamp: ts,
                            },
                        );
                        Some(request.body.clone())
                    }
                }
            }
            RequestBody::ResourceDelete { name } => match channel.resources.get(name) {
                Some(record) if stale(ts, record.timestamp) => None,
                Some(_) => {
                    channel.remove_resource(name);
                    Some(request.body.clone())
                }
                None => Some(request.body.clone()),
            },
            RequestBody::ComponentUpdate { name, modules } => {
                let record = channel.entity_mut(name);
                let admitted: Vec<ModulePayload> = modules
                    .iter()
                    .filter(|module| {
                        record
                            .modules
                            .get(&module.tag)
                            .map(|stored| !stale(ts, stored.timestamp))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                for module in &admitted {
                    record.modules.insert(
                        module.tag.clone(),
                        ModuleRecord {
                            payload: module.payload.clone(),
                            timestamp: ts,
                        },
                    );
                }
                if admitted.is_empty() {
                    None
                } else {
                    Some(RequestBody::ComponentUpdate {
                        name: name.clone(),
                        modules: admitted,
                    })
                }
            }
            RequestBody::ComponentDelete { name, tags } => {
                let Some(record) = channel.entities.get_mut(name) else {
                    return {
                        self.stats.admitted += 1;
                        Some(request.clone())
                    };
                };
                let mut admitted = Vec::new();
                for tag in tags {
                    match record.modules.get(tag) {
                        Some(stored) if stale(ts, stored.timestamp) => {}
                        _ => {
                            record.modules.remove(tag);
                            admitted.push(tag.clone());
                        }
                    }
                }
                if admitted.is_empty() {
                    None
                } else {
                    Some(RequestBody::ComponentDelete {
                        name: name.clone(),
                        tags: admitted,
                    })
                }
            }
            // Controls are connection-level, not channel state
            RequestBody::Subscribe | RequestBody::Unsubscribe => None,
        };
        match admitted {
            Some(body) => {
                self.stats.admitted += 1;
                Some(Request::new(request.channel.clone(), ts, body))
            }
            None => {
                if !request.body.is_control() {
                    self.stats.rejected_stale += 1;
                    debug!(
                        kind = request.body.discriminator(),
                        name = request.body.name().unwrap_or(""),
                        "rejecting stale request"
                    );
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ou(channel: &str, ts: i64, name: &str, parent: &str) -> Request {
        Request::new(
            channel,
            ts,
            RequestBody::ObjectUpdate {
                name: name.into(),
                parent: parent.into(),
            },
        )
    }

    fn cu(channel: &str, ts: i64, name: &str, tag: &str, payload: &str) -> Request {
        Request::new(
            channel,
            ts,
            RequestBody::ComponentUpdate {
                name: name.into(),
                modules: vec![ModulePayload {
                    tag: tag.into(),
                    payload: payload.into(),
                }],
            },
        )
    }

    #[test]
    fn test_lww_rejects_older_or_equal() {
        let mut state = RelayState::new();
        assert!(state.admit(&ou("c", 5, "box", "root")).is_some());
        assert!(state.admit(&ou("c", 3, "box", "other")).is_none());
        assert!(state.admit(&ou("c", 5, "box", "other")).is_none());
        assert!(state.admit(&ou("c", 6, "box", "other")).is_some());
        assert_eq!(state.stats().rejected_stale, 2);
    }

    #[test]
    fn test_zero_timestamp_bypasses_lww() {
        let mut state = RelayState::new();
        assert!(state.admit(&ou("c", 5, "box", "root")).is_some());
        // Incoming 0: always admitted
        assert!(state.admit(&ou("c", 0, "box", "other")).is_some());
        // Stored 0: any timestamp admitted
        assert!(state.admit(&ou("c", 1, "box", "third")).is_some());
    }

    #[test]
    fn test_component_update_filters_stale_modules() {
        let mut state = RelayState::new();
        state.admit(&cu("c", 5, "box", "Transform", "{\"a\":1}"));

        // One stale module, one new: the broadcast carries only the new one
        let mixed = Request::new(
            "c",
            3,
            RequestBody::ComponentUpdate {
                name: "box".into(),
                modules: vec![
                    ModulePayload {
                        tag: "Transform".into(),
                        payload: "{\"a\":2}".into(),
                    },
                    ModulePayload {
                        tag: "Light".into(),
                        payload: "{}".into(),
                    },
                ],
            },
        );
        let admitted = state.admit(&mixed).unwrap();
        match admitted.body {
            RequestBody::ComponentUpdate { modules, .. } => {
                assert_eq!(modules.len(), 1);
                assert_eq!(modules[0].tag, "Light");
            }
            other => panic!("unexpected body {:?}", other),
        }

        // Fully stale: nothing to broadcast
        assert!(state.admit(&cu("c", 3, "box", "Transform", "{}")).is_none());
    }

    #[test]
    fn test_replay_order_resources_then_entities() {
        let mut state = RelayState::new();
        state.admit(&cu("c", 1, "box", "MeshRenderer", "{}"));
        state.admit(&ou("c", 2, "box", "root"));
        state.admit(&Request::new(
            "c",
            3,
            RequestBody::ResourceUpdate {
                name: "cube".into(),
                kind: "Mesh".into(),
                payload: "{}".into(),
            },
        ));
        state.admit(&Request::new(
            "c",
            4,
            RequestBody::ResourceUpdate {
                name: "plain".into(),
                kind: "Material".into(),
                payload: "{}".into(),
            },
        ));

        let replay = state.replay("c");
        let kinds: Vec<_> = replay.iter().map(|r| r.body.discriminator()).collect();
        assert_eq!(kinds, vec!["ru", "ru", "ou", "cu"]);
        assert_eq!(replay[0].body.name(), Some("cube"));
        assert_eq!(replay[1].body.name(), Some("plain"));
        // The entity replays with its latest admitted parent
        match &replay[2].body {
            RequestBody::ObjectUpdate { parent, .. } => assert_eq!(parent, "root"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_deletes_clear_replay_state() {
        let mut state = RelayState::new();
        state.admit(&ou("c", 1, "box", "root"));
        state.admit(&cu("c", 1, "box", "Transform", "{}"));
        state.admit(&Request::new(
            "c",
            1,
            RequestBody::ResourceUpdate {
                name: "cube".into(),
                kind: "Mesh".into(),
                payload: "{}".into(),
            },
        ));

        assert!(state
            .admit(&Request::new("c", 2, RequestBody::ObjectDelete { name: "box".into() }))
            .is_some());
        assert!(state
            .admit(&Request::new("c", 2, RequestBody::ResourceDelete { name: "cube".into() }))
            .is_some());
        assert!(state.replay("c").is_empty());
    }

    #[test]
    fn test_subscribers_snapshot_excludes_sender() {
        let mut state = RelayState::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        state.subscribe("c", 1, tx_a);
        state.subscribe("c", 2, tx_b);

        let targets = state.subscribers("c", 1);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, 2);

        state.drop_subscriber(2);
        assert_eq!(state.subscriber_count("c"), 1);
        assert!(state.subscribers("c", 1).is_empty());
    }

    #[test]
    fn test_unsubscribe_leaves_other_channels() {
        let mut state = RelayState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.subscribe("a", 1, tx.clone());
        state.subscribe("b", 1, tx);

        state.unsubscribe("a", 1);
        assert_eq!(state.subscriber_count("a"), 0);
        assert_eq!(state.subscriber_count("b"), 1);
    }
}
