//! Diff / reconciliation engine
//!
//! One engine per peer. `track_changes` runs the outgoing path: it walks
//! the live scene, diffs it against the tracking stores by content hash,
//! and emits at most one component-update and one component-delete per
//! entity per tick. `apply_changes` runs the incoming path in two phases:
//! request dispatch with bounded dependency retry, then deferred hierarchy
//! placement. Failures are per-item; nothing aborts a batch.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use weave_core::{Direction, ObjectId, RuleResolver, Scene, SyncError, SyncResult, ROOT_NAME};
use weave_wire::{ModulePayload, Request, RequestBody, DEFAULT_CHANNEL};

use crate::codec::{CodecRegistry, EncodeCtx};
use crate::store::{EntityStore, ResourceStore};

/// Applies of one logical update are retried at most this many times
pub const MAX_UPDATE_ATTEMPTS: u8 = 10;

/// Ticks before an unresolved hierarchy placement logs a warning
const HIERARCHY_WARN_TICKS: u32 = 64;

/// Engine configuration; explicit, no ambient state
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Channel stamped on outgoing requests
    pub send_channel: String,
    /// Channels accepted on the incoming path
    pub subscriptions: Vec<String>,
    /// Stamp real timestamps; `false` sends 0 (LWW checking disabled)
    pub use_timestamps: bool,
    /// Adopt live objects found by name instead of spawning fresh ones
    pub prefer_existing_objects: bool,
    /// Adopt matching assets from the external pool
    pub prefer_existing_resources: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            send_channel: DEFAULT_CHANNEL.to_string(),
            subscriptions: vec![DEFAULT_CHANNEL.to_string()],
            use_timestamps: true,
            prefer_existing_objects: true,
            prefer_existing_resources: true,
        }
    }
}

/// Engine counters
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub requests_out: u64,
    pub requests_in: u64,
    pub applied: u64,
    pub retried: u64,
    pub dropped_at_cap: u64,
    pub unknown_types: u64,
    pub denied_by_rule: u64,
}

/// An inbound request plus its retry counter
#[derive(Clone, Debug)]
struct InboundEntry {
    request: Request,
    attempts: u8,
}

/// A deferred hierarchy placement
#[derive(Clone, Debug)]
struct Placement {
    name: String,
    parent: String,
    ticks_waiting: u32,
    warned: bool,
}

/// The per-peer reconciliation engine
pub struct SyncEngine {
    entities: EntityStore,
    resources: ResourceStore,
    registry: CodecRegistry,
    rules: RuleResolver,
    config: EngineConfig,
    inbound: VecDeque<InboundEntry>,
    retry_next: Vec<InboundEntry>,
    hierarchy: VecDeque<Placement>,
    stats: EngineStats,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, CodecRegistry::with_defaults(), RuleResolver::new())
    }

    pub fn with_registry(config: EngineConfig, registry: CodecRegistry, rules: RuleResolver) -> Self {
        SyncEngine {
            entities: EntityStore::new(),
            resources: ResourceStore::new(),
            registry,
            rules,
            config,
            inbound: VecDeque::new(),
            retry_next: Vec::new(),
            hierarchy: VecDeque::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Pending hierarchy placements (unresolved parents)
    pub fn pending_placements(&self) -> usize {
        self.hierarchy.len()
    }

    /// Pending dependency retries for the next tick
    pub fn pending_retries(&self) -> usize {
        self.retry_next.len()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.config.subscriptions.iter().any(|c| c == channel)
    }

    /// Hand an incoming request to the engine; consumed on the next
    /// `apply_changes`
    pub fn queue_incoming(&mut self, request: Request) {
        self.stats.requests_in += 1;
        self.inbound.push_back(InboundEntry {
            request,
            attempts: 0,
        });
    }

    // ------------------------------------------------------------------
    // Outgoing path
    // ------------------------------------------------------------------

    /// Detect local changes and serialize them into wire requests
    ///
    /// `now_ms` stamps the requests when timestamps are enabled.
    pub fn track_changes(&mut self, scene: &mut Scene, now_ms: i64) -> Vec<Request> {
        let ts = if self.config.use_timestamps { now_ms } else { 0 };

        // Step 1: register every reachable live object not yet tracked
        for id in scene.reachable() {
            if self.entities.name_of(id).is_none() {
                self.entities.register(scene, id);
            }
        }

        let blocked_entities = self.blocked_entity_names();
        let blocked_modules = self.blocked_module_keys();
        let blocked_resources = self.blocked_resource_names();

        let mut object_updates = Vec::new();
        let mut component_batches = Vec::new();
        let mut object_deletes = Vec::new();

        // Step 2: diff tracked entities against the live scene
        for name in self.entities.names() {
            if blocked_entities.contains(&name) {
                continue;
            }
            let node = match self.entities.get(&name) {
                Some(node) => node,
                None => continue,
            };
            let id = node.object;

            let renamed = scene
                .get(id)
                .map(|obj| obj.name != node.base_name)
                .unwrap_or(false);
            if !scene.contains(id) || !scene.is_reachable(id) || renamed {
                object_deletes.push(name);
                continue;
            }

            if let Some(request) = self.diff_parent(scene, &name, id, ts) {
                object_updates.push(request);
            }

            let (updates, deletes) = self.diff_modules(scene, &name, id, &blocked_modules);
            if !updates.is_empty() {
                component_batches.push(Request::new(
                    self.config.send_channel.clone(),
                    ts,
                    RequestBody::ComponentUpdate {
                        name: name.clone(),
                        modules: updates,
                    },
                ));
            }
            if !deletes.is_empty() {
                component_batches.push(Request::new(
                    self.config.send_channel.clone(),
                    ts,
                    RequestBody::ComponentDelete {
                        name: name.clone(),
                        tags: deletes,
                    },
                ));
            }
        }

        // Step 3: walk resources by stable index; encoders may append
        let (resource_updates, resource_deletes) = self.diff_resources(scene, ts, &blocked_resources);

        // Step 4: assemble in dependency-friendly order, then apply local
        // store deletions
        let mut out = object_updates;
        out.extend(resource_updates);
        out.extend(component_batches);
        for name in object_deletes {
            self.entities.remove(&name);
            out.push(Request::new(
                self.config.send_channel.clone(),
                ts,
                RequestBody::ObjectDelete { name },
            ));
        }
        for name in resource_deletes {
            self.resources.remove(&name);
            out.push(Request::new(
                self.config.send_channel.clone(),
                ts,
                RequestBody::ResourceDelete { name },
            ));
        }
        self.stats.requests_out += out.len() as u64;
        out
    }

    fn diff_parent(
        &mut self,
        scene: &Scene,
        name: &str,
        id: ObjectId,
        ts: i64,
    ) -> Option<Request> {
        let parent_id = scene.get(id)?.parent()?;
        let parent_ref = if parent_id == scene.root() {
            ROOT_NAME.to_string()
        } else {
            self.entities.name_of(parent_id)?.to_string()
        };
        let node = self.entities.get_mut(name)?;
        if node.last_parent.as_deref() == Some(parent_ref.as_str()) {
            return None;
        }
        node.last_parent = Some(parent_ref.clone());
        Some(Request::new(
            self.config.send_channel.clone(),
            ts,
            RequestBody::ObjectUpdate {
                name: name.to_string(),
                parent: parent_ref,
            },
        ))
    }

    fn diff_modules(
        &mut self,
        scene: &Scene,
        name: &str,
        id: ObjectId,
        blocked: &HashSet<(String, String)>,
    ) -> (Vec<ModulePayload>, Vec<String>) {
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for tag in self.registry.module_tags().to_vec() {
            if blocked.contains(&(name.to_string(), tag.to_string())) {
                continue;
            }
            if !self.rules.resolve(scene, id, tag, Direction::Send) {
                self.stats.denied_by_rule += 1;
                continue;
            }
            let places = self.rules.decimal_places(scene, id, tag);
            let codec = match self.registry.module(tag) {
                Some(codec) => codec,
                None => continue,
            };
            let encoded = {
                let obj = match scene.get(id) {
                    Some(obj) => obj,
                    None => continue,
                };
                let mut ctx = EncodeCtx {
                    scene,
                    places,
                    resources: &mut self.resources,
                };
                codec.encode(obj, &mut ctx)
            };
            let node = match self.entities.get_mut(name) {
                Some(node) => node,
                None => continue,
            };
            match encoded {
                Some(encoded) => {
                    if node.hashes.get(tag).copied() != Some(encoded.hash) {
                        node.hashes.insert(tag.to_string(), encoded.hash);
                        updates.push(ModulePayload {
                            tag: tag.to_string(),
                            payload: encoded.payload,
                        });
                    }
                }
                None => {
                    if node.hashes.remove(tag).is_some() {
                        deletes.push(tag.to_string());
                    }
                }
            }
        }
        (updates, deletes)
    }

    fn diff_resources(
        &mut self,
        scene: &Scene,
        ts: i64,
        blocked: &HashSet<String>,
    ) -> (Vec<Request>, Vec<String>) {
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        let mut index = 0;
        while let Some(name) = self.resources.name_at(index).map(str::to_string) {
            index += 1;
            if blocked.contains(&name) {
                continue;
            }
            let kind = match self.resources.get(&name) {
                Some(node) => node.kind.clone(),
                None => continue,
            };
            let live = scene
                .asset(&name)
                .or_else(|| {
                    if self.config.prefer_existing_resources {
                        scene.external_asset(&name)
                    } else {
                        None
                    }
                })
                .filter(|asset| asset.tag() == kind);
            let Some(asset) = live else {
                // Live handle gone or repurposed under another type
                deletes.push(name);
                continue;
            };
            let Some(codec) = self.registry.resource(&kind) else {
                continue;
            };
            let encoded = {
                let mut ctx = EncodeCtx {
                    scene,
                    places: self.rules.default_places,
                    resources: &mut self.resources,
                };
                codec.encode(asset, &mut ctx)
            };
            let Some(encoded) = encoded else { continue };
            let node = match self.resources.get_mut(&name) {
                Some(node) => node,
                None => continue,
            };
            if node.hash != encoded.hash {
                node.hash = encoded.hash;
                updates.push(Request::new(
                    self.config.send_channel.clone(),
                    ts,
                    RequestBody::ResourceUpdate {
                        name,
                        kind,
                        payload: encoded.payload,
                    },
                ));
            }
        }
        (updates, deletes)
    }

    fn blocked_entity_names(&self) -> HashSet<String> {
        self.hierarchy.iter().map(|p| p.name.clone()).collect()
    }

    fn blocked_module_keys(&self) -> HashSet<(String, String)> {
        let mut keys = HashSet::new();
        for entry in &self.retry_next {
            if let RequestBody::ComponentUpdate { name, modules } = &entry.request.body {
                for module in modules {
                    keys.insert((name.clone(), module.tag.clone()));
                }
            }
        }
        keys
    }

    fn blocked_resource_names(&self) -> HashSet<String> {
        self.retry_next
            .iter()
            .filter_map(|entry| match &entry.request.body {
                RequestBody::ResourceUpdate { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Incoming path
    // ------------------------------------------------------------------

    /// Apply queued incoming requests, then resolve pending placements
    pub fn apply_changes(&mut self, scene: &mut Scene) {
        self.update_objects(scene);
        self.update_hierarchy(scene);
    }

    /// Phase 1: drain the inbound queue and dispatch by kind+action
    ///
    /// Retries from the previous tick run first. Entries that fail again
    /// land back in `retry_next` and stay there until the next tick, so
    /// `track_changes` can see them and hold back conflicting sends.
    fn update_objects(&mut self, scene: &mut Scene) {
        let mut drained: Vec<InboundEntry> = self.retry_next.drain(..).collect();
        drained.extend(self.inbound.drain(..));
        for entry in drained {
            if !self.is_subscribed(&entry.request.channel) {
                debug!(channel = %entry.request.channel, "dropping request for unsubscribed channel");
                continue;
            }
            self.dispatch(scene, entry);
        }
    }

    fn dispatch(&mut self, scene: &mut Scene, entry: InboundEntry) {
        let channel = entry.request.channel.clone();
        let timestamp = entry.request.timestamp;
        let attempts = entry.attempts;
        match entry.request.body {
            RequestBody::ObjectUpdate { name, parent } => {
                let id = self
                    .entities
                    .get_or_create(scene, &name, self.config.prefer_existing_objects);
                if let Some(obj) = scene.get_mut(id) {
                    obj.active = false;
                }
                self.hierarchy.push_back(Placement {
                    name,
                    parent,
                    ticks_waiting: 0,
                    warned: false,
                });
                self.stats.applied += 1;
            }
            RequestBody::ObjectDelete { name } => {
                if let Some(node) = self.entities.remove(&name) {
                    scene.remove(node.object);
                }
                self.hierarchy.retain(|p| p.name != name);
                self.stats.applied += 1;
            }
            RequestBody::ResourceUpdate {
                name,
                kind,
                payload,
            } => {
                match self.apply_resource(scene, &name, &kind, &payload) {
                    Ok(Some(hash)) => {
                        self.resources.insert(&name, &kind, hash);
                        self.stats.applied += 1;
                    }
                    // No hash to track: skipped
                    Ok(None) => {}
                    Err(err) => self.handle_apply_failure(
                        Request::new(
                            channel,
                            timestamp,
                            RequestBody::ResourceUpdate {
                                name,
                                kind,
                                payload,
                            },
                        ),
                        attempts,
                        err,
                    ),
                }
            }
            RequestBody::ResourceDelete { name } => {
                // Consumers retain their own handle; no reference counting
                self.resources.remove(&name);
                self.stats.applied += 1;
            }
            RequestBody::ComponentUpdate { name, modules } => {
                let id = self
                    .entities
                    .get_or_create(scene, &name, self.config.prefer_existing_objects);
                for module in modules {
                    match self.apply_module(scene, &name, id, &module) {
                        Ok(()) => self.stats.applied += 1,
                        Err(err) => self.handle_apply_failure(
                            Request::new(
                                channel.clone(),
                                timestamp,
                                RequestBody::ComponentUpdate {
                                    name: name.clone(),
                                    modules: vec![module],
                                },
                            ),
                            attempts,
                            err,
                        ),
                    }
                }
            }
            RequestBody::ComponentDelete { name, tags } => {
                let Some(id) = self.entities.get(&name).map(|n| n.object) else {
                    return;
                };
                for tag in tags {
                    if !self.rules.resolve(scene, id, &tag, Direction::Receive) {
                        self.stats.denied_by_rule += 1;
                        continue;
                    }
                    if let Some(codec) = self.registry.module(&tag) {
                        codec.remove(scene, id);
                    }
                    if let Some(node) = self.entities.get_mut(&name) {
                        node.hashes.remove(&tag);
                    }
                    self.stats.applied += 1;
                }
            }
            // Control messages are relay-side; peers drop them
            RequestBody::Subscribe | RequestBody::Unsubscribe => {}
        }
    }

    /// Apply one module payload; refreshes the tracked hash on success so
    /// the next `track_changes` does not echo the remote edit back
    fn apply_module(
        &mut self,
        scene: &mut Scene,
        name: &str,
        id: ObjectId,
        module: &ModulePayload,
    ) -> SyncResult<()> {
        let Some(codec) = self.registry.module(&module.tag) else {
            self.stats.unknown_types += 1;
            debug!(tag = %module.tag, "skipping unknown module type");
            return Ok(());
        };
        if !self.rules.resolve(scene, id, &module.tag, Direction::Receive) {
            self.stats.denied_by_rule += 1;
            return Ok(());
        }
        codec.decode(&module.payload, scene, id)?;

        let places = self.rules.decimal_places(scene, id, &module.tag);
        let hash = scene.get(id).and_then(|obj| {
            let mut ctx = EncodeCtx {
                scene,
                places,
                resources: &mut self.resources,
            };
            codec.encode(obj, &mut ctx).map(|e| e.hash)
        });
        if let (Some(hash), Some(node)) = (hash, self.entities.get_mut(name)) {
            node.hashes.insert(module.tag.clone(), hash);
        }
        Ok(())
    }

    /// Apply one resource payload; `Ok(None)` when there is no hash to
    /// track (unknown kind, or nothing re-encoded)
    fn apply_resource(
        &mut self,
        scene: &mut Scene,
        name: &str,
        kind: &str,
        payload: &str,
    ) -> SyncResult<Option<i64>> {
        let Some(codec) = self.registry.resource(kind) else {
            self.stats.unknown_types += 1;
            debug!(tag = %kind, "skipping unknown resource type");
            return Ok(None);
        };
        // Externally discoverable asset of the right name and type
        if scene.asset(name).is_none() && self.config.prefer_existing_resources {
            if let Some(external) = scene.external_asset(name) {
                if external.tag() == kind {
                    let adopted = external.clone();
                    scene.insert_asset(name, adopted);
                }
            }
        }
        // A live asset repurposed under another type stays intact until
        // the decode succeeds; the decoded insert replaces it
        codec.decode(payload, name, scene)?;

        let hash = scene.asset(name).and_then(|asset| {
            let mut ctx = EncodeCtx {
                scene,
                places: self.rules.default_places,
                resources: &mut self.resources,
            };
            codec.encode(asset, &mut ctx).map(|e| e.hash)
        });
        match hash {
            Some(hash) => Ok(Some(hash)),
            // Nothing re-encoded; keep the previously tracked hash so an
            // unchanged asset is not sent again on the next walk
            None => Ok(self.resources.get(name).map(|node| node.hash)),
        }
    }

    fn handle_apply_failure(&mut self, request: Request, attempts: u8, err: SyncError) {
        let name = request.body.name().unwrap_or_default().to_string();
        if err.is_transient() {
            if attempts + 1 < MAX_UPDATE_ATTEMPTS {
                self.stats.retried += 1;
                self.retry_next.push(InboundEntry {
                    request,
                    attempts: attempts + 1,
                });
            } else {
                self.stats.dropped_at_cap += 1;
                warn!(%name, %err, "dropping update after {} attempts", MAX_UPDATE_ATTEMPTS);
            }
        } else {
            warn!(%name, %err, "dropping unappliable update");
        }
    }

    /// Phase 2: resolve deferred placements whose parents have arrived
    ///
    /// No attempt cap: a placement whose parent never arrives stays queued
    /// (it logs one warning once it has waited long enough).
    fn update_hierarchy(&mut self, scene: &mut Scene) {
        let mut still_waiting = VecDeque::new();
        while let Some(mut placement) = self.hierarchy.pop_front() {
            let parent_id = if placement.parent == ROOT_NAME {
                Some(scene.root())
            } else {
                self.entities
                    .get(&placement.parent)
                    .map(|n| n.object)
                    .filter(|id| scene.contains(*id))
            };
            let child_id = self
                .entities
                .get(&placement.name)
                .map(|n| n.object)
                .filter(|id| scene.contains(*id));
            match (parent_id, child_id) {
                (Some(parent), Some(child)) => {
                    // Local transform is preserved across the reparent
                    scene.set_parent(child, parent);
                    if let Some(obj) = scene.get_mut(child) {
                        obj.active = true;
                    }
                    // Mark not-locally-changed so the next tick does not
                    // echo the placement back
                    if let Some(node) = self.entities.get_mut(&placement.name) {
                        node.last_parent = Some(placement.parent.clone());
                    }
                }
                _ => {
                    placement.ticks_waiting += 1;
                    if placement.ticks_waiting >= HIERARCHY_WARN_TICKS && !placement.warned {
                        warn!(
                            name = %placement.name,
                            parent = %placement.parent,
                            "hierarchy placement still unresolved"
                        );
                        placement.warned = true;
                    }
                    still_waiting.push_back(placement);
                }
            }
        }
        self.hierarchy = still_waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Encoded, ResourceCodec};
    use weave_core::{
        Asset, Facet, MaterialAsset, MeshAsset, MeshRendererFacet, RuleBlock, RuleEntry,
        TextureAsset, Vec3,
    };

    fn engine() -> SyncEngine {
        SyncEngine::new(EngineConfig::default())
    }

    fn drain_kinds(requests: &[Request]) -> Vec<&'static str> {
        requests.iter().map(|r| r.body.discriminator()).collect()
    }

    #[test]
    fn test_new_entity_emits_object_and_component_updates() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        scene.get_mut(a).unwrap().local.position = Vec3::new(1.0, 0.0, 0.0);
        let mut engine = engine();

        let out = engine.track_changes(&mut scene, 100);
        let kinds = drain_kinds(&out);
        assert_eq!(kinds, vec!["ou", "cu"]);
        match &out[0].body {
            RequestBody::ObjectUpdate { name, parent } => {
                assert_eq!(name, "box");
                assert_eq!(parent, ROOT_NAME);
            }
            other => panic!("unexpected body {:?}", other),
        }

        // Nothing changed: second tick is quiet
        assert!(engine.track_changes(&mut scene, 101).is_empty());
    }

    #[test]
    fn test_module_change_detected_by_hash() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);

        scene.get_mut(a).unwrap().local.position = Vec3::new(2.0, 0.0, 0.0);
        let out = engine.track_changes(&mut scene, 2);
        assert_eq!(drain_kinds(&out), vec!["cu"]);
        match &out[0].body {
            RequestBody::ComponentUpdate { modules, .. } => {
                assert_eq!(modules.len(), 1);
                assert_eq!(modules[0].tag, "Transform");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_removed_object_emits_delete() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);

        scene.remove(a);
        let out = engine.track_changes(&mut scene, 2);
        assert_eq!(drain_kinds(&out), vec!["od"]);
        assert!(engine.entities().get("box").is_none());
    }

    #[test]
    fn test_rename_is_delete_then_recreate() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);

        scene.get_mut(a).unwrap().name = "crate".to_string();
        let out = engine.track_changes(&mut scene, 2);
        assert_eq!(drain_kinds(&out), vec!["od"]);

        let out = engine.track_changes(&mut scene, 3);
        assert_eq!(drain_kinds(&out), vec!["ou", "cu"]);
        assert_eq!(out[0].body.name(), Some("crate"));
    }

    #[test]
    fn test_reparent_emits_object_update() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", None);
        let b = scene.spawn("b", None);
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);

        scene.set_parent(b, a);
        let out = engine.track_changes(&mut scene, 2);
        assert_eq!(drain_kinds(&out), vec!["ou"]);
        match &out[0].body {
            RequestBody::ObjectUpdate { name, parent } => {
                assert_eq!(name, "b");
                assert_eq!(parent, "a");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_send_rule_suppresses_module() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        let entry = RuleEntry {
            enabled: true,
            send: false,
            receive: true,
            decimal_places: None,
        };
        scene.get_mut(a).unwrap().rules =
            Some(RuleBlock::new(true, false).with("Transform", entry));
        let mut engine = engine();

        let out = engine.track_changes(&mut scene, 1);
        // Object update still goes out; the transform module does not
        assert_eq!(drain_kinds(&out), vec!["ou"]);
    }

    #[test]
    fn test_incoming_object_update_defers_placement() {
        let mut scene = Scene::new();
        let mut engine = engine();

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ObjectUpdate {
                name: "child".into(),
                parent: "parent".into(),
            },
        ));
        engine.apply_changes(&mut scene);

        // Child exists but is deactivated, waiting for its parent
        let child = engine.entities().get("child").unwrap().object;
        assert!(!scene.get(child).unwrap().active);
        assert_eq!(engine.pending_placements(), 1);

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ObjectUpdate {
                name: "parent".into(),
                parent: ROOT_NAME.into(),
            },
        ));
        engine.apply_changes(&mut scene);

        let parent = engine.entities().get("parent").unwrap().object;
        assert_eq!(scene.get(child).unwrap().parent(), Some(parent));
        assert!(scene.get(child).unwrap().active);
        assert_eq!(engine.pending_placements(), 0);
    }

    #[test]
    fn test_placement_preserves_local_transform() {
        let mut scene = Scene::new();
        let mut engine = engine();

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ObjectUpdate {
                name: "child".into(),
                parent: "parent".into(),
            },
        ));
        engine.apply_changes(&mut scene);
        let child = engine.entities().get("child").unwrap().object;
        let before = scene.get(child).unwrap().local;

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ObjectUpdate {
                name: "parent".into(),
                parent: ROOT_NAME.into(),
            },
        ));
        engine.apply_changes(&mut scene);
        assert_eq!(scene.get(child).unwrap().local, before);
    }

    #[test]
    fn test_unsubscribed_channel_dropped() {
        let mut scene = Scene::new();
        let mut engine = engine();

        engine.queue_incoming(Request::new(
            "other-channel",
            1,
            RequestBody::ObjectUpdate {
                name: "ghost".into(),
                parent: ROOT_NAME.into(),
            },
        ));
        engine.apply_changes(&mut scene);
        assert!(engine.entities().get("ghost").is_none());
    }

    #[test]
    fn test_component_update_creates_entity_and_applies() {
        let mut scene = Scene::new();
        let mut engine = engine();

        let payload = serde_json::to_string(&weave_core::Transform {
            position: Vec3::new(5.0, 0.0, 0.0),
            ..Default::default()
        })
        .unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ComponentUpdate {
                name: "box".into(),
                modules: vec![ModulePayload {
                    tag: "Transform".into(),
                    payload,
                }],
            },
        ));
        engine.apply_changes(&mut scene);

        let id = engine.entities().get("box").unwrap().object;
        assert_eq!(scene.get(id).unwrap().local.position, Vec3::new(5.0, 0.0, 0.0));
        // Applied state is not echoed back on the next tick
        let out = engine.track_changes(&mut scene, 2);
        assert!(
            !out.iter()
                .any(|r| matches!(r.body, RequestBody::ComponentUpdate { .. })),
            "unexpected echo: {:?}",
            out
        );
    }

    #[test]
    fn test_dependency_retry_until_resource_arrives() {
        let mut scene = Scene::new();
        let mut engine = engine();

        let renderer = serde_json::to_string(&MeshRendererFacet {
            mesh: "cube".into(),
            material: "plain".into(),
        })
        .unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ComponentUpdate {
                name: "box".into(),
                modules: vec![ModulePayload {
                    tag: "MeshRenderer".into(),
                    payload: renderer,
                }],
            },
        ));
        engine.apply_changes(&mut scene);
        assert_eq!(engine.stats().retried, 1);

        // Resources arrive; queued retry resolves on the next tick
        scene.insert_asset("cube", Asset::Mesh(MeshAsset::default()));
        scene.insert_asset(
            "plain",
            Asset::Material(MaterialAsset {
                color: [1.0; 4],
                shader: "standard".into(),
                texture: None,
            }),
        );
        engine.apply_changes(&mut scene);

        let id = engine.entities().get("box").unwrap().object;
        assert!(scene.get(id).unwrap().facet("MeshRenderer").is_some());
    }

    #[test]
    fn test_retry_cap_drops_without_corruption() {
        let mut scene = Scene::new();
        let mut engine = engine();

        let payload = serde_json::to_string(&MaterialAsset {
            color: [1.0; 4],
            shader: "standard".into(),
            texture: Some("never-arrives".into()),
        })
        .unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ResourceUpdate {
                name: "mat".into(),
                kind: "Material".into(),
                payload,
            },
        ));

        for _ in 0..(MAX_UPDATE_ATTEMPTS as usize + 2) {
            engine.apply_changes(&mut scene);
        }
        assert_eq!(engine.stats().dropped_at_cap, 1);
        assert_eq!(engine.pending_retries(), 0);
        // No partially-applied resource
        assert!(scene.asset("mat").is_none());
        assert!(!engine.resources().contains("mat"));
    }

    #[test]
    fn test_blocked_module_not_clobbered_by_outgoing() {
        let mut scene = Scene::new();
        let mut engine = engine();

        // A renderer update waiting on resources keeps retrying
        let renderer = serde_json::to_string(&MeshRendererFacet {
            mesh: "cube".into(),
            material: "plain".into(),
        })
        .unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ComponentUpdate {
                name: "box".into(),
                modules: vec![ModulePayload {
                    tag: "MeshRenderer".into(),
                    payload: renderer,
                }],
            },
        ));
        engine.apply_changes(&mut scene);
        assert_eq!(engine.pending_retries(), 1);

        // Attach a local renderer facet; it must not be sent while the
        // incoming one is in flight
        let id = engine.entities().get("box").unwrap().object;
        scene.get_mut(id).unwrap().set_facet(Facet::MeshRenderer(MeshRendererFacet {
            mesh: "local".into(),
            material: "local".into(),
        }));
        let out = engine.track_changes(&mut scene, 2);
        for request in &out {
            if let RequestBody::ComponentUpdate { modules, .. } = &request.body {
                assert!(modules.iter().all(|m| m.tag != "MeshRenderer"));
            }
        }
    }

    #[test]
    fn test_resource_tracked_and_broadcast_via_renderer_reference() {
        let mut scene = Scene::new();
        scene.insert_asset("cube", Asset::Mesh(MeshAsset {
            vertices: vec![[0.0, 0.0, 0.0]],
            ..Default::default()
        }));
        scene.insert_asset(
            "plain",
            Asset::Material(MaterialAsset {
                color: [1.0; 4],
                shader: "standard".into(),
                texture: Some("wood".into()),
            }),
        );
        scene.insert_asset("wood", Asset::Texture(TextureAsset::default()));
        let a = scene.spawn("box", None);
        scene.get_mut(a).unwrap().set_facet(Facet::MeshRenderer(MeshRendererFacet {
            mesh: "cube".into(),
            material: "plain".into(),
        }));

        let mut engine = engine();
        let out = engine.track_changes(&mut scene, 1);

        let resource_names: Vec<_> = out
            .iter()
            .filter_map(|r| match &r.body {
                RequestBody::ResourceUpdate { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        // The renderer registers cube+plain; encoding plain registers wood
        // mid-walk and the index walk still reaches it
        assert_eq!(resource_names, vec!["cube", "plain", "wood"]);
    }

    #[test]
    fn test_removed_asset_emits_resource_delete() {
        let mut scene = Scene::new();
        scene.insert_asset("cube", Asset::Mesh(MeshAsset::default()));
        scene.insert_asset(
            "plain",
            Asset::Material(MaterialAsset {
                color: [1.0; 4],
                shader: "standard".into(),
                texture: None,
            }),
        );
        let a = scene.spawn("box", None);
        scene.get_mut(a).unwrap().set_facet(Facet::MeshRenderer(MeshRendererFacet {
            mesh: "cube".into(),
            material: "plain".into(),
        }));
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);
        assert!(engine.resources().contains("cube"));

        scene.remove_asset("cube");
        let out = engine.track_changes(&mut scene, 2);
        assert!(out
            .iter()
            .any(|r| matches!(&r.body, RequestBody::ResourceDelete { name } if name == "cube")));
        assert!(!engine.resources().contains("cube"));
    }

    #[test]
    fn test_component_delete_removes_facet_and_hash() {
        let mut scene = Scene::new();
        let a = scene.spawn("box", None);
        scene.get_mut(a).unwrap().set_facet(Facet::Camera(weave_core::CameraFacet {
            fov: 60.0,
            near: 0.1,
            far: 100.0,
        }));
        let mut engine = engine();
        engine.track_changes(&mut scene, 1);
        assert!(engine.entities().get("box").unwrap().hashes.contains_key("Camera"));

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            2,
            RequestBody::ComponentDelete {
                name: "box".into(),
                tags: vec!["Camera".into()],
            },
        ));
        engine.apply_changes(&mut scene);
        assert!(scene.get(a).unwrap().facet("Camera").is_none());
        assert!(!engine.entities().get("box").unwrap().hashes.contains_key("Camera"));
    }

    #[test]
    fn test_repurposed_asset_survives_failed_apply() {
        let mut scene = Scene::new();
        scene.insert_asset("mat", Asset::Texture(TextureAsset::default()));
        let mut engine = engine();

        // Repurposes "mat" as a material whose texture is still in flight
        let payload = serde_json::to_string(&MaterialAsset {
            color: [1.0; 4],
            shader: "standard".into(),
            texture: Some("wood".into()),
        })
        .unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ResourceUpdate {
                name: "mat".into(),
                kind: "Material".into(),
                payload,
            },
        ));
        engine.apply_changes(&mut scene);

        // The old asset stays live while the update waits on its dependency
        assert!(matches!(scene.asset("mat"), Some(Asset::Texture(_))));
        assert_eq!(engine.pending_retries(), 1);

        let texture = serde_json::to_string(&TextureAsset::default()).unwrap();
        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            2,
            RequestBody::ResourceUpdate {
                name: "wood".into(),
                kind: "Texture".into(),
                payload: texture,
            },
        ));
        // First pass retries before "wood" lands, second pass resolves
        engine.apply_changes(&mut scene);
        assert!(matches!(scene.asset("mat"), Some(Asset::Texture(_))));
        engine.apply_changes(&mut scene);
        assert!(matches!(scene.asset("mat"), Some(Asset::Material(_))));
        assert_eq!(engine.pending_retries(), 0);
    }

    struct OpaqueCodec;

    impl ResourceCodec for OpaqueCodec {
        fn tag(&self) -> &'static str {
            "Opaque"
        }

        fn encode(&self, _asset: &Asset, _ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
            None
        }

        fn decode(&self, _payload: &str, name: &str, scene: &mut Scene) -> SyncResult<()> {
            scene.insert_asset(name, Asset::Texture(TextureAsset::default()));
            Ok(())
        }
    }

    #[test]
    fn test_unencodable_resource_leaves_no_tracked_hash() {
        let mut scene = Scene::new();
        let mut registry = CodecRegistry::with_defaults();
        registry.register_resource(Box::new(OpaqueCodec));
        let mut engine =
            SyncEngine::with_registry(EngineConfig::default(), registry, RuleResolver::new());

        engine.queue_incoming(Request::new(
            DEFAULT_CHANNEL,
            1,
            RequestBody::ResourceUpdate {
                name: "blob".into(),
                kind: "Opaque".into(),
                payload: "{}".into(),
            },
        ));
        engine.apply_changes(&mut scene);

        // Applied but never re-encoded: nothing tracked, nothing to diff
        assert!(engine.resources().get("blob").is_none());
        assert!(engine.track_changes(&mut scene, 2).is_empty());
    }
}
