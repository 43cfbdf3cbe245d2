//! Entity and resource tracking stores
//!
//! Stores record, per reference name, what has last been sent for a live
//! object or asset. They are mutated only by the engine; the live scene is
//! the source of truth and the stores lag one tick behind it.

use std::collections::HashMap;

use weave_core::{ObjectId, Scene, ROOT_NAME};

/// Tracking wrapper for one synchronized entity
#[derive(Clone, Debug)]
pub struct EntityNode {
    /// Live object handle
    pub object: ObjectId,
    /// Live name at registration time; a live rename invalidates the node
    pub base_name: String,
    /// Parent reference name last sent (None = never sent)
    pub last_parent: Option<String>,
    /// Module tag -> last-sent content hash
    pub hashes: HashMap<String, i64>,
}

impl EntityNode {
    fn new(object: ObjectId, base_name: impl Into<String>) -> Self {
        EntityNode {
            object,
            base_name: base_name.into(),
            last_parent: None,
            hashes: HashMap::new(),
        }
    }
}

/// Mapping reference name -> entity node
#[derive(Debug, Default)]
pub struct EntityStore {
    nodes: HashMap<String, EntityNode>,
    by_object: HashMap<ObjectId, String>,
}

impl EntityStore {
    pub fn new() -> Self {
        EntityStore::default()
    }

    pub fn get(&self, name: &str) -> Option<&EntityNode> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut EntityNode> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of tracked names; safe to iterate while mutating the store
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Reference name under which an object is tracked, if any
    pub fn name_of(&self, id: ObjectId) -> Option<&str> {
        self.by_object.get(&id).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<EntityNode> {
        let node = self.nodes.remove(name)?;
        self.by_object.remove(&node.object);
        Some(node)
    }

    /// Resolve the unique reference name for a live object
    ///
    /// Collisions with a different tracked object are resolved by
    /// appending the object's stable identity suffix until unique, so the
    /// store never silently merges two distinct live objects.
    pub fn reference_name(&self, scene: &Scene, id: ObjectId) -> Option<String> {
        let obj = scene.get(id)?;
        let mut name = obj.name.clone();
        loop {
            match self.nodes.get(&name) {
                Some(node) if node.object != id => name.push_str(&id.suffix()),
                _ => return Some(name),
            }
        }
    }

    /// Register a live object under its unique reference name
    ///
    /// Returns the assigned name; a no-op if the object is already
    /// tracked. The root object is never registered.
    pub fn register(&mut self, scene: &Scene, id: ObjectId) -> Option<String> {
        if id == scene.root() {
            return None;
        }
        if let Some(name) = self.name_of(id) {
            return Some(name.to_string());
        }
        let name = self.reference_name(scene, id)?;
        let base = scene.get(id)?.name.clone();
        self.nodes.insert(name.clone(), EntityNode::new(id, base));
        self.by_object.insert(id, name.clone());
        Some(name)
    }

    /// Return the tracked object for a name, adopting or creating one
    ///
    /// Priority order: an existing tracked node whose live object is still
    /// present; an existing live object found by name-based tree search
    /// (when `prefer_existing` is set); a newly spawned empty object
    /// parented under `root`.
    pub fn get_or_create(
        &mut self,
        scene: &mut Scene,
        name: &str,
        prefer_existing: bool,
    ) -> ObjectId {
        if name == ROOT_NAME {
            return scene.root();
        }
        if let Some(node) = self.nodes.get(name) {
            if scene.contains(node.object) {
                return node.object;
            }
            // Tracked but the live object is gone; re-create below
            let stale = node.object;
            self.nodes.remove(name);
            self.by_object.remove(&stale);
        }
        if prefer_existing {
            if let Some(id) = scene.find_by_name(name) {
                if id != scene.root() && self.name_of(id).is_none() {
                    let base = scene.get(id).map(|o| o.name.clone()).unwrap_or_default();
                    self.nodes.insert(name.to_string(), EntityNode::new(id, base));
                    self.by_object.insert(id, name.to_string());
                    return id;
                }
            }
        }
        let id = scene.spawn(name, None);
        self.nodes.insert(name.to_string(), EntityNode::new(id, name));
        self.by_object.insert(id, name.to_string());
        id
    }
}

/// Tracking wrapper for one synchronized resource
#[derive(Clone, Debug)]
pub struct ResourceNode {
    /// Resource type tag, e.g. `Mesh`
    pub kind: String,
    /// Last-sent content hash (0 = never sent)
    pub hash: i64,
}

/// Ordered mapping reference name -> resource node
///
/// Iteration is by insertion-order index, not map enumeration: module
/// encoders may append referenced resources mid-walk and the walk must
/// still visit them, reproducibly.
#[derive(Debug, Default)]
pub struct ResourceStore {
    order: Vec<String>,
    nodes: HashMap<String, ResourceNode>,
}

impl ResourceStore {
    pub fn new() -> Self {
        ResourceStore::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Name at a stable insertion-order index
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.order.get(index).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResourceNode> {
        self.nodes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Track a referenced resource; appends to the walk order if new
    pub fn reference(&mut self, name: &str, kind: &str) {
        if !self.nodes.contains_key(name) {
            self.order.push(name.to_string());
            self.nodes.insert(
                name.to_string(),
                ResourceNode {
                    kind: kind.to_string(),
                    hash: 0,
                },
            );
        }
    }

    /// Track with a known hash, replacing any previous node of the name
    pub fn insert(&mut self, name: &str, kind: &str, hash: i64) {
        if !self.nodes.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.nodes.insert(
            name.to_string(),
            ResourceNode {
                kind: kind.to_string(),
                hash,
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<ResourceNode> {
        let node = self.nodes.remove(name)?;
        self.order.retain(|n| n != name);
        Some(node)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
