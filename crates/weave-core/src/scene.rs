//! Live scene model
//!
//! The scene is the peer-local, mutable world the sync engine observes and
//! mutates: a forest of named objects rooted at a well-known `root` object,
//! plus a pool of named shared assets. The engine never owns the scene; the
//! host application mutates it freely between ticks.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::id::ObjectId;
use crate::rules::RuleBlock;

/// Name of the root object; the root itself is never synchronized
pub const ROOT_NAME: &str = "root";

/// 3-component vector
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Vec3 = Vec3 { x: 1.0, y: 1.0, z: 1.0 };

    #[inline]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }
}

/// Rotation quaternion
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };
}

/// Local (parent-relative) transform of a scene object
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Transform {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

/// Kind of light source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
}

/// Light parameters facet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightFacet {
    pub kind: LightKind,
    pub color: [f32; 4],
    pub intensity: f32,
    pub range: f32,
}

/// Camera parameters facet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraFacet {
    pub fov: f32,
    pub near: f32,
    pub far: f32,
}

/// Mesh renderer facet; references shared assets by name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshRendererFacet {
    pub mesh: String,
    pub material: String,
}

/// A typed facet attached to a scene object
///
/// The transform is not a facet: every object carries one. Facets cover
/// the optional, typed data the codec registry knows how to synchronize.
#[derive(Clone, Debug, PartialEq)]
pub enum Facet {
    Light(LightFacet),
    Camera(CameraFacet),
    MeshRenderer(MeshRendererFacet),
}

impl Facet {
    /// Stable type tag, used as codec registry key and wire type string
    pub fn tag(&self) -> &'static str {
        match self {
            Facet::Light(_) => "Light",
            Facet::Camera(_) => "Camera",
            Facet::MeshRenderer(_) => "MeshRenderer",
        }
    }
}

/// Mesh geometry asset
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshAsset {
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub triangles: Vec<u32>,
}

/// Material asset; may reference a texture asset by name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialAsset {
    pub color: [f32; 4],
    pub shader: String,
    pub texture: Option<String>,
}

/// Texture asset
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct TextureAsset {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A named shared asset
#[derive(Clone, Debug, PartialEq)]
pub enum Asset {
    Mesh(MeshAsset),
    Material(MaterialAsset),
    Texture(TextureAsset),
}

impl Asset {
    /// Stable type tag, used as codec registry key and wire type string
    pub fn tag(&self) -> &'static str {
        match self {
            Asset::Mesh(_) => "Mesh",
            Asset::Material(_) => "Material",
            Asset::Texture(_) => "Texture",
        }
    }
}

/// A live object in the scene forest
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub id: ObjectId,
    pub name: String,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
    pub active: bool,
    pub local: Transform,
    facets: BTreeMap<String, Facet>,
    pub rules: Option<RuleBlock>,
}

impl SceneObject {
    fn new(id: ObjectId, name: impl Into<String>, parent: Option<ObjectId>) -> Self {
        SceneObject {
            id,
            name: name.into(),
            parent,
            children: Vec::new(),
            active: true,
            local: Transform::default(),
            facets: BTreeMap::new(),
            rules: None,
        }
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn facet(&self, tag: &str) -> Option<&Facet> {
        self.facets.get(tag)
    }

    pub fn facet_mut(&mut self, tag: &str) -> Option<&mut Facet> {
        self.facets.get_mut(tag)
    }

    pub fn set_facet(&mut self, facet: Facet) {
        self.facets.insert(facet.tag().to_string(), facet);
    }

    pub fn remove_facet(&mut self, tag: &str) -> Option<Facet> {
        self.facets.remove(tag)
    }

    /// Tags of all attached facets, in deterministic order
    pub fn facet_tags(&self) -> impl Iterator<Item = &str> {
        self.facets.keys().map(|k| k.as_str())
    }
}

/// The peer-local scene: object forest plus asset pools
#[derive(Debug)]
pub struct Scene {
    objects: HashMap<ObjectId, SceneObject>,
    root: ObjectId,
    next_id: u64,
    assets: HashMap<String, Asset>,
    external_assets: HashMap<String, Asset>,
}

impl Scene {
    /// Create a scene containing only the root object
    pub fn new() -> Self {
        let root = ObjectId::new(0);
        let mut objects = HashMap::new();
        objects.insert(root, SceneObject::new(root, ROOT_NAME, None));
        Scene {
            objects,
            root,
            next_id: 1,
            assets: HashMap::new(),
            external_assets: HashMap::new(),
        }
    }

    pub fn root(&self) -> ObjectId {
        self.root
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Spawn a new object under the given parent (root if `None`)
    pub fn spawn(&mut self, name: impl Into<String>, parent: Option<ObjectId>) -> ObjectId {
        let id = ObjectId::new(self.next_id);
        self.next_id += 1;
        let parent = parent.filter(|p| self.objects.contains_key(p)).unwrap_or(self.root);
        self.objects.insert(id, SceneObject::new(id, name, Some(parent)));
        if let Some(p) = self.objects.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Remove an object and its entire subtree
    pub fn remove(&mut self, id: ObjectId) {
        if id == self.root {
            return;
        }
        let Some(obj) = self.objects.remove(&id) else {
            return;
        };
        if let Some(parent) = obj.parent.and_then(|p| self.objects.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        for child in obj.children {
            self.remove_subtree(child);
        }
    }

    fn remove_subtree(&mut self, id: ObjectId) {
        if let Some(obj) = self.objects.remove(&id) {
            for child in obj.children {
                self.remove_subtree(child);
            }
        }
    }

    /// Reparent an object, preserving its local transform
    ///
    /// The local position/rotation/scale are left untouched; reparenting
    /// must not implicitly move the object.
    pub fn set_parent(&mut self, id: ObjectId, new_parent: ObjectId) -> bool {
        if id == self.root
            || !self.objects.contains_key(&id)
            || !self.objects.contains_key(&new_parent)
            || id == new_parent
        {
            return false;
        }
        let old = self.objects.get(&id).and_then(|o| o.parent);
        if old == Some(new_parent) {
            return true;
        }
        if let Some(old) = old.and_then(|p| self.objects.get_mut(&p)) {
            old.children.retain(|c| *c != id);
        }
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.parent = Some(new_parent);
        }
        if let Some(parent) = self.objects.get_mut(&new_parent) {
            parent.children.push(id);
        }
        true
    }

    /// Whether an object is reachable from the root
    pub fn is_reachable(&self, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == self.root {
                return true;
            }
            current = self.objects.get(&cur).and_then(|o| o.parent);
        }
        false
    }

    /// All objects reachable from the root, depth-first, root excluded
    pub fn reachable(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut stack: Vec<ObjectId> = self
            .objects
            .get(&self.root)
            .map(|r| r.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(obj) = self.objects.get(&id) {
                out.push(id);
                stack.extend(obj.children.iter().rev().copied());
            }
        }
        out
    }

    /// Find a reachable object by name (tree search from root)
    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.reachable()
            .into_iter()
            .find(|id| self.objects.get(id).map(|o| o.name.as_str()) == Some(name))
    }

    // Asset pool

    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    pub fn asset_mut(&mut self, name: &str) -> Option<&mut Asset> {
        self.assets.get_mut(name)
    }

    pub fn insert_asset(&mut self, name: impl Into<String>, asset: Asset) {
        self.assets.insert(name.into(), asset);
    }

    pub fn remove_asset(&mut self, name: &str) -> Option<Asset> {
        self.assets.remove(name)
    }

    /// Read-only lookup in the external asset pool (project-provided
    /// assets the engine may adopt but never mutates in place)
    pub fn external_asset(&self, name: &str) -> Option<&Asset> {
        self.external_assets.get(name)
    }

    pub fn add_external_asset(&mut self, name: impl Into<String>, asset: Asset) {
        self.external_assets.insert(name.into(), asset);
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
