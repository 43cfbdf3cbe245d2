//! Codec registry
//!
//! An explicit mapping table from live type tag to encode/decode/hash
//! functions, built at startup. No runtime type discovery: a codec author
//! writes one encoder, one decoder, and one hash that enumerates exactly
//! the fields that matter, folding array fields element-wise so reorders
//! change the hash. Unknown tags are skipped, never errored.

use std::collections::HashMap;

use weave_core::{
    round_places, Asset, CameraFacet, Facet, FieldHasher, LightFacet, LightKind, MaterialAsset,
    MeshAsset, MeshRendererFacet, ObjectId, Quat, Scene, SceneObject, SyncError, SyncResult,
    TextureAsset, Transform, Vec3,
};

use crate::store::ResourceStore;

/// Result of encoding one live facet or asset
#[derive(Clone, Debug)]
pub struct Encoded {
    /// JSON payload string as sent on the wire
    pub payload: String,
    /// Content hash of the payload fields, after precision rounding
    pub hash: i64,
}

/// Context handed to encoders
pub struct EncodeCtx<'a> {
    /// The scene, for resolving asset references
    pub scene: &'a Scene,
    /// Decimal precision for float fields
    pub places: u8,
    /// Resource store; encoders register referenced assets here so the
    /// resource walk picks them up, including mid-walk
    pub resources: &'a mut ResourceStore,
}

impl EncodeCtx<'_> {
    /// Whether an asset is resolvable, live or external
    pub fn has_asset(&self, name: &str) -> bool {
        self.scene.asset(name).is_some() || self.scene.external_asset(name).is_some()
    }
}

/// Codec for one module (entity facet) type
pub trait ModuleCodec: Send + Sync {
    /// Stable type tag; registry key and wire type string
    fn tag(&self) -> &'static str;

    /// Encode the live facet; `None` when the object does not carry it
    fn encode(&self, obj: &SceneObject, ctx: &mut EncodeCtx<'_>) -> Option<Encoded>;

    /// Apply a payload to the live object
    fn decode(&self, payload: &str, scene: &mut Scene, id: ObjectId) -> SyncResult<()>;

    /// Remove the live facet
    fn remove(&self, scene: &mut Scene, id: ObjectId) {
        if let Some(obj) = scene.get_mut(id) {
            obj.remove_facet(self.tag());
        }
    }
}

/// Codec for one resource (shared asset) type
pub trait ResourceCodec: Send + Sync {
    /// Stable type tag; registry key and wire type string
    fn tag(&self) -> &'static str;

    /// Encode the live asset; `None` on a type mismatch
    fn encode(&self, asset: &Asset, ctx: &mut EncodeCtx<'_>) -> Option<Encoded>;

    /// Create or update the named live asset from a payload
    ///
    /// Must not partially apply: dependency checks happen before any
    /// mutation so a failed apply leaves the pool untouched.
    fn decode(&self, payload: &str, name: &str, scene: &mut Scene) -> SyncResult<()>;
}

/// The startup-built codec table
pub struct CodecRegistry {
    module_order: Vec<&'static str>,
    modules: HashMap<&'static str, Box<dyn ModuleCodec>>,
    resources: HashMap<&'static str, Box<dyn ResourceCodec>>,
}

impl CodecRegistry {
    /// Empty registry; synchronizes nothing until codecs are registered
    pub fn new() -> Self {
        CodecRegistry {
            module_order: Vec::new(),
            modules: HashMap::new(),
            resources: HashMap::new(),
        }
    }

    /// Registry with the built-in codec set
    pub fn with_defaults() -> Self {
        let mut registry = CodecRegistry::new();
        registry.register_module(Box::new(TransformCodec));
        registry.register_module(Box::new(CameraCodec));
        registry.register_module(Box::new(LightCodec));
        registry.register_module(Box::new(MeshRendererCodec));
        registry.register_resource(Box::new(TextureCodec));
        registry.register_resource(Box::new(MaterialCodec));
        registry.register_resource(Box::new(MeshCodec));
        registry
    }

    pub fn register_module(&mut self, codec: Box<dyn ModuleCodec>) {
        let tag = codec.tag();
        if self.modules.insert(tag, codec).is_none() {
            self.module_order.push(tag);
        }
    }

    pub fn register_resource(&mut self, codec: Box<dyn ResourceCodec>) {
        self.resources.insert(codec.tag(), codec);
    }

    pub fn module(&self, tag: &str) -> Option<&dyn ModuleCodec> {
        self.modules.get(tag).map(Box::as_ref)
    }

    pub fn resource(&self, tag: &str) -> Option<&dyn ResourceCodec> {
        self.resources.get(tag).map(Box::as_ref)
    }

    /// Module tags in registration order
    pub fn module_tags(&self) -> &[&'static str] {
        &self.module_order
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn round_vec3(v: Vec3, places: u8) -> Vec3 {
    Vec3::new(
        round_places(v.x, places),
        round_places(v.y, places),
        round_places(v.z, places),
    )
}

fn round_quat(q: Quat, places: u8) -> Quat {
    Quat {
        x: round_places(q.x, places),
        y: round_places(q.y, places),
        z: round_places(q.z, places),
        w: round_places(q.w, places),
    }
}

fn round4(v: [f32; 4], places: u8) -> [f32; 4] {
    [
        round_places(v[0], places),
        round_places(v[1], places),
        round_places(v[2], places),
        round_places(v[3], places),
    ]
}

fn to_payload<T: serde::Serialize>(value: &T, hash: i64) -> Option<Encoded> {
    serde_json::to_string(value)
        .ok()
        .map(|payload| Encoded { payload, hash })
}

fn parse_payload<T: serde::de::DeserializeOwned>(tag: &str, payload: &str) -> SyncResult<T> {
    serde_json::from_str(payload).map_err(|e| SyncError::PayloadMismatch {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

/// Transform codec; every object carries a transform, so encode always
/// yields a payload
pub struct TransformCodec;

impl TransformCodec {
    fn hash(t: &Transform) -> i64 {
        let mut h = FieldHasher::new();
        h.write_f32(t.position.x)
            .write_f32(t.position.y)
            .write_f32(t.position.z)
            .write_f32(t.rotation.x)
            .write_f32(t.rotation.y)
            .write_f32(t.rotation.z)
            .write_f32(t.rotation.w)
            .write_f32(t.scale.x)
            .write_f32(t.scale.y)
            .write_f32(t.scale.z);
        h.finish()
    }
}

impl ModuleCodec for TransformCodec {
    fn tag(&self) -> &'static str {
        "Transform"
    }

    fn encode(&self, obj: &SceneObject, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let rounded = Transform {
            position: round_vec3(obj.local.position, ctx.places),
            rotation: round_quat(obj.local.rotation, ctx.places),
            scale: round_vec3(obj.local.scale, ctx.places),
        };
        to_payload(&rounded, Self::hash(&rounded))
    }

    fn decode(&self, payload: &str, scene: &mut Scene, id: ObjectId) -> SyncResult<()> {
        let transform: Transform = parse_payload(self.tag(), payload)?;
        let obj = scene
            .get_mut(id)
            .ok_or_else(|| SyncError::MissingObject(id.to_string()))?;
        obj.local = transform;
        Ok(())
    }

    /// A transform cannot be detached; removal resets it
    fn remove(&self, scene: &mut Scene, id: ObjectId) {
        if let Some(obj) = scene.get_mut(id) {
            obj.local = Transform::default();
        }
    }
}

/// Camera parameters codec
pub struct CameraCodec;

impl ModuleCodec for CameraCodec {
    fn tag(&self) -> &'static str {
        "Camera"
    }

    fn encode(&self, obj: &SceneObject, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Some(Facet::Camera(cam)) = obj.facet(self.tag()) else {
            return None;
        };
        let rounded = CameraFacet {
            fov: round_places(cam.fov, ctx.places),
            near: round_places(cam.near, ctx.places),
            far: round_places(cam.far, ctx.places),
        };
        let mut h = FieldHasher::new();
        h.write_f32(rounded.fov)
            .write_f32(rounded.near)
            .write_f32(rounded.far);
        to_payload(&rounded, h.finish())
    }

    fn decode(&self, payload: &str, scene: &mut Scene, id: ObjectId) -> SyncResult<()> {
        let cam: CameraFacet = parse_payload(self.tag(), payload)?;
        let obj = scene
            .get_mut(id)
            .ok_or_else(|| SyncError::MissingObject(id.to_string()))?;
        obj.set_facet(Facet::Camera(cam));
        Ok(())
    }
}

/// Light parameters codec
pub struct LightCodec;

impl LightCodec {
    fn kind_ordinal(kind: LightKind) -> i64 {
        match kind {
            LightKind::Directional => 0,
            LightKind::Point => 1,
            LightKind::Spot => 2,
        }
    }
}

impl ModuleCodec for LightCodec {
    fn tag(&self) -> &'static str {
        "Light"
    }

    fn encode(&self, obj: &SceneObject, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Some(Facet::Light(light)) = obj.facet(self.tag()) else {
            return None;
        };
        let rounded = LightFacet {
            kind: light.kind,
            color: round4(light.color, ctx.places),
            intensity: round_places(light.intensity, ctx.places),
            range: round_places(light.range, ctx.places),
        };
        let mut h = FieldHasher::new();
        h.write_i64(Self::kind_ordinal(rounded.kind));
        h.write_f32_slice(&rounded.color);
        h.write_f32(rounded.intensity).write_f32(rounded.range);
        to_payload(&rounded, h.finish())
    }

    fn decode(&self, payload: &str, scene: &mut Scene, id: ObjectId) -> SyncResult<()> {
        let light: LightFacet = parse_payload(self.tag(), payload)?;
        let obj = scene
            .get_mut(id)
            .ok_or_else(|| SyncError::MissingObject(id.to_string()))?;
        obj.set_facet(Facet::Light(light));
        Ok(())
    }
}

/// Mesh renderer codec; references mesh and material assets by name
///
/// Encoding registers the referenced assets with the resource store so
/// the resource walk broadcasts them; applying fails until both
/// references resolve, which drives the dependency-retry path.
pub struct MeshRendererCodec;

impl ModuleCodec for MeshRendererCodec {
    fn tag(&self) -> &'static str {
        "MeshRenderer"
    }

    fn encode(&self, obj: &SceneObject, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Some(Facet::MeshRenderer(renderer)) = obj.facet(self.tag()) else {
            return None;
        };
        if ctx.has_asset(&renderer.mesh) {
            ctx.resources.reference(&renderer.mesh, "Mesh");
        }
        if ctx.has_asset(&renderer.material) {
            ctx.resources.reference(&renderer.material, "Material");
        }
        let mut h = FieldHasher::new();
        h.write_str(&renderer.mesh).write_str(&renderer.material);
        to_payload(renderer, h.finish())
    }

    fn decode(&self, payload: &str, scene: &mut Scene, id: ObjectId) -> SyncResult<()> {
        let renderer: MeshRendererFacet = parse_payload(self.tag(), payload)?;
        for reference in [&renderer.mesh, &renderer.material] {
            if scene.asset(reference).is_none() && scene.external_asset(reference).is_none() {
                return Err(SyncError::MissingResource(reference.clone()));
            }
        }
        let obj = scene
            .get_mut(id)
            .ok_or_else(|| SyncError::MissingObject(id.to_string()))?;
        obj.set_facet(Facet::MeshRenderer(renderer));
        Ok(())
    }
}

/// Mesh geometry codec
///
/// Every array field folds element-wise: reordering vertices or indices
/// changes the hash.
pub struct MeshCodec;

impl ResourceCodec for MeshCodec {
    fn tag(&self) -> &'static str {
        "Mesh"
    }

    fn encode(&self, asset: &Asset, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Asset::Mesh(mesh) = asset else {
            return None;
        };
        let rounded = MeshAsset {
            vertices: mesh
                .vertices
                .iter()
                .map(|v| {
                    [
                        round_places(v[0], ctx.places),
                        round_places(v[1], ctx.places),
                        round_places(v[2], ctx.places),
                    ]
                })
                .collect(),
            normals: mesh
                .normals
                .iter()
                .map(|v| {
                    [
                        round_places(v[0], ctx.places),
                        round_places(v[1], ctx.places),
                        round_places(v[2], ctx.places),
                    ]
                })
                .collect(),
            uvs: mesh
                .uvs
                .iter()
                .map(|v| [round_places(v[0], ctx.places), round_places(v[1], ctx.places)])
                .collect(),
            triangles: mesh.triangles.clone(),
        };
        let mut h = FieldHasher::new();
        for v in &rounded.vertices {
            h.write_f32_slice(v);
        }
        for n in &rounded.normals {
            h.write_f32_slice(n);
        }
        for uv in &rounded.uvs {
            h.write_f32_slice(uv);
        }
        h.write_u32_slice(&rounded.triangles);
        to_payload(&rounded, h.finish())
    }

    fn decode(&self, payload: &str, name: &str, scene: &mut Scene) -> SyncResult<()> {
        let mesh: MeshAsset = parse_payload(self.tag(), payload)?;
        scene.insert_asset(name, Asset::Mesh(mesh));
        Ok(())
    }
}

/// Material codec; may reference a texture asset
pub struct MaterialCodec;

impl ResourceCodec for MaterialCodec {
    fn tag(&self) -> &'static str {
        "Material"
    }

    fn encode(&self, asset: &Asset, ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Asset::Material(material) = asset else {
            return None;
        };
        if let Some(texture) = &material.texture {
            if ctx.has_asset(texture) {
                ctx.resources.reference(texture, "Texture");
            }
        }
        let rounded = MaterialAsset {
            color: round4(material.color, ctx.places),
            shader: material.shader.clone(),
            texture: material.texture.clone(),
        };
        let mut h = FieldHasher::new();
        h.write_f32_slice(&rounded.color);
        h.write_str(&rounded.shader);
        h.write_bool(rounded.texture.is_some());
        if let Some(texture) = &rounded.texture {
            h.write_str(texture);
        }
        to_payload(&rounded, h.finish())
    }

    fn decode(&self, payload: &str, name: &str, scene: &mut Scene) -> SyncResult<()> {
        let material: MaterialAsset = parse_payload(self.tag(), payload)?;
        if let Some(texture) = &material.texture {
            if scene.asset(texture).is_none() && scene.external_asset(texture).is_none() {
                return Err(SyncError::MissingResource(texture.clone()));
            }
        }
        scene.insert_asset(name, Asset::Material(material));
        Ok(())
    }
}

/// Texture codec
pub struct TextureCodec;

impl ResourceCodec for TextureCodec {
    fn tag(&self) -> &'static str {
        "Texture"
    }

    fn encode(&self, asset: &Asset, _ctx: &mut EncodeCtx<'_>) -> Option<Encoded> {
        let Asset::Texture(texture) = asset else {
            return None;
        };
        let mut h = FieldHasher::new();
        h.write_u32(texture.width).write_u32(texture.height);
        for &b in &texture.data {
            h.write_i64(b as i64);
        }
        to_payload(texture, h.finish())
    }

    fn decode(&self, payload: &str, name: &str, scene: &mut Scene) -> SyncResult<()> {
        let texture: TextureAsset = parse_payload(self.tag(), payload)?;
        scene.insert_asset(name, Asset::Texture(texture));
        Ok(())
    }
}
