//! WEAVE Core - Scene model and shared primitives
//!
//! This crate defines the types used throughout WEAVE:
//! - The live scene graph (objects, transforms, facets, assets)
//! - Reference-name identities
//! - Hierarchical sync-rule blocks and their resolver
//! - The order-sensitive field hash used for change detection
//! - Error taxonomy

pub mod error;
pub mod hash;
pub mod id;
pub mod rules;
pub mod scene;

pub use error::*;
pub use hash::*;
pub use id::*;
pub use rules::*;
pub use scene::*;
