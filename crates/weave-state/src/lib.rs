//! WEAVE State - Change detection and reconciliation
//!
//! This crate holds the peer-side core:
//! - Codec registry: live type tag -> encode/decode/hash, built at startup
//! - Entity and resource tracking stores (name -> last-sent state)
//! - The diff/reconciliation engine: `track_changes` computes outgoing
//!   request batches, `apply_changes` applies incoming ones with bounded
//!   dependency retry and deferred hierarchy placement

pub mod codec;
pub mod engine;
pub mod store;

pub use codec::*;
pub use engine::*;
pub use store::*;
