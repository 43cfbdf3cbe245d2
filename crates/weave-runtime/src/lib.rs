//! WEAVE Runtime - Peer loop
//!
//! A peer owns a scene, a sync engine, and a link, and drives them from a
//! periodic tick: gate on the connection, (re)subscribe, pull received
//! requests into the engine, send tracked changes, apply queued changes.

pub mod peer;

pub use peer::*;
