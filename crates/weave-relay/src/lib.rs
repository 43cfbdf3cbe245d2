//! WEAVE Relay - Channel relay
//!
//! The relay is a hub, not a peer: it holds no scene, applies no codecs,
//! and never inspects payloads. Per channel it keeps the latest admitted
//! state (entities, modules, resources) for late-join replay, admits
//! updates last-writer-wins by timestamp, and forwards admitted requests
//! to every subscriber except the sender.

pub mod server;
pub mod state;

pub use server::*;
pub use state::*;
