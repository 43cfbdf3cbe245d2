//! WEAVE Test - In-memory multi-peer harness
//!
//! Wires peers to a real `RelayState` without sockets: every admission,
//! replay, and broadcast decision is the production relay code, only the
//! transport is a channel pair. Integration tests live in `tests/`.

pub mod harness;

pub use harness::*;
