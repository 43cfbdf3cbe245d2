//! WEAVE Wire - Request protocol and JSON line encoding
//!
//! One JSON object per message. A 2-character `kind+action` discriminator
//! in the `type` field fully determines which optional fields are
//! populated; decoders reject combinations they do not recognize instead
//! of panicking.

pub mod request;

pub use request::*;
