//! WEAVE Transport - Connection adapter boundary
//!
//! The engine never touches sockets. A `Link` hands it three operations:
//! ensure the connection is up (non-blocking, kicks off a reconnect when
//! it is not), send a request, and poll received requests. The TCP link
//! implements the boundary over newline-framed JSON.

pub mod link;
pub mod tcp;

pub use link::*;
pub use tcp::*;
