//! veiltls - a TLS-camouflage relay
//!
//! Fronts an authenticated tunnel with a genuine TLS 1.3 handshake against
//! an unrelated cover host. A passive observer, or an active probe speaking
//! TLS at the listener, sees only a real handshake and real-looking records;
//! a client holding a shared password can flip the byte stream into an
//! HMAC-authenticated tunnel.

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod stats;
pub mod stream;
pub mod transport;

pub use error::{RelayError, Result};
pub use proxy::{ForwardHandler, Service, TunnelHandler, TunnelInfo};
pub use stream::VerifiedConn;
