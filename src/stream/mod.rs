//! Stream wrappers for the post-handshake tunnel

pub mod verified;

pub use verified::VerifiedConn;
