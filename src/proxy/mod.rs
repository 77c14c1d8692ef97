//! Session handling: orchestration, relay directions, fallback, handlers

pub mod fallback;
pub mod forward;
pub mod relay;
pub mod service;

pub use forward::ForwardHandler;
pub use service::{Service, TunnelHandler, TunnelInfo};
