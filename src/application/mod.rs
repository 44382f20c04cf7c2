//! Application wiring.

pub mod bridge;

pub use bridge::{Bridge, InboundRequest};
