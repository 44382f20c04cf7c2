//! Domain layer: models, ports, and provider errors.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ProviderError, ProviderResult};
