//! Adapter implementations.

pub mod providers;
