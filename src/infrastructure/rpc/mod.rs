//! Line-delimited JSON-RPC 2.0 plumbing for subprocess providers.

pub mod client;
pub mod error;
pub mod types;

pub use client::{JsonRpcClient, NotificationHandler};
pub use error::RpcError;
pub use types::{Inbound, IncomingMessage, RpcNotification, RpcRequest};
