//! RPC client errors and the dialect's error codes.

use thiserror::Error;

use crate::domain::errors::ProviderError;

use super::types::RpcErrorObject;

// Domain error codes beyond the reserved JSON-RPC range.
pub const CODE_CONTEXT_EXCEEDED: i64 = -32001;
pub const CODE_USAGE_LIMIT: i64 = -32002;
pub const CODE_UNAUTHORIZED: i64 = -32003;
pub const CODE_CONNECTION: i64 = -32004;

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("call cancelled")]
    Cancelled,

    #[error("rpc error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("write failed: {0}")]
    Io(String),
}

impl From<RpcErrorObject> for RpcError {
    fn from(obj: RpcErrorObject) -> Self {
        Self::Remote {
            code: obj.code,
            message: obj.message,
            data: obj.data,
        }
    }
}

impl From<RpcError> for ProviderError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::ConnectionClosed => Self::ConnectionClosed,
            RpcError::Cancelled => Self::Cancelled,
            RpcError::Remote { code, ref message, .. } => match code {
                CODE_UNAUTHORIZED => Self::NoApiKey(message.clone()),
                CODE_CONNECTION => Self::ConnectionClosed,
                CODE_USAGE_LIMIT => Self::RateLimited(message.clone()),
                _ => Self::Internal(err.to_string()),
            },
            RpcError::Serialize(m) | RpcError::Io(m) => Self::Internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_code_mapping() {
        let unauthorized = RpcError::Remote {
            code: CODE_UNAUTHORIZED,
            message: "bad key".to_string(),
            data: None,
        };
        assert!(matches!(
            ProviderError::from(unauthorized),
            ProviderError::NoApiKey(_)
        ));

        let conn = RpcError::Remote {
            code: CODE_CONNECTION,
            message: "gone".to_string(),
            data: None,
        };
        assert!(matches!(
            ProviderError::from(conn),
            ProviderError::ConnectionClosed
        ));

        let limit = RpcError::Remote {
            code: CODE_USAGE_LIMIT,
            message: "quota".to_string(),
            data: None,
        };
        assert!(matches!(
            ProviderError::from(limit),
            ProviderError::RateLimited(_)
        ));
    }

    #[test]
    fn test_closed_maps_to_connection_closed() {
        assert!(matches!(
            ProviderError::from(RpcError::ConnectionClosed),
            ProviderError::ConnectionClosed
        ));
    }
}
