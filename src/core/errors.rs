// Error Taxonomy for the MetaTrader Gateway Client
// Canonical error kinds and the bidirectional mapping to wire error names

use serde_json::Value;
use thiserror::Error;

/// Canonical failure kinds surfaced by the gateway client.
///
/// All kinds are local to the failing call except `Unauthorized`, which is
/// fatal and closes the transport before being reported.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request rejected by the server-side schema; carries the details payload
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    /// Entity missing on the server
    #[error("{message}")]
    NotFound { message: String },

    /// Terminal state synchronization has not completed
    #[error("{message}")]
    NotSynchronized { message: String },

    /// Request deadline expired
    #[error("{message}")]
    Timeout { message: String },

    /// Authentication or connection lost
    #[error("{message}")]
    NotConnected { message: String },

    /// Trade execution failure with the broker's return codes
    #[error("{message}")]
    Trade {
        message: String,
        numeric_code: Option<i64>,
        string_code: Option<String>,
    },

    /// Credentials rejected; closes the transport
    #[error("{message}")]
    Unauthorized { message: String },

    /// Anything the server reports that has no dedicated kind
    #[error("{message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Map a wire error name to the canonical kind. Unknown names become
    /// `Internal`.
    pub fn from_wire(
        name: &str,
        message: String,
        details: Option<Value>,
        numeric_code: Option<i64>,
        string_code: Option<String>,
    ) -> Self {
        match name {
            "ValidationError" => GatewayError::Validation { message, details },
            "NotFoundError" => GatewayError::NotFound { message },
            "NotSynchronizedError" => GatewayError::NotSynchronized { message },
            "TimeoutError" => GatewayError::Timeout { message },
            "NotAuthenticatedError" => GatewayError::NotConnected { message },
            "TradeError" => GatewayError::Trade {
                message,
                numeric_code,
                string_code,
            },
            "UnauthorizedError" => GatewayError::Unauthorized { message },
            _ => GatewayError::Internal { message },
        }
    }

    /// Wire name for this kind, the inverse of [`GatewayError::from_wire`]
    pub fn wire_name(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "ValidationError",
            GatewayError::NotFound { .. } => "NotFoundError",
            GatewayError::NotSynchronized { .. } => "NotSynchronizedError",
            GatewayError::Timeout { .. } => "TimeoutError",
            GatewayError::NotConnected { .. } => "NotAuthenticatedError",
            GatewayError::Trade { .. } => "TradeError",
            GatewayError::Unauthorized { .. } => "UnauthorizedError",
            GatewayError::Internal { .. } => "InternalError",
        }
    }

    /// Fatal errors close the transport; everything else is local to the caller
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Unauthorized { .. })
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        GatewayError::Timeout {
            message: message.into(),
        }
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        GatewayError::NotConnected {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_mapping_round_trip() {
        for name in [
            "ValidationError",
            "NotFoundError",
            "NotSynchronizedError",
            "TimeoutError",
            "TradeError",
            "UnauthorizedError",
            "InternalError",
        ] {
            let err = GatewayError::from_wire(name, "boom".to_string(), None, None, None);
            assert_eq!(err.wire_name(), name);
        }
    }

    #[test]
    fn test_not_authenticated_maps_to_not_connected() {
        let err =
            GatewayError::from_wire("NotAuthenticatedError", "expired".to_string(), None, None, None);
        assert!(matches!(err, GatewayError::NotConnected { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unknown_name_maps_to_internal() {
        let err = GatewayError::from_wire("SomeNewError", "boom".to_string(), None, None, None);
        assert!(matches!(err, GatewayError::Internal { .. }));
    }

    #[test]
    fn test_unauthorized_is_fatal() {
        let err = GatewayError::from_wire("UnauthorizedError", "bad token".to_string(), None, None, None);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validation_carries_details() {
        let details = json!({"field": "volume", "reason": "required"});
        let err = GatewayError::from_wire(
            "ValidationError",
            "invalid request".to_string(),
            Some(details.clone()),
            None,
            None,
        );
        match err {
            GatewayError::Validation { details: Some(d), .. } => assert_eq!(d, details),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_trade_carries_codes() {
        let err = GatewayError::from_wire(
            "TradeError",
            "Requote".to_string(),
            None,
            Some(10004),
            Some("TRADE_RETCODE_REQUOTE".to_string()),
        );
        match err {
            GatewayError::Trade {
                numeric_code,
                string_code,
                ..
            } => {
                assert_eq!(numeric_code, Some(10004));
                assert_eq!(string_code.as_deref(), Some("TRADE_RETCODE_REQUOTE"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
