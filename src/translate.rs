//! Error translation
//!
//! Every failure that leaves the bridge is mapped onto exactly one
//! [`ErrorKind`]. Unexpected failures fall through to [`ErrorKind::Internal`]
//! and are logged here so they are never swallowed silently.

use crate::error::{BrokerError, Error, RelayError, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

/// Client-facing error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input or unknown tool
    InvalidParams,
    /// Broker credentials rejected even after refresh
    Unauthorized,
    /// Broker refused the operation
    Forbidden,
    /// Target entity does not exist
    NotFound,
    /// Transient failure; the caller may retry
    Unavailable,
    /// Unexpected failure
    Internal,
}

impl ErrorKind {
    /// JSON-RPC error code carried on the wire
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidParams => -32602,
            ErrorKind::Unauthorized => -32001,
            ErrorKind::Forbidden => -32003,
            ErrorKind::NotFound => -32004,
            ErrorKind::Unavailable => -32005,
            ErrorKind::Internal => -32603,
        }
    }

    /// Whether the caller may resend the request unchanged
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }

    /// Stable name used in the error payload
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A translated error ready to be sent to the MCP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeError {
    /// Taxonomy member
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl BridgeError {
    /// Build the JSON-RPC `data` member
    pub fn data(&self) -> serde_json::Value {
        json!({
            "kind": self.kind,
            "retryable": self.kind.is_retryable(),
        })
    }
}

fn broker_kind(err: &BrokerError) -> Option<ErrorKind> {
    let kind = match err {
        BrokerError::Network(_) | BrokerError::Timeout(_) | BrokerError::Server { .. } => {
            ErrorKind::Unavailable
        }
        BrokerError::NotFound(_) => ErrorKind::NotFound,
        BrokerError::BadRequest(_) => ErrorKind::InvalidParams,
        BrokerError::Auth { .. } | BrokerError::Login(_) => ErrorKind::Unauthorized,
        BrokerError::Unexpected { .. } | BrokerError::Decode(_) | BrokerError::Closed => {
            return None
        }
    };
    Some(kind)
}

fn relay_kind(err: &RelayError) -> Option<ErrorKind> {
    let kind = match err {
        RelayError::Disabled | RelayError::Connection(_) | RelayError::Timeout(_) => {
            ErrorKind::Unavailable
        }
        RelayError::InvalidTopic(_) | RelayError::InvalidFilter(_) => ErrorKind::InvalidParams,
        RelayError::Rejected(_) => ErrorKind::Forbidden,
        RelayError::UnknownSubscription(_) => ErrorKind::NotFound,
    };
    Some(kind)
}

/// Classify an error without logging
pub fn classify(err: &Error) -> ErrorKind {
    let kind = match err {
        Error::Validation(_) => Some(ErrorKind::InvalidParams),
        Error::Broker(e) => broker_kind(e),
        Error::Relay(e) => relay_kind(e),
        Error::Session(SessionError::UnknownSubscription(_)) => Some(ErrorKind::NotFound),
        Error::Session(SessionError::Closed(_)) => Some(ErrorKind::Unavailable),
        Error::Mcp(crate::error::McpError::InvalidParams(_)) => Some(ErrorKind::InvalidParams),
        _ => None,
    };
    kind.unwrap_or(ErrorKind::Internal)
}

/// Translate an error into its client-facing form
///
/// `context` names the operation (tool or method) for the log line emitted on
/// unexpected failures.
pub fn translate(err: &Error, context: &str) -> BridgeError {
    let kind = classify(err);
    if kind == ErrorKind::Internal {
        error!(context, error = %err, "Unexpected failure mapped to Internal");
    }
    BridgeError {
        kind,
        message: err.to_string(),
    }
}
