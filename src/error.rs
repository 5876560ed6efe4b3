//! Error types for the EMQX MCP bridge
//!
//! This module provides the error type hierarchy using `thiserror`. Each layer
//! of the bridge (broker HTTP client, MQTT relay, parameter validation,
//! sessions, configuration, MCP protocol) has its own enum; [`Error`] wraps
//! them all. Mapping onto the client-facing taxonomy lives in
//! [`crate::translate`].

use thiserror::Error;

/// The main error type for bridge operations
#[derive(Error, Debug)]
pub enum Error {
    /// Broker management API errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// MQTT relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Tool parameter validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// MCP protocol errors
    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Errors from the broker management API client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection could not be established or broke mid-request
    #[error("Connection error: {0}")]
    Network(String),

    /// The call exceeded its deadline
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Broker answered with a 5xx status
    #[error("EMQX API Error: {status} - {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// Broker answered 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// Broker rejected the request body or query (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Authentication still rejected after a token refresh
    #[error("Authentication failed ({status}): {message}")]
    Auth {
        /// HTTP status code (401 or 403)
        status: u16,
        /// Response body
        message: String,
    },

    /// Login endpoint did not yield a usable token
    #[error("Login failed: {0}")]
    Login(String),

    /// Any other non-success status
    #[error("EMQX API Error: {status} - {message}")]
    Unexpected {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// Response body could not be decoded
    #[error("Error processing response: {0}")]
    Decode(String),

    /// Client was closed
    #[error("Broker client closed")]
    Closed,
}

impl BrokerError {
    /// Whether a failed idempotent call may be attempted again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_) | BrokerError::Timeout(_) | BrokerError::Server { .. }
        )
    }
}

/// Errors from the MQTT relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No MQTT URL configured
    #[error("MQTT relay is not configured (set EMQX_MQTT_URL)")]
    Disabled,

    /// Publish topic is malformed
    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    /// Subscription filter is malformed
    #[error("Invalid topic filter: {0}")]
    InvalidFilter(String),

    /// Broker refused the operation (ACL, QoS downgrade refused, ...)
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// Connection-level failure
    #[error("MQTT connection error: {0}")]
    Connection(String),

    /// Operation did not complete in time
    #[error("MQTT operation timed out after {0}ms")]
    Timeout(u64),

    /// Stream or subscription id is not known to the relay
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),
}

/// Tool parameter validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Requested tool is not registered
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments were not a JSON object
    #[error("Tool arguments must be a JSON object")]
    NotAnObject,

    /// A required field is absent
    #[error("Missing required parameter: {0}")]
    MissingField(String),

    /// A field has the wrong JSON type
    #[error("Parameter '{field}' must be of type {expected}")]
    WrongType {
        /// Field name
        field: String,
        /// Expected type name
        expected: &'static str,
    },

    /// A field is outside its enumerated set
    #[error("Invalid value {value} for '{field}'. Must be one of: {allowed}")]
    NotInEnum {
        /// Field name
        field: String,
        /// Rejected value
        value: String,
        /// Allowed values, comma separated
        allowed: String,
    },

    /// An integer field is outside its bounds
    #[error("Parameter '{field}' = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name
        field: String,
        /// Rejected value
        value: i64,
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session is being torn down or is gone
    #[error("Session {0} is closed")]
    Closed(String),

    /// No subscription for the filter in this session
    #[error("No active subscription for '{0}'")]
    UnknownSubscription(String),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variables are absent
    #[error(
        "Missing required environment variables: {}. Please set them in your environment or .env file.",
        .0.join(", ")
    )]
    Missing(Vec<String>),

    /// A variable has an unusable value
    #[error("Invalid value for {var}: {message}")]
    Invalid {
        /// Variable name
        var: String,
        /// What is wrong with it
        message: String,
    },
}

/// MCP protocol errors
#[derive(Error, Debug)]
pub enum McpError {
    /// Invalid JSON-RPC request
    #[error("Invalid JSON-RPC request: {0}")]
    InvalidRequest(String),

    /// Unknown method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The client cancelled the request
    #[error("Request cancelled")]
    Cancelled,
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }
}
