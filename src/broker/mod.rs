//! EMQX management API client module
//!
//! This module provides the authenticated HTTP client used by tools that
//! inspect or mutate broker state: bounded pooling, retries for idempotent
//! reads, and coordinated auth-token refresh.

pub mod api;
pub mod auth;
pub mod client;
pub mod transport;

pub use api::{PublishRequest, Query};
pub use auth::{AuthToken, BrokerSession, RefreshCause, TokenSnapshot};
pub use client::{ApiRequest, BrokerClient};
pub use transport::{BrokerTransport, HttpMethod, HttpRequest, HttpResponse, ReqwestTransport};
