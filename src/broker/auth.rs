//! Process-wide broker auth state
//!
//! [`BrokerSession`] owns the current management API token. Readers take a
//! cloned [`TokenSnapshot`]; a single writer at a time installs a new token
//! under the refresh lock. Callers that saw the same rejected generation
//! queue on the lock and reuse whatever the first of them installed.

use crate::error::BrokerError;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Tokens are refreshed this long before they expire
const REFRESH_SKEW_SECS: i64 = 30;

/// An `Authorization` header value with its validity window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    header: String,
    /// When the token was obtained
    pub issued_at: DateTime<Utc>,
    /// When the broker stops accepting it, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    /// Basic credentials derived from an API key pair; never expire
    pub fn basic(key: &str, secret: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{key}:{secret}"));
        Self {
            header: format!("Basic {encoded}"),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Bearer token valid for `ttl`
    pub fn bearer(token: &str, ttl: ChronoDuration) -> Self {
        let issued_at = Utc::now();
        Self {
            header: format!("Bearer {token}"),
            issued_at,
            expires_at: Some(issued_at + ttl),
        }
    }

    /// Header value
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Whether the token should be replaced before use at `now`
    pub fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + ChronoDuration::seconds(REFRESH_SKEW_SECS) >= expiry,
            None => false,
        }
    }
}

/// A token together with the generation it was installed at
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    /// The token
    pub token: AuthToken,
    /// Monotonic install counter
    pub generation: u64,
}

/// Why a refresh is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCause {
    /// No usable token yet, or it is about to expire
    Missing,
    /// The broker rejected the token of this generation
    Rejected(u64),
    /// Unconditional refresh
    Forced,
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<AuthToken>,
    generation: u64,
}

/// Shared auth state with single-writer refresh
#[derive(Debug, Default)]
pub struct BrokerSession {
    state: RwLock<TokenState>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl BrokerSession {
    /// Empty session; the first use triggers a refresh
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token if one is installed and not about to expire
    pub async fn snapshot(&self) -> Option<TokenSnapshot> {
        let state = self.state.read().await;
        state
            .token
            .as_ref()
            .filter(|t| !t.expires_soon(Utc::now()))
            .map(|t| TokenSnapshot {
                token: t.clone(),
                generation: state.generation,
            })
    }

    /// Number of times `obtain` actually ran
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Refresh the token unless another caller already did so for `cause`
    pub async fn refresh<F, Fut>(
        &self,
        cause: RefreshCause,
        obtain: F,
    ) -> Result<TokenSnapshot, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthToken, BrokerError>>,
    {
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if let Some(ref token) = state.token {
                let still_good = match cause {
                    RefreshCause::Missing => !token.expires_soon(Utc::now()),
                    RefreshCause::Rejected(seen) => seen != state.generation,
                    RefreshCause::Forced => false,
                };
                if still_good {
                    debug!(generation = state.generation, "Reusing token refreshed by another caller");
                    return Ok(TokenSnapshot {
                        token: token.clone(),
                        generation: state.generation,
                    });
                }
            }
        }

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let token = obtain().await?;

        let mut state = self.state.write().await;
        state.generation += 1;
        state.token = Some(token.clone());
        info!(generation = state.generation, ?cause, "Installed new broker auth token");

        Ok(TokenSnapshot {
            token,
            generation: state.generation,
        })
    }

    /// Drop the installed token
    pub async fn clear(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.state.write().await.token = None;
    }
}
