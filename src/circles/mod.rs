//! Clients for the Circles indexer RPC.
//!
//! Three upstream operations are exposed through the [`CirclesApi`] trait:
//! - `circles_events`: full event history for an address (POST, JSON-RPC)
//! - `/profiles/search`: the human-readable profile of a main account (GET)
//! - `circles_getMintableAmount`: currently mintable balance (POST, JSON-RPC)
//!
//! [`CirclesClient`] is the reqwest-backed implementation. Everything above
//! this module depends on the trait so tests can substitute a double.

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use client::CirclesClient;
pub use types::{AddressError, CandidateAddress, EventKind, ProtocolEvent, ProtocolProfile};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network failure, timeout, non-2xx status or a JSON-RPC error object.
    #[error("upstream unavailable (status {status:?}): {message}")]
    Unavailable {
        status: Option<u16>,
        message: String,
    },
    /// The response did not have the expected shape.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Unavailable { status: Some(429), .. })
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[async_trait]
pub trait CirclesApi: Send + Sync {
    /// Full event history for `address`. No events is `Ok(vec![])`.
    async fn fetch_events(
        &self,
        address: &CandidateAddress,
    ) -> Result<Vec<ProtocolEvent>, UpstreamError>;

    /// The profile registered for `address`, or `None` when there isn't one.
    async fn fetch_profile(
        &self,
        address: &CandidateAddress,
    ) -> Result<Option<ProtocolProfile>, UpstreamError>;

    /// Raw mintable amount as returned upstream (decimal or hex string).
    async fn fetch_mintable_amount(
        &self,
        address: &CandidateAddress,
    ) -> Result<String, UpstreamError>;
}

/// True when a mintable-amount string is a number greater than zero.
pub fn is_positive_amount(amount: &str) -> bool {
    let s = amount.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return hex.chars().all(|c| c.is_ascii_hexdigit()) && hex.chars().any(|c| c != '0');
    }
    s.parse::<f64>().map(|v| v.is_finite() && v > 0.0).unwrap_or(false)
}
