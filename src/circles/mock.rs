//! In-memory `CirclesApi` double for tests.

use super::types::{CandidateAddress, ProtocolEvent, ProtocolProfile};
use super::{CirclesApi, UpstreamError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Configurable fake of the Circles RPC. Counts every upstream call.
#[derive(Default)]
pub struct MockCirclesApi {
    profiles: HashMap<String, ProtocolProfile>,
    events: HashMap<String, Vec<ProtocolEvent>>,
    mintable: HashMap<String, String>,
    failing: HashSet<String>,
    failing_mintable: HashSet<String>,
    latency: Option<Duration>,
    profile_calls: AtomicUsize,
    event_calls: AtomicUsize,
    mintable_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    profile_starts: Mutex<Vec<Instant>>,
}

/// Decrements the in-flight count even when the call future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCirclesApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, address: &str, name: &str) -> Self {
        let mut raw = Map::new();
        raw.insert("name".into(), Value::String(name.into()));
        let profile = ProtocolProfile::from_object(raw).expect("non-empty name");
        self.profiles.insert(address.to_ascii_lowercase(), profile);
        self
    }

    pub fn with_events(mut self, address: &str, events: Vec<ProtocolEvent>) -> Self {
        self.events.insert(address.to_ascii_lowercase(), events);
        self
    }

    pub fn with_mintable(mut self, address: &str, amount: &str) -> Self {
        self.mintable.insert(address.to_ascii_lowercase(), amount.into());
        self
    }

    /// Every call for `address` fails with `Unavailable`.
    pub fn with_failure(mut self, address: &str) -> Self {
        self.failing.insert(address.to_ascii_lowercase());
        self
    }

    /// Only the mintable-amount query for `address` fails, with a JSON-RPC
    /// error that retrying will not fix.
    pub fn with_mintable_failure(mut self, address: &str) -> Self {
        self.failing_mintable.insert(address.to_ascii_lowercase());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn event_calls(&self) -> usize {
        self.event_calls.load(Ordering::SeqCst)
    }

    pub fn mintable_calls(&self) -> usize {
        self.mintable_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.profile_calls() + self.event_calls() + self.mintable_calls()
    }

    /// Highest number of calls that were waiting on latency at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// When each profile lookup started, in call order.
    pub fn profile_starts(&self) -> Vec<Instant> {
        self.profile_starts
            .lock()
            .map(|starts| starts.clone())
            .unwrap_or_default()
    }

    async fn before_call(&self, address: &CandidateAddress) -> Result<(), UpstreamError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.contains(address.as_str()) {
            return Err(UpstreamError::Unavailable {
                status: Some(429),
                message: "Too Many Requests".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CirclesApi for MockCirclesApi {
    async fn fetch_events(
        &self,
        address: &CandidateAddress,
    ) -> Result<Vec<ProtocolEvent>, UpstreamError> {
        self.event_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(address).await?;
        Ok(self.events.get(address.as_str()).cloned().unwrap_or_default())
    }

    async fn fetch_profile(
        &self,
        address: &CandidateAddress,
    ) -> Result<Option<ProtocolProfile>, UpstreamError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut starts) = self.profile_starts.lock() {
            starts.push(Instant::now());
        }
        self.before_call(address).await?;
        Ok(self.profiles.get(address.as_str()).cloned())
    }

    async fn fetch_mintable_amount(
        &self,
        address: &CandidateAddress,
    ) -> Result<String, UpstreamError> {
        self.mintable_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(address).await?;
        if self.failing_mintable.contains(address.as_str()) {
            return Err(UpstreamError::Unavailable {
                status: None,
                message: "circles_getMintableAmount rpc error -32000: not a human".into(),
            });
        }
        Ok(self
            .mintable
            .get(address.as_str())
            .cloned()
            .unwrap_or_else(|| "0".into()))
    }
}

/// Build an event from a tag and a JSON object literal.
pub fn event(name: &str, values: Value) -> ProtocolEvent {
    let values = match values {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ProtocolEvent::new(name, values)
}

/// A test address whose last hex digits are `suffix`.
pub fn addr(suffix: &str) -> String {
    format!("0x{:0>40}", suffix.to_ascii_lowercase())
}
