//! The viewer's outgoing trust edges, used to mark who they already trust.

use crate::cache::{CacheKey, CacheOp, ResultCache};
use crate::circles::{CandidateAddress, CirclesApi, EventKind, ProtocolEvent};
use crate::observe::{LookupEvent, LookupObserver, TracingObserver, UpstreamOp};

use std::collections::HashSet;
use std::sync::Arc;

pub type TrustEdgeSet = HashSet<CandidateAddress>;

// v2 names first, then v1 (`Trust(canSendTo, user, limit)`)
const TRUSTER_FIELDS: &[&str] = &["truster", "canSendTo"];
const TRUSTEE_FIELDS: &[&str] = &["trustee", "user"];
const EXPIRY_FIELDS: &[&str] = &["expiryTime", "expiry"];
const LIMIT_FIELDS: &[&str] = &["limit"];

pub struct TrustListFetcher {
    api: Arc<dyn CirclesApi>,
    cache: Arc<ResultCache>,
    observer: Arc<dyn LookupObserver>,
}

impl TrustListFetcher {
    pub fn new(api: Arc<dyn CirclesApi>, cache: Arc<ResultCache>) -> Self {
        Self {
            api,
            cache,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LookupObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Addresses the viewer currently trusts. Best-effort: any upstream
    /// failure yields an empty set, which is not cached.
    ///
    /// Reads the viewer's events straight from upstream rather than through
    /// the events cache, whose TTL is far longer than the trust-edge TTL.
    pub async fn fetch_trust_edges(&self, viewer: &CandidateAddress) -> TrustEdgeSet {
        let key = CacheKey::new(CacheOp::TrustEdges, viewer);
        if let Some(edges) = self.cache.trust_edges().get(&key) {
            self.observer.on_event(&LookupEvent::CacheHit {
                op: CacheOp::TrustEdges,
                address: viewer.to_string(),
            });
            return edges;
        }

        match self.api.fetch_events(viewer).await {
            Ok(events) => {
                let now = self.cache.clock().now();
                let edges = trust_edges_from_events(&events, viewer, now);
                self.observer.on_event(&LookupEvent::TrustEdgesLoaded {
                    viewer: viewer.to_string(),
                    edges: edges.len(),
                });
                self.cache
                    .trust_edges()
                    .set(key, edges.clone(), self.cache.ttl(CacheOp::TrustEdges));
                edges
            }
            Err(e) => {
                self.observer.on_event(&LookupEvent::UpstreamFailure {
                    op: UpstreamOp::Events,
                    address: viewer.to_string(),
                    error: e.to_string(),
                    rate_limited: e.is_rate_limited(),
                });
                TrustEdgeSet::new()
            }
        }
    }
}

/// Replay the viewer's trust events in order. A later edge with a past
/// expiry or a zero limit removes the trustee again.
pub fn trust_edges_from_events(
    events: &[ProtocolEvent],
    viewer: &CandidateAddress,
    now: u64,
) -> TrustEdgeSet {
    let mut edges = TrustEdgeSet::new();

    for event in events.iter().filter(|e| e.kind == EventKind::TrustEdgeSet) {
        if event.address_field(TRUSTER_FIELDS).as_ref() != Some(viewer) {
            continue;
        }
        let Some(trustee) = event.address_field(TRUSTEE_FIELDS) else {
            continue;
        };

        let expired = event
            .numeric_field(EXPIRY_FIELDS)
            .is_some_and(|expiry| expiry <= now);
        let revoked = event.numeric_field(LIMIT_FIELDS) == Some(0);

        if expired || revoked {
            edges.remove(&trustee);
        } else {
            edges.insert(trustee);
        }
    }
    edges
}
