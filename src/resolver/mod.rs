//! Address → Circles identity resolution.
//!
//! Strategies, tried in order (first success wins):
//! 1. Direct: the address itself has a profile (confidence 95).
//! 2. Signer: the address was added as an owner of one or more main accounts;
//!    the first of those with a profile wins (confidence 85).
//!
//! Activity is always classified from the resolved main account's events,
//! never the signer's. Upstream failures degrade to "not found" and are never
//! surfaced to the caller.

use crate::activity::{account_kind, classify, AccountKind, ActivityClassification};
use crate::cache::{CacheKey, CacheOp, ResultCache};
use crate::circles::{
    is_positive_amount, CandidateAddress, CirclesApi, EventKind, ProtocolEvent, ProtocolProfile,
    UpstreamError,
};
use crate::config::ActivityConfig;
use crate::observe::{LookupEvent, LookupObserver, TracingObserver, UpstreamOp};

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub const DIRECT_CONFIDENCE: u8 = 95;
pub const SIGNER_CONFIDENCE: u8 = 85;

/// Fields of a signer-added event naming the added owner.
const OWNER_FIELDS: &[&str] = &["owner", "signer", "addedOwner"];
/// Fields of a signer-added event naming the main account.
const ACCOUNT_FIELDS: &[&str] = &["safeAddress", "safe", "account", "avatar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Direct,
    Signer,
}

impl MatchStrategy {
    pub fn confidence(self) -> u8 {
        match self {
            Self::Direct => DIRECT_CONFIDENCE,
            Self::Signer => SIGNER_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedIdentity {
    /// The candidate address this result was computed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_address: Option<CandidateAddress>,
    pub is_member: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_address: Option<CandidateAddress>,
    /// Only set when resolved through the signer strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_address: Option<CandidateAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProtocolProfile>,
    /// 0, 85 or 95; non-zero exactly when `is_member`.
    pub confidence: u8,
    pub account_kind: AccountKind,
    pub activity: ActivityClassification,
}

impl ResolvedIdentity {
    pub fn not_member(input: Option<CandidateAddress>) -> Self {
        Self {
            input_address: input,
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.name.as_str())
    }
}

struct Match {
    main: CandidateAddress,
    signer: Option<CandidateAddress>,
    profile: ProtocolProfile,
    strategy: MatchStrategy,
}

/// Whether a profile or events lookup failed while computing one resolution.
#[derive(Default)]
struct Attempt {
    degraded: bool,
}

pub struct AddressResolver {
    api: Arc<dyn CirclesApi>,
    cache: Arc<ResultCache>,
    observer: Arc<dyn LookupObserver>,
    activity: ActivityConfig,
}

impl AddressResolver {
    pub fn new(api: Arc<dyn CirclesApi>, cache: Arc<ResultCache>, activity: ActivityConfig) -> Self {
        Self {
            api,
            cache,
            observer: Arc::new(TracingObserver),
            activity,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LookupObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Resolve one address. Never fails; an address with no Circles account
    /// (or whose lookups all failed) resolves to a non-member.
    ///
    /// Results are cached unless a profile or events lookup failed along the
    /// way, so a transient outage is not remembered as non-membership.
    pub async fn resolve(&self, address: &CandidateAddress) -> ResolvedIdentity {
        let key = CacheKey::new(CacheOp::Resolution, address);
        if let Some(hit) = self.cache.resolutions().get(&key) {
            self.observer.on_event(&LookupEvent::CacheHit {
                op: CacheOp::Resolution,
                address: address.to_string(),
            });
            return hit;
        }

        let mut attempt = Attempt::default();
        let identity = self.resolve_uncached(address, &mut attempt).await;

        if attempt.degraded {
            debug!(address = %address, "resolution degraded by upstream failure, not caching");
        } else {
            self.cache
                .resolutions()
                .set(key, identity.clone(), self.cache.ttl(CacheOp::Resolution));
        }
        identity
    }

    /// Try each candidate in order and return the first member. If none
    /// resolves, the result is a non-member for the first candidate.
    pub async fn resolve_first(&self, candidates: &[CandidateAddress]) -> ResolvedIdentity {
        for candidate in candidates {
            let identity = self.resolve(candidate).await;
            if identity.is_member {
                return identity;
            }
        }
        ResolvedIdentity::not_member(candidates.first().cloned())
    }

    async fn resolve_uncached(
        &self,
        address: &CandidateAddress,
        attempt: &mut Attempt,
    ) -> ResolvedIdentity {
        let found = match self.lookup_profile(address, attempt).await {
            Some(profile) => {
                self.observer.on_event(&LookupEvent::DirectMatch {
                    address: address.to_string(),
                });
                Some(Match {
                    main: address.clone(),
                    signer: None,
                    profile,
                    strategy: MatchStrategy::Direct,
                })
            }
            None => self.resolve_via_signer(address, attempt).await,
        };

        let Some(found) = found else {
            self.observer.on_event(&LookupEvent::NotMember {
                address: address.to_string(),
            });
            return ResolvedIdentity::not_member(Some(address.clone()));
        };

        let events = self
            .lookup_events(&found.main, attempt)
            .await
            .unwrap_or_default();
        let mut activity = classify(&events, self.cache.clock().now(), &self.activity);
        let kind = account_kind(&events);

        if activity.exclude_as_organization {
            self.observer.on_event(&LookupEvent::OrganizationExcluded {
                address: found.main.to_string(),
            });
        } else {
            activity.is_earning = self.is_earning(&found.main).await;
        }

        ResolvedIdentity {
            input_address: Some(address.clone()),
            is_member: true,
            main_address: Some(found.main),
            signer_address: found.signer,
            profile: Some(found.profile),
            confidence: found.strategy.confidence(),
            account_kind: kind,
            activity,
        }
    }

    async fn resolve_via_signer(
        &self,
        signer: &CandidateAddress,
        attempt: &mut Attempt,
    ) -> Option<Match> {
        let events = self.lookup_events(signer, attempt).await?;

        for candidate in signer_candidates(&events, signer) {
            if let Some(profile) = self.lookup_profile(&candidate, attempt).await {
                self.observer.on_event(&LookupEvent::SignerMatch {
                    signer: signer.to_string(),
                    main: candidate.to_string(),
                });
                return Some(Match {
                    main: candidate,
                    signer: Some(signer.clone()),
                    profile,
                    strategy: MatchStrategy::Signer,
                });
            }
        }
        None
    }

    async fn lookup_profile(
        &self,
        address: &CandidateAddress,
        attempt: &mut Attempt,
    ) -> Option<ProtocolProfile> {
        let key = CacheKey::new(CacheOp::Profile, address);
        let result = self
            .cache
            .profiles()
            .get_or_compute(key, self.cache.ttl(CacheOp::Profile), || {
                self.api.fetch_profile(address)
            })
            .await;

        match result {
            Ok(profile) => profile,
            Err(e) => {
                attempt.degraded = true;
                self.record_failure(UpstreamOp::Profile, address, &e);
                None
            }
        }
    }

    async fn lookup_events(
        &self,
        address: &CandidateAddress,
        attempt: &mut Attempt,
    ) -> Option<Arc<Vec<ProtocolEvent>>> {
        let key = CacheKey::new(CacheOp::Events, address);
        let result = self
            .cache
            .events()
            .get_or_compute(key, self.cache.ttl(CacheOp::Events), || async {
                self.api.fetch_events(address).await.map(Arc::new)
            })
            .await;

        match result {
            Ok(events) => Some(events),
            Err(e) => {
                attempt.degraded = true;
                self.record_failure(UpstreamOp::Events, address, &e);
                None
            }
        }
    }

    /// Membership is already settled here, so a failure only means "not
    /// earning" and does not keep the resolution out of the cache.
    async fn is_earning(&self, main: &CandidateAddress) -> bool {
        match self.api.fetch_mintable_amount(main).await {
            Ok(amount) => is_positive_amount(&amount),
            Err(e) => {
                self.record_failure(UpstreamOp::MintableAmount, main, &e);
                false
            }
        }
    }

    fn record_failure(&self, op: UpstreamOp, address: &CandidateAddress, error: &UpstreamError) {
        self.observer.on_event(&LookupEvent::UpstreamFailure {
            op,
            address: address.to_string(),
            error: error.to_string(),
            rate_limited: error.is_rate_limited(),
        });
    }
}

/// Main accounts that `signer` was added to, in event order, without
/// duplicates and never the signer itself.
pub fn signer_candidates(
    events: &[ProtocolEvent],
    signer: &CandidateAddress,
) -> Vec<CandidateAddress> {
    let mut candidates: Vec<CandidateAddress> = Vec::new();

    for event in events.iter().filter(|e| e.kind == EventKind::SignerAdded) {
        if event.address_field(OWNER_FIELDS).as_ref() != Some(signer) {
            continue;
        }
        let Some(account) = event.address_field(ACCOUNT_FIELDS) else {
            continue;
        };
        if &account != signer && !candidates.contains(&account) {
            candidates.push(account);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheTag, ManualClock};
    use crate::circles::mock::{addr, event, MockCirclesApi};
    use crate::config::CacheConfig;
    use crate::observe::RecordingObserver;
    use serde_json::json;

    const NOW: u64 = 1_750_000_000;

    fn address(suffix: &str) -> CandidateAddress {
        CandidateAddress::parse(&addr(suffix)).unwrap()
    }

    fn resolver_with(api: MockCirclesApi) -> (AddressResolver, Arc<MockCirclesApi>, ManualClock) {
        let api = Arc::new(api);
        let clock = ManualClock::new(NOW);
        let cache = Arc::new(ResultCache::new(
            CacheConfig::default(),
            Arc::new(clock.clone()),
        ));
        let resolver = AddressResolver::new(api.clone(), cache, ActivityConfig::default());
        (resolver, api, clock)
    }

    fn signer_added(owner: &str, safe: &str) -> ProtocolEvent {
        event("Safe_AddedOwner", json!({"owner": owner, "safeAddress": safe}))
    }

    #[tokio::test]
    async fn test_direct_profile_match() {
        let (resolver, _, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&addr("a"), "Alice")
                .with_events(
                    &addr("a"),
                    vec![event("CrcV2_RegisterHuman", json!({"timestamp": NOW - 86_400}))],
                )
                .with_mintable(&addr("a"), "2500000000000000000"),
        );

        let id = resolver.resolve(&address("A")).await;
        assert!(id.is_member);
        assert_eq!(id.main_address, Some(address("a")));
        assert_eq!(id.signer_address, None);
        assert_eq!(id.confidence, 95);
        assert_eq!(id.display_name(), Some("Alice"));
        assert_eq!(id.account_kind, AccountKind::Human);
        assert!(id.activity.is_earning);
        assert_eq!(id.activity.recent_event_count, 1);
    }

    #[tokio::test]
    async fn test_signer_resolves_to_main_account() {
        let signer = addr("b");
        let main = addr("c");
        let (resolver, _, _) = resolver_with(
            MockCirclesApi::new()
                // owner field in mixed case still matches
                .with_events(&signer, vec![signer_added(&format!("0x{}", signer[2..].to_uppercase()), &main)])
                .with_profile(&main, "Carol")
                .with_events(
                    &main,
                    (0..60)
                        .map(|i| event("CrcV1_Transfer", json!({"timestamp": NOW - 400 * 86_400 + i})))
                        .collect(),
                ),
        );

        let id = resolver.resolve(&address("b")).await;
        assert!(id.is_member);
        assert_eq!(id.main_address, Some(address("c")));
        assert_eq!(id.signer_address, Some(address("b")));
        assert_eq!(id.confidence, 85);
        assert_eq!(id.display_name(), Some("Carol"));
        // activity comes from the main account's log, not the signer's
        assert_eq!(id.activity.total_activity_events, 60);
        assert!(id.activity.is_live_by_activity);
        assert!(!id.activity.is_earning);
    }

    #[tokio::test]
    async fn test_direct_wins_over_signer() {
        let a = addr("d");
        let (resolver, api, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&a, "Dana")
                .with_events(&a, vec![signer_added(&a, &addr("e"))])
                .with_profile(&addr("e"), "Eve"),
        );

        let id = resolver.resolve(&address("d")).await;
        assert_eq!(id.confidence, 95);
        assert_eq!(id.signer_address, None);
        assert_eq!(id.display_name(), Some("Dana"));
        // only the direct profile was looked up
        assert_eq!(api.profile_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_member() {
        let (resolver, api, _) = resolver_with(MockCirclesApi::new());

        let id = resolver.resolve(&address("f")).await;
        assert!(!id.is_member);
        assert_eq!(id.confidence, 0);
        assert_eq!(id.main_address, None);
        assert_eq!(id.profile, None);
        assert_eq!(id.account_kind, AccountKind::Unknown);
        assert_eq!(id.activity, ActivityClassification::default());
        assert_eq!(api.mintable_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_cached() {
        let (resolver, api, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&addr("a"), "Alice")
                .with_mintable(&addr("a"), "1"),
        );

        let first = resolver.resolve(&address("a")).await;
        let calls = api.total_calls();
        let second = resolver.resolve(&address("a")).await;

        assert_eq!(first, second);
        assert_eq!(api.total_calls(), calls);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_cache_expiry_and_invalidation_recompute() {
        let (resolver, api, clock) =
            resolver_with(MockCirclesApi::new().with_profile(&addr("a"), "Alice"));

        resolver.resolve(&address("a")).await;
        let calls = api.total_calls();

        clock.advance(86_401);
        resolver.resolve(&address("a")).await;
        assert!(api.total_calls() > calls);

        let calls = api.total_calls();
        resolver
            .cache()
            .invalidate(&CacheTag::Address(address("a")));
        resolver.resolve(&address("a")).await;
        assert!(api.total_calls() > calls);
    }

    #[tokio::test]
    async fn test_upstream_failure_degrades_and_is_not_cached() {
        let observer = Arc::new(RecordingObserver::new());
        let (resolver, api, _) = resolver_with(MockCirclesApi::new().with_failure(&addr("9")));
        let resolver = resolver.with_observer(observer.clone());

        let id = resolver.resolve(&address("9")).await;
        assert!(!id.is_member);
        assert_eq!(id.confidence, 0);
        assert_eq!(observer.count("upstream_failure"), 2);

        let calls = api.total_calls();
        resolver.resolve(&address("9")).await;
        assert!(api.total_calls() > calls);
    }

    #[tokio::test]
    async fn test_organization_skips_mintable_query() {
        let org = addr("0a9");
        let (resolver, api, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&org, "Bakery")
                .with_events(&org, vec![event("CrcV2_RegisterOrganization", json!({}))])
                .with_mintable(&org, "5"),
        );

        let id = resolver.resolve(&address("0a9")).await;
        assert!(id.is_member);
        assert_eq!(id.account_kind, AccountKind::Organization);
        assert!(id.activity.exclude_as_organization);
        assert!(!id.activity.is_live_by_activity);
        assert!(!id.activity.is_earning);
        assert_eq!(api.mintable_calls(), 0);
    }

    #[tokio::test]
    async fn test_mintable_failure_still_caches_membership() {
        let observer = Arc::new(RecordingObserver::new());
        let group = addr("6a");
        let (resolver, api, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&group, "Commons")
                .with_events(&group, vec![event("CrcV2_RegisterGroup", json!({}))])
                .with_mintable_failure(&group),
        );
        let resolver = resolver.with_observer(observer.clone());

        let first = resolver.resolve(&address("6a")).await;
        assert!(first.is_member);
        assert_eq!(first.account_kind, AccountKind::Group);
        assert!(!first.activity.is_earning);
        assert_eq!(api.mintable_calls(), 1);
        assert_eq!(observer.count("upstream_failure"), 1);

        let calls = api.total_calls();
        let second = resolver.resolve(&address("6a")).await;
        assert_eq!(second, first);
        assert_eq!(api.total_calls(), calls);
    }

    #[tokio::test]
    async fn test_resolve_first_respects_input_order() {
        let (resolver, _, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&addr("2"), "Second")
                .with_profile(&addr("3"), "Third"),
        );

        let id = resolver
            .resolve_first(&[address("1"), address("2"), address("3")])
            .await;
        assert_eq!(id.display_name(), Some("Second"));
        assert_eq!(id.input_address, Some(address("2")));

        let id = resolver
            .resolve_first(&[address("3"), address("2")])
            .await;
        assert_eq!(id.display_name(), Some("Third"));

        let none = resolver.resolve_first(&[address("4"), address("5")]).await;
        assert!(!none.is_member);
        assert_eq!(none.input_address, Some(address("4")));
    }

    #[tokio::test]
    async fn test_confidence_invariant() {
        let (resolver, _, _) = resolver_with(
            MockCirclesApi::new()
                .with_profile(&addr("a"), "Alice")
                .with_events(&addr("b"), vec![signer_added(&addr("b"), &addr("a"))])
                .with_failure(&addr("c")),
        );

        for suffix in ["a", "b", "c", "d"] {
            let id = resolver.resolve(&address(suffix)).await;
            assert_eq!(id.is_member, id.confidence > 0);
            assert!([0, 85, 95].contains(&id.confidence));
        }
    }

    #[test]
    fn test_signer_candidates_filters_and_dedups() {
        let signer = address("b");
        let events = vec![
            signer_added(&addr("b"), &addr("c")),
            signer_added(&addr("x"), &addr("d")),
            event("CrcV2_Trust", json!({"owner": addr("b"), "safeAddress": addr("e")})),
            signer_added(&addr("b"), &addr("c")),
            signer_added(&addr("b"), &addr("b")),
            event("Safe_AddedOwner", json!({"signer": addr("b"), "safe": addr("f")})),
            event("Safe_AddedOwner", json!({"owner": addr("b")})),
        ];

        assert_eq!(signer_candidates(&events, &signer), vec![address("c"), address("f")]);
    }
}
