//! Batch resolution of a follow list into a stream of results.
//!
//! A producer task resolves identities and pushes [`BatchItem`]s into a
//! bounded channel; the caller pulls them from a [`BatchStream`].
//!
//! Order of output:
//! 1. identities with no usable address, immediately, as non-members
//! 2. everything else, in waves of `batch_size` concurrent resolutions,
//!    each wave yielding in completion order
//!
//! Cancellation is cooperative. The token is raced against every wave, so
//! in-flight resolutions are dropped and no further upstream calls start.

use crate::circles::CandidateAddress;
use crate::config::BatchConfig;
use crate::observe::{LookupEvent, LookupObserver, TracingObserver};
use crate::resolver::{AddressResolver, ResolvedIdentity};
use crate::social::SocialIdentity;
use crate::trust::{TrustEdgeSet, TrustListFetcher};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// The social account id (Farcaster fid).
    pub identity_id: u64,
    pub username: String,
    pub identity: ResolvedIdentity,
    pub is_trusted_by_viewer: bool,
    pub progress: Progress,
}

impl BatchItem {
    /// A Circles member worth suggesting: not an organization.
    pub fn is_friend_candidate(&self) -> bool {
        self.identity.is_member && !self.identity.activity.exclude_as_organization
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub yielded: usize,
    pub members: usize,
    pub excluded_organizations: usize,
    pub trusted: usize,
    /// Fewer items arrived than identities went in.
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn from_items(items: &[BatchItem], total: usize) -> Self {
        let members = items.iter().filter(|i| i.identity.is_member);
        Self {
            total,
            yielded: items.len(),
            members: members.clone().count(),
            excluded_organizations: members
                .clone()
                .filter(|i| i.identity.activity.exclude_as_organization)
                .count(),
            trusted: items.iter().filter(|i| i.is_trusted_by_viewer).count(),
            cancelled: items.len() < total,
        }
    }
}

/// Consumer end of a running batch.
///
/// Dropping the stream cancels the producer.
pub struct BatchStream {
    rx: mpsc::Receiver<BatchItem>,
    cancel: CancellationToken,
    total: usize,
}

impl BatchStream {
    /// The next result, or `None` at the end of the batch or once cancelled.
    pub async fn next(&mut self) -> Option<BatchItem> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of identities submitted.
    pub fn total(&self) -> usize {
        self.total
    }

    pub async fn collect_all(mut self) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(self.total);
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct BatchOrchestrator {
    resolver: Arc<AddressResolver>,
    trust: Arc<TrustListFetcher>,
    config: BatchConfig,
    observer: Arc<dyn LookupObserver>,
}

impl BatchOrchestrator {
    pub fn new(resolver: Arc<AddressResolver>, trust: Arc<TrustListFetcher>, config: BatchConfig) -> Self {
        Self {
            resolver,
            trust,
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LookupObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Start resolving `identities`. Cancelling `cancel` (or any parent of it)
    /// ends the stream; cancelling the returned stream does not touch `cancel`.
    pub fn stream(
        &self,
        identities: Vec<SocialIdentity>,
        viewer: Option<CandidateAddress>,
        cancel: CancellationToken,
    ) -> BatchStream {
        let token = cancel.child_token();
        let total = identities.len();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let producer = Producer {
            resolver: self.resolver.clone(),
            trust: self.trust.clone(),
            config: self.config.clone(),
            observer: self.observer.clone(),
            tx,
            cancel: token.clone(),
            total,
            completed: 0,
            members: 0,
        };
        tokio::spawn(producer.run(identities, viewer));

        BatchStream {
            rx,
            cancel: token,
            total,
        }
    }
}

struct Producer {
    resolver: Arc<AddressResolver>,
    trust: Arc<TrustListFetcher>,
    config: BatchConfig,
    observer: Arc<dyn LookupObserver>,
    tx: mpsc::Sender<BatchItem>,
    cancel: CancellationToken,
    total: usize,
    completed: usize,
    members: usize,
}

impl Producer {
    async fn run(mut self, identities: Vec<SocialIdentity>, viewer: Option<CandidateAddress>) {
        let mut pending = Vec::with_capacity(identities.len());
        let mut unaddressed = Vec::new();
        for identity in identities {
            let candidates = identity.candidate_addresses();
            if candidates.is_empty() {
                unaddressed.push(identity);
            } else {
                pending.push((identity, candidates));
            }
        }

        for identity in unaddressed {
            if !self.emit(&identity, ResolvedIdentity::not_member(None), false).await {
                return self.stopped();
            }
        }

        let trusted = match &viewer {
            Some(viewer) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return self.stopped(),
                    edges = self.trust.fetch_trust_edges(viewer) => edges,
                }
            }
            None => TrustEdgeSet::new(),
        };

        let wave_size = self.config.batch_size.max(1);
        let resolver = self.resolver.clone();

        for (wave, chunk) in pending.chunks(wave_size).enumerate() {
            if self.cancel.is_cancelled() {
                return self.stopped();
            }
            if wave > 0 && self.config.wave_delay_ms > 0 {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return self.stopped(),
                    _ = tokio::time::sleep(Duration::from_millis(self.config.wave_delay_ms)) => {}
                }
            }

            self.observer.on_event(&LookupEvent::WaveStarted {
                wave,
                size: chunk.len(),
            });

            let mut inflight: FuturesUnordered<_> = chunk
                .iter()
                .map(|(identity, candidates)| {
                    let resolver = &resolver;
                    async move { (identity, resolver.resolve_first(candidates).await) }
                })
                .collect();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return self.stopped(),
                    next = inflight.next() => next,
                };
                let Some((identity, resolved)) = next else {
                    break;
                };

                let is_trusted = resolved.is_member
                    && resolved
                        .main_address
                        .as_ref()
                        .is_some_and(|main| trusted.contains(main));
                if !self.emit(identity, resolved, is_trusted).await {
                    return self.stopped();
                }
            }
        }

        self.observer.on_event(&LookupEvent::BatchFinished {
            total: self.total,
            members: self.members,
        });
    }

    /// Send one item. Returns false when the batch should stop.
    async fn emit(&mut self, identity: &SocialIdentity, resolved: ResolvedIdentity, trusted: bool) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        self.completed += 1;
        if resolved.is_member {
            self.members += 1;
        }
        let item = BatchItem {
            identity_id: identity.fid,
            username: identity.username.clone(),
            identity: resolved,
            is_trusted_by_viewer: trusted,
            progress: Progress {
                completed: self.completed,
                total: self.total,
            },
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    fn stopped(&self) {
        debug!(completed = self.completed, total = self.total, "batch producer stopping");
        self.observer.on_event(&LookupEvent::BatchCancelled {
            completed: self.completed,
            total: self.total,
        });
    }
}
