//! Lookup observability hook.
//!
//! The resolver, trust fetcher and batch orchestrator report what they do as
//! [`LookupEvent`]s to an injected [`LookupObserver`]. The default
//! [`TracingObserver`] turns them into structured `tracing` records; callers
//! can route them elsewhere without touching lookup logic.

use crate::cache::CacheOp;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Which upstream call an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOp {
    Events,
    Profile,
    MintableAmount,
}

impl UpstreamOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Events => "circles_events",
            Self::Profile => "profiles_search",
            Self::MintableAmount => "circles_getMintableAmount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEvent {
    CacheHit {
        op: CacheOp,
        address: String,
    },
    UpstreamFailure {
        op: UpstreamOp,
        address: String,
        error: String,
        rate_limited: bool,
    },
    DirectMatch {
        address: String,
    },
    SignerMatch {
        signer: String,
        main: String,
    },
    NotMember {
        address: String,
    },
    OrganizationExcluded {
        address: String,
    },
    TrustEdgesLoaded {
        viewer: String,
        edges: usize,
    },
    WaveStarted {
        wave: usize,
        size: usize,
    },
    BatchFinished {
        total: usize,
        members: usize,
    },
    BatchCancelled {
        completed: usize,
        total: usize,
    },
}

impl LookupEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CacheHit { .. } => "cache_hit",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::DirectMatch { .. } => "direct_match",
            Self::SignerMatch { .. } => "signer_match",
            Self::NotMember { .. } => "not_member",
            Self::OrganizationExcluded { .. } => "organization_excluded",
            Self::TrustEdgesLoaded { .. } => "trust_edges_loaded",
            Self::WaveStarted { .. } => "wave_started",
            Self::BatchFinished { .. } => "batch_finished",
            Self::BatchCancelled { .. } => "batch_cancelled",
        }
    }
}

pub trait LookupObserver: Send + Sync {
    fn on_event(&self, event: &LookupEvent);
}

/// Routes lookup events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LookupObserver for TracingObserver {
    fn on_event(&self, event: &LookupEvent) {
        match event {
            LookupEvent::CacheHit { op, address } => {
                debug!(op = %op, address = %address, "cache hit");
            }
            LookupEvent::UpstreamFailure {
                op,
                address,
                error,
                rate_limited,
            } => {
                warn!(
                    op = op.as_str(),
                    address = %address,
                    rate_limited = rate_limited,
                    error = %error,
                    "upstream call failed, treating as not found"
                );
            }
            LookupEvent::DirectMatch { address } => {
                debug!(address = %address, "circles profile found directly");
            }
            LookupEvent::SignerMatch { signer, main } => {
                info!(signer = %signer, main = %main, "resolved signer to main account");
            }
            LookupEvent::NotMember { address } => {
                debug!(address = %address, "no circles account");
            }
            LookupEvent::OrganizationExcluded { address } => {
                info!(address = %address, "organization account excluded");
            }
            LookupEvent::TrustEdgesLoaded { viewer, edges } => {
                info!(viewer = %viewer, edges = edges, "viewer trust edges loaded");
            }
            LookupEvent::WaveStarted { wave, size } => {
                debug!(wave = wave, size = size, "resolution wave started");
            }
            LookupEvent::BatchFinished { total, members } => {
                info!(total = total, members = members, "batch resolution finished");
            }
            LookupEvent::BatchCancelled { completed, total } => {
                info!(completed = completed, total = total, "batch resolution cancelled");
            }
        }
    }
}

/// Keeps every event in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LookupEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LookupEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl LookupObserver for RecordingObserver {
    fn on_event(&self, event: &LookupEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
