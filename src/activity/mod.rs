//! Activity and liveness classification from a Circles event log.
//!
//! `classify` is pure: the same events, clock reading and thresholds always
//! give the same classification. The score is three additive bands:
//! - volume: up to 30 points, saturating at `volume_saturation` events
//! - recent density: up to 40 points, saturating at `recent_saturation` events
//! - recency: 30 points inside the recent window, 15 inside the extended one
//!
//! Organizations short-circuit to an excluded, all-zero classification.

use crate::circles::{EventKind, ProtocolEvent};
use crate::config::ActivityConfig;
use serde::Serialize;

const SECS_PER_DAY: u64 = 86_400;

const VOLUME_BAND: f64 = 30.0;
const RECENT_BAND: f64 = 40.0;
const RECENCY_FULL: f64 = 30.0;
const RECENCY_PARTIAL: f64 = 15.0;

pub const ORGANIZATION_REASON: &str = "registered as an organization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Human,
    Organization,
    Group,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityClassification {
    /// 0-100.
    pub activity_score: u8,
    pub total_activity_events: u32,
    pub recent_event_count: u32,
    /// Unix seconds; 0 when unknown.
    pub last_activity_timestamp: u64,
    pub is_live_by_activity: bool,
    /// Filled by the resolver from the mintable-amount query.
    pub is_earning: bool,
    pub exclude_as_organization: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion_reason: Option<String>,
}

impl ActivityClassification {
    fn organization() -> Self {
        Self {
            exclude_as_organization: true,
            exclusion_reason: Some(ORGANIZATION_REASON.to_string()),
            ..Self::default()
        }
    }
}

pub fn classify(events: &[ProtocolEvent], now: u64, cfg: &ActivityConfig) -> ActivityClassification {
    if events
        .iter()
        .any(|e| e.kind == EventKind::OrganizationRegistered)
    {
        return ActivityClassification::organization();
    }

    let relevant: Vec<&ProtocolEvent> = events.iter().filter(|e| e.kind.is_activity()).collect();
    let total = relevant.len() as u32;

    let timestamps: Vec<u64> = relevant.iter().filter_map(|e| e.timestamp()).collect();
    let recent_cutoff = now.saturating_sub(cfg.recent_window_days * SECS_PER_DAY);
    let recent = timestamps.iter().filter(|ts| **ts >= recent_cutoff).count() as u32;
    let last = timestamps.iter().copied().max().unwrap_or(0);

    let score = activity_score(total, recent, last, now, cfg);
    let is_live = total > cfg.live_total_events
        || recent > cfg.live_recent_events
        || score > cfg.live_score;

    ActivityClassification {
        activity_score: score,
        total_activity_events: total,
        recent_event_count: recent,
        last_activity_timestamp: last,
        is_live_by_activity: is_live,
        is_earning: false,
        exclude_as_organization: false,
        exclusion_reason: None,
    }
}

fn activity_score(total: u32, recent: u32, last: u64, now: u64, cfg: &ActivityConfig) -> u8 {
    let volume = VOLUME_BAND * saturation(total, cfg.volume_saturation);
    let density = RECENT_BAND * saturation(recent, cfg.recent_saturation);

    let recency = if last == 0 {
        0.0
    } else {
        let age = now.saturating_sub(last);
        if age <= cfg.recent_window_days * SECS_PER_DAY {
            RECENCY_FULL
        } else if age <= cfg.extended_window_days * SECS_PER_DAY {
            RECENCY_PARTIAL
        } else {
            0.0
        }
    };

    (volume + density + recency).round().clamp(0.0, 100.0) as u8
}

fn saturation(count: u32, at: u32) -> f64 {
    if at == 0 {
        return if count > 0 { 1.0 } else { 0.0 };
    }
    (count as f64 / at as f64).min(1.0)
}

/// What kind of account an event log belongs to.
pub fn account_kind(events: &[ProtocolEvent]) -> AccountKind {
    let has = |kind: EventKind| events.iter().any(|e| e.kind == kind);

    if has(EventKind::OrganizationRegistered) {
        AccountKind::Organization
    } else if has(EventKind::GroupRegistered) {
        AccountKind::Group
    } else if has(EventKind::HumanRegistered) {
        AccountKind::Human
    } else {
        AccountKind::Unknown
    }
}
