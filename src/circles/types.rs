//! Domain types for data coming back from the Circles indexer.
//!
//! Upstream JSON is narrowed into these types at the client boundary; nothing
//! past `circles::client` sees raw response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("address must have 40 hex digits, got {len}: {input}")]
    BadLength { input: String, len: usize },
    #[error("address contains non-hex characters: {0}")]
    NotHex(String),
}

/// A 20-byte Ethereum address in canonical lowercase `0x…` form.
///
/// Equality, hashing and ordering all operate on the canonical form, so two
/// addresses that differ only in checksum casing compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandidateAddress(String);

impl CandidateAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AddressError::MissingPrefix(trimmed.to_string()))?;

        if hex.len() != 40 {
            return Err(AddressError::BadLength {
                input: trimmed.to_string(),
                len: hex.len(),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex(trimmed.to_string()));
        }

        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short `0x1234…abcd` form for log lines.
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[38..])
    }
}

impl fmt::Display for CandidateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CandidateAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CandidateAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CandidateAddress> for String {
    fn from(address: CandidateAddress) -> Self {
        address.0
    }
}

/// A human-readable profile registered for a main Circles account.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolProfile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// The full upstream object, kept for fields we don't model.
    #[serde(skip)]
    pub raw: Map<String, Value>,
}

impl ProtocolProfile {
    /// Build a profile from an upstream object. A missing or blank `name`
    /// means no profile exists.
    pub fn from_object(raw: Map<String, Value>) -> Option<Self> {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())?
            .to_string();

        let description = first_str(&raw, &["description", "bio"]);
        let avatar_url = first_str(
            &raw,
            &["avatarUrl", "previewImageUrl", "imageUrl", "avatar_url"],
        );

        Some(Self {
            name,
            description,
            avatar_url,
            raw,
        })
    }
}

fn first_str(raw: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| raw.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// The protocol event types the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A signer (owner) was added to a main account.
    SignerAdded,
    HumanRegistered,
    OrganizationRegistered,
    GroupRegistered,
    Transfer,
    TrustEdgeSet,
    StreamEvent,
    Other,
}

impl EventKind {
    /// Map an upstream event tag to a kind. Accepts both the indexer's
    /// versioned names and the plain names.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SignerAdded" | "Safe_AddedOwner" | "AddedOwner" => Self::SignerAdded,
            "HumanRegistered" | "CrcV2_RegisterHuman" | "CrcV1_Signup" => Self::HumanRegistered,
            "OrganizationRegistered"
            | "CrcV2_RegisterOrganization"
            | "CrcV1_OrganizationSignup" => Self::OrganizationRegistered,
            "GroupRegistered" | "CrcV2_RegisterGroup" => Self::GroupRegistered,
            "Transfer"
            | "CrcV1_Transfer"
            | "CrcV1_HubTransfer"
            | "CrcV2_TransferSingle"
            | "CrcV2_TransferBatch"
            | "CrcV2_Erc20WrapperTransfer" => Self::Transfer,
            "TrustEdgeSet" | "CrcV2_Trust" | "CrcV1_Trust" => Self::TrustEdgeSet,
            "StreamEvent" | "CrcV2_StreamCompleted" => Self::StreamEvent,
            _ => Self::Other,
        }
    }

    /// Kinds that count toward activity scoring.
    pub fn is_activity(self) -> bool {
        matches!(
            self,
            Self::Transfer | Self::StreamEvent | Self::TrustEdgeSet | Self::HumanRegistered
        )
    }
}

/// One protocol log entry for an address, in chain order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    pub kind: EventKind,
    /// Upstream tag as received, e.g. `CrcV2_Trust`.
    pub name: String,
    pub values: Map<String, Value>,
    pub block_timestamp: Option<u64>,
}

impl ProtocolEvent {
    pub fn new(name: impl Into<String>, values: Map<String, Value>) -> Self {
        let name = name.into();
        Self {
            kind: EventKind::from_name(&name),
            name,
            values,
            block_timestamp: None,
        }
    }

    pub fn with_block_timestamp(mut self, ts: u64) -> Self {
        self.block_timestamp = Some(ts);
        self
    }

    /// Event time in unix seconds, if the event carries one.
    pub fn timestamp(&self) -> Option<u64> {
        self.block_timestamp
            .filter(|ts| *ts > 0)
            .or_else(|| {
                ["timestamp", "blockTimestamp", "time"]
                    .iter()
                    .find_map(|k| self.values.get(*k).and_then(parse_timestamp))
            })
    }

    /// The first of `keys` that holds a parseable address.
    pub fn address_field(&self, keys: &[&str]) -> Option<CandidateAddress> {
        keys.iter().find_map(|k| {
            self.values
                .get(*k)
                .and_then(Value::as_str)
                .and_then(|s| CandidateAddress::parse(s).ok())
        })
    }

    /// The first of `keys` that holds a numeric value.
    pub fn numeric_field(&self, keys: &[&str]) -> Option<u64> {
        keys.iter()
            .find_map(|k| self.values.get(*k).and_then(parse_numeric))
    }
}

/// Parse an upstream number that may be a JSON number, a decimal string or a
/// `0x` hex string. Decimal strings too large for `u64` saturate.
pub fn parse_numeric(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                if hex.is_empty() {
                    return None;
                }
                let digits = hex.trim_start_matches('0');
                if digits.len() > 16 {
                    return Some(u64::MAX);
                }
                return u64::from_str_radix(if digits.is_empty() { "0" } else { digits }, 16)
                    .ok();
            }
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                return Some(s.parse::<u64>().unwrap_or(u64::MAX));
            }
            s.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        }
        _ => None,
    }
}

/// Like [`parse_numeric`] but normalised to unix seconds; zero is "unknown".
pub fn parse_timestamp(value: &Value) -> Option<u64> {
    let raw = parse_numeric(value)?;
    let secs = if raw > MILLIS_THRESHOLD { raw / 1000 } else { raw };
    (secs > 0).then_some(secs)
}
