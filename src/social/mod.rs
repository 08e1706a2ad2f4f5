//! Farcaster follow list via the Neynar API.
//!
//! Only the shapes the batch pipeline needs are decoded: who the viewer
//! follows and which Ethereum addresses each of them has verified.

use crate::circles::CandidateAddress;
use crate::config::NeynarConfig;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SocialError {
    #[error("social api request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("social api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode social api response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A followed account and the addresses it claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialIdentity {
    pub fid: u64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub verified_addresses: Vec<String>,
}

impl SocialIdentity {
    /// Verified addresses that parse, lowercased, in listed order, without
    /// duplicates. Anything malformed is dropped.
    pub fn candidate_addresses(&self) -> Vec<CandidateAddress> {
        let mut out: Vec<CandidateAddress> = Vec::new();
        for raw in &self.verified_addresses {
            match CandidateAddress::parse(raw) {
                Ok(address) if !out.contains(&address) => out.push(address),
                Ok(_) => {}
                Err(e) => debug!(fid = self.fid, error = %e, "skipping unparseable address"),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct FollowingPage {
    pub identities: Vec<SocialIdentity>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowingResponse {
    #[serde(default)]
    users: Vec<FollowEntry>,
    #[serde(default)]
    next: Option<NextCursor>,
}

#[derive(Debug, Deserialize)]
struct FollowEntry {
    user: NeynarUser,
}

#[derive(Debug, Deserialize)]
struct NextCursor {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NeynarUser {
    fid: u64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    verified_addresses: VerifiedAddresses,
}

#[derive(Debug, Default, Deserialize)]
struct VerifiedAddresses {
    #[serde(default)]
    eth_addresses: Vec<String>,
}

impl From<NeynarUser> for SocialIdentity {
    fn from(user: NeynarUser) -> Self {
        Self {
            fid: user.fid,
            username: user.username,
            display_name: user.display_name.filter(|n| !n.trim().is_empty()),
            verified_addresses: user.verified_addresses.eth_addresses,
        }
    }
}

pub struct NeynarClient {
    api_key: String,
    base_url: String,
    page_size: u32,
    http: Client,
}

impl NeynarClient {
    pub fn new(config: &NeynarConfig, api_key: &str) -> Result<Self, SocialError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            http,
        })
    }

    /// One page of accounts `fid` follows.
    pub async fn fetch_page(
        &self,
        fid: u64,
        cursor: Option<&str>,
    ) -> Result<FollowingPage, SocialError> {
        let url = format!("{}/v2/farcaster/following", self.base_url);
        let mut query = vec![
            ("fid", fid.to_string()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let resp = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("accept", "application/json")
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SocialError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: FollowingResponse = serde_json::from_str(&body)?;
        let next_cursor = parsed
            .next
            .and_then(|n| n.cursor)
            .filter(|c| !c.is_empty());

        Ok(FollowingPage {
            identities: parsed.users.into_iter().map(|e| e.user.into()).collect(),
            next_cursor,
        })
    }

    /// Page through the whole follow list, up to `max_pages` pages. A failure
    /// after the first page keeps what was already fetched.
    pub async fn fetch_all(&self, fid: u64, max_pages: u32) -> Result<Vec<SocialIdentity>, SocialError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 0..max_pages.max(1) {
            let page = match self.fetch_page(fid, cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) if page_no > 0 => {
                    warn!(fid = fid, page = page_no, error = %e, "follow list truncated");
                    break;
                }
                Err(e) => return Err(e),
            };

            debug!(fid = fid, page = page_no, count = page.identities.len(), "fetched follow page");
            all.extend(page.identities);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(fid = fid, follows = all.len(), "follow list loaded");
        Ok(all)
    }
}
