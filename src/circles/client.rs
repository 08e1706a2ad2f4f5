//! reqwest-backed Circles RPC client.

use super::types::{parse_timestamp, CandidateAddress, ProtocolEvent, ProtocolProfile};
use super::{CirclesApi, UpstreamError};
use crate::config::CirclesConfig;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// JSON-RPC error object.
#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// One entry of a `circles_events` result.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(alias = "eventType", alias = "event_type")]
    event: String,
    #[serde(default)]
    values: Map<String, Value>,
    #[serde(default, alias = "blockTimestamp")]
    block_timestamp: Option<Value>,
}

impl From<RawEvent> for ProtocolEvent {
    fn from(raw: RawEvent) -> Self {
        let ts = raw.block_timestamp.as_ref().and_then(parse_timestamp);
        let event = ProtocolEvent::new(raw.event, raw.values);
        match ts {
            Some(ts) => event.with_block_timestamp(ts),
            None => event,
        }
    }
}

pub struct CirclesClient {
    base_url: String,
    http: Client,
    next_id: AtomicU64,
}

impl CirclesClient {
    pub fn new(config: &CirclesConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("circles-friends/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: config.rpc_url.trim_end_matches('/').to_string(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC call and return its `result` (which may be `null`).
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(format!("{}/", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Unavailable {
                status: Some(status.as_u16()),
                message: format!("{method} returned {status}"),
            });
        }

        let text = resp.text().await?;
        let mut envelope: Map<String, Value> = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed(format!("{method}: {e}")))?;

        if let Some(err) = envelope.remove("error").filter(|e| !e.is_null()) {
            let err: RpcErrorBody = serde_json::from_value(err)
                .map_err(|e| UpstreamError::Malformed(format!("{method} error body: {e}")))?;
            return Err(UpstreamError::Unavailable {
                status: None,
                message: format!("{method} rpc error {}: {}", err.code, err.message),
            });
        }

        // A present-but-null result is valid; only a missing key is malformed.
        envelope
            .remove("result")
            .ok_or_else(|| UpstreamError::Malformed(format!("{method}: missing result")))
    }
}

#[async_trait]
impl CirclesApi for CirclesClient {
    async fn fetch_events(
        &self,
        address: &CandidateAddress,
    ) -> Result<Vec<ProtocolEvent>, UpstreamError> {
        let result = self
            .rpc_call("circles_events", json!([address.as_str(), 0, Value::Null]))
            .await?;

        let entries = match result {
            Value::Array(entries) => entries,
            Value::Null => Vec::new(),
            other => {
                return Err(UpstreamError::Malformed(format!(
                    "circles_events: expected array, got {}",
                    json_kind(&other)
                )))
            }
        };

        let total = entries.len();
        let events: Vec<ProtocolEvent> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<RawEvent>(entry) {
                Ok(raw) => Some(raw.into()),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable event entry");
                    None
                }
            })
            .collect();

        debug!(
            address = %address,
            events = events.len(),
            skipped = total - events.len(),
            "fetched circles events"
        );
        Ok(events)
    }

    async fn fetch_profile(
        &self,
        address: &CandidateAddress,
    ) -> Result<Option<ProtocolProfile>, UpstreamError> {
        let url = format!("{}/profiles/search", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("address", address.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(UpstreamError::Unavailable {
                status: Some(status.as_u16()),
                message: format!("profile search returned {status}"),
            });
        }

        let text = resp.text().await?;
        parse_profile_body(&text)
    }

    async fn fetch_mintable_amount(
        &self,
        address: &CandidateAddress,
    ) -> Result<String, UpstreamError> {
        let result = self
            .rpc_call("circles_getMintableAmount", json!([address.as_str()]))
            .await?;

        match result {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(UpstreamError::Malformed(format!(
                "circles_getMintableAmount: expected numeric string, got {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Normalise the profile-search body: a bare object, a list (first element
/// wins), or nothing at all.
fn parse_profile_body(text: &str) -> Result<Option<ProtocolProfile>, UpstreamError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| UpstreamError::Malformed(format!("profile search: {e}")))?;

    let object = match value {
        Value::Null => return Ok(None),
        Value::Object(map) => map,
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => return Ok(None),
            Some(other) => {
                return Err(UpstreamError::Malformed(format!(
                    "profile search: expected object in list, got {}",
                    json_kind(&other)
                )))
            }
        },
        other => {
            return Err(UpstreamError::Malformed(format!(
                "profile search: expected object or list, got {}",
                json_kind(&other)
            )))
        }
    };

    Ok(ProtocolProfile::from_object(object))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circles::EventKind;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";

    fn client_for(server: &MockServer) -> CirclesClient {
        CirclesClient::new(&CirclesConfig {
            rpc_url: server.uri(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    fn alice() -> CandidateAddress {
        CandidateAddress::parse(ALICE).unwrap()
    }

    #[test]
    fn test_parse_profile_body_shapes() {
        let bare = parse_profile_body(r#"{"name":"Alice"}"#).unwrap().unwrap();
        assert_eq!(bare.name, "Alice");

        let listed = parse_profile_body(r#"[{"name":"Alice"},{"name":"Other"}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(listed.name, "Alice");

        assert_eq!(parse_profile_body("").unwrap(), None);
        assert_eq!(parse_profile_body("null").unwrap(), None);
        assert_eq!(parse_profile_body("[]").unwrap(), None);
        assert_eq!(parse_profile_body(r#"{"address":"0x1"}"#).unwrap(), None);

        assert!(matches!(
            parse_profile_body("<html>"),
            Err(UpstreamError::Malformed(_))
        ));
        assert!(matches!(
            parse_profile_body(r#""Alice""#),
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_events_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({
                "method": "circles_events",
                "params": [ALICE, 0, null]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": [
                    {"event": "CrcV2_RegisterHuman", "values": {"timestamp": "0x6553f100", "avatar": ALICE}},
                    {"event": "CrcV2_Trust", "values": {"truster": ALICE, "trustee": "0x0000000000000000000000000000000000000b0b"}},
                    {"values": {"no": "event tag"}}
                ]
            })))
            .mount(&server)
            .await;

        let events = client_for(&server).fetch_events(&alice()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::HumanRegistered);
        assert_eq!(events[0].timestamp(), Some(1_700_000_000));
        assert_eq!(events[1].kind, EventKind::TrustEdgeSet);
    }

    #[tokio::test]
    async fn test_fetch_events_empty_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": []})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.fetch_events(&alice()).await.unwrap().is_empty());

        let err = client.fetch_events(&alice()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Malformed(_)));

        let err = client.fetch_events(&alice()).await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn test_fetch_profile_variants() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profiles/search"))
            .and(query_param("address", ALICE))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"name": "Alice", "description": "hi"}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profiles/search"))
            .and(query_param("address", "0x0000000000000000000000000000000000000b0b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profiles/search"))
            .and(query_param("address", "0x0000000000000000000000000000000000000bad"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let profile = client.fetch_profile(&alice()).await.unwrap().unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.description.as_deref(), Some("hi"));

        let bob = CandidateAddress::parse("0x0000000000000000000000000000000000000b0b").unwrap();
        assert_eq!(client.fetch_profile(&bob).await.unwrap(), None);

        let bad = CandidateAddress::parse("0x0000000000000000000000000000000000000bad").unwrap();
        let err = client.fetch_profile(&bad).await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Unavailable {
                status: Some(503),
                message: "profile search returned 503 Service Unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_mintable_amount() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "circles_getMintableAmount"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "1500000000000000000"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "error": {"code": -32000, "message": "not a human"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(
            client.fetch_mintable_amount(&alice()).await.unwrap(),
            "1500000000000000000"
        );
        let err = client.fetch_mintable_amount(&alice()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { status: None, .. }));
    }

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": "1"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = CirclesClient::new(&CirclesConfig {
            rpc_url: server.uri(),
            request_timeout_secs: 1,
        })
        .unwrap();
        let err = client.fetch_mintable_amount(&alice()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { status: None, .. }));
    }
}
