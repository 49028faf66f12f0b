//! JSON-RPC ledger gateway.
//!
//! Speaks JSON-RPC 2.0 to a ledger node exposing `chainId`, `blockNumber`,
//! `call`, `send` and `getEvents`.
//!
//! ## Resilience
//!
//! * Reads and event queries retry transport errors, HTTP 429 and soft RPC
//!   errors with exponential back-off, at most [`MAX_ATTEMPTS`] times, then
//!   fail with `GatewayUnavailable`.
//! * Codes -32600 / -32601 are hard failures and are never retried.
//! * `send` is never retried. A connection that could not be opened means the
//!   call was not delivered (`GatewayUnavailable`); any later failure leaves
//!   the outcome undetermined and the caller must reconcile by re-reading.

use std::time::Duration;

use agri_lifecycle::Address;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::contract;
use crate::errors::{Result, TrackerError};
use crate::events::RawEvent;
use crate::gateway::{LedgerGateway, Submission};

pub const MAX_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn is_hard(&self) -> bool {
        self.code == -32600 || self.code == -32601
    }

    /// Contract execution failures: EIP-1474 code 3 and the -32000 range
    /// nodes use for reverts.
    fn is_revert(&self) -> bool {
        self.code == 3 || self.message.contains("revert")
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsResult {
    #[serde(default)]
    pub events: Vec<Value>,
    pub cursor: Option<String>,
    #[serde(rename = "latestBlock")]
    pub latest_block: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub reason: Option<String>,
    #[serde(rename = "txHash")]
    pub tx_hash: Option<String>,
    pub output: Option<Value>,
}

// ─────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────

pub struct RpcGateway {
    client: Client,
    rpc_url: String,
    contract: Address,
    events_per_page: u32,
    initial_backoff: Duration,
    max_attempts: u32,
}

impl RpcGateway {
    pub fn new(client: Client, rpc_url: &str, contract: Address, events_per_page: u32) -> Self {
        Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract,
            events_per_page: events_per_page.max(1),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Override the retry schedule.
    pub fn with_retry(mut self, initial_backoff: Duration, max_attempts: u32) -> Self {
        self.initial_backoff = initial_backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn post(&self, method: &str, params: &Value) -> reqwest::Result<Response> {
        self.client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
    }

    /// Issue an idempotent request, retrying per the module policy.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let failure = match self.post(method, &params).await {
                Err(e) => format!("request failed: {e}"),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    "rate-limited".to_string()
                }
                Ok(resp) if !resp.status().is_success() => format!("HTTP {}", resp.status()),
                Ok(resp) => {
                    let body: RpcResponse = resp.json().await?;
                    match body.error {
                        Some(err) if err.is_hard() => {
                            return Err(TrackerError::InvalidInput(format!(
                                "RPC hard error {} on {method}: {}",
                                err.code, err.message
                            )));
                        }
                        Some(err) if err.is_revert() => {
                            return Err(TrackerError::Rejected(
                                extract_revert_reason(&err.message)
                                    .unwrap_or_else(|| err.message.clone()),
                            ));
                        }
                        Some(err) => format!("RPC soft error {} {}", err.code, err.message),
                        None => {
                            return body.result.ok_or_else(|| {
                                TrackerError::EventParse(format!("Empty result from {method}"))
                            });
                        }
                    }
                }
            };

            if attempt >= self.max_attempts {
                return Err(TrackerError::GatewayUnavailable(format!(
                    "{method}: {failure} after {attempt} attempts"
                )));
            }
            warn!(
                "{method} {failure} (will retry in {}s)",
                backoff.as_secs_f32()
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
            attempt += 1;
        }
    }
}

#[async_trait]
impl LedgerGateway for RpcGateway {
    async fn chain_id(&self) -> Result<u64> {
        let value = self.request("chainId", json!([])).await?;
        contract::decode_u64(&value)
    }

    async fn read(&self, function: &str, args: &[Value]) -> Result<Value> {
        self.request(
            "call",
            json!({
                "contract": self.contract.as_str(),
                "function": function,
                "args": args,
            }),
        )
        .await
    }

    async fn send(&self, function: &str, args: &[Value], caller: &Address) -> Result<Submission> {
        let params = json!({
            "contract": self.contract.as_str(),
            "function": function,
            "args": args,
            "from": caller.as_str(),
        });

        let resp = match self.post("send", &params).await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                return Err(TrackerError::GatewayUnavailable(e.to_string()));
            }
            Err(e) => {
                warn!("send {function} outcome undetermined: {e}");
                return Ok(Submission::Undetermined {
                    detail: e.to_string(),
                });
            }
        };

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(Submission::Rejected {
                reason: Some("ledger node rate-limited the submission".to_string()),
            });
        }

        let body: RpcResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(Submission::Undetermined {
                    detail: format!("unreadable acknowledgment: {e}"),
                });
            }
        };

        if let Some(err) = body.error {
            if err.is_hard() {
                return Err(TrackerError::InvalidInput(format!(
                    "RPC hard error {} on send: {}",
                    err.code, err.message
                )));
            }
            return Ok(Submission::Rejected {
                reason: extract_revert_reason(&err.message),
            });
        }

        let result: SendResult = match body.result {
            Some(value) => serde_json::from_value(value)?,
            None => {
                return Ok(Submission::Undetermined {
                    detail: "empty acknowledgment".to_string(),
                });
            }
        };
        debug!("send {function} acknowledged: success={}", result.success);

        Ok(if result.success {
            Submission::Accepted {
                tx_hash: result.tx_hash,
                output: result.output,
            }
        } else {
            Submission::Rejected {
                reason: result.reason.filter(|r| !r.trim().is_empty()),
            }
        })
    }

    async fn query_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RawEvent>> {
        let mut cursor: Option<String> = None;
        let mut events = Vec::new();

        loop {
            let params = build_params(
                &self.contract,
                from_block,
                to_block,
                cursor.as_deref(),
                self.events_per_page,
            );
            let page: EventsResult =
                serde_json::from_value(self.request("getEvents", params).await?)?;
            let fetched = page.events.len();
            events.extend(decode_events(&page.events));

            debug!(
                "Fetched {fetched} events (latest_block={:?})",
                page.latest_block
            );

            match page.cursor {
                Some(next) if fetched >= self.events_per_page as usize => cursor = Some(next),
                _ => break,
            }
        }

        events.retain(|e| (from_block..=to_block).contains(&e.block_height));
        events.sort_by_key(RawEvent::ordering_key);
        Ok(events)
    }

    async fn latest_block(&self) -> Result<u64> {
        let value = self.request("blockNumber", json!([])).await?;
        contract::decode_u64(&value)
    }
}

fn build_params(
    contract: &Address,
    from_block: u64,
    to_block: u64,
    cursor: Option<&str>,
    limit: u32,
) -> Value {
    let mut params = json!({
        "contract": contract.as_str(),
        "fromBlock": from_block,
        "toBlock": to_block,
        "pagination": {
            "limit": limit
        }
    });

    if let Some(cur) = cursor {
        params["pagination"]["cursor"] = json!(cur);
    }

    params
}

// ─────────────────────────────────────────────────────────
// Event decoding
// ─────────────────────────────────────────────────────────

/// Decode a page of events, skipping entries that do not have the expected
/// shape.
pub fn decode_events(raw: &[Value]) -> Vec<RawEvent> {
    raw.iter().filter_map(decode_single).collect()
}

fn decode_single(raw: &Value) -> Option<RawEvent> {
    let mut value = raw.clone();

    // Some nodes report block time as an ISO-8601 string.
    if let Some(iso) = value.get("timestamp").and_then(Value::as_str) {
        let parsed = parse_iso_to_unix(iso);
        value["timestamp"] = json!(parsed);
    }

    match serde_json::from_value::<RawEvent>(value) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping malformed event: {e}");
            None
        }
    }
}

/// Parse an ISO-8601 timestamp string into a Unix epoch (seconds).
fn parse_iso_to_unix(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Pull the human-readable reason out of a node's revert message.
pub fn extract_revert_reason(message: &str) -> Option<String> {
    const QUOTED: &str = "reverted with reason string '";
    const PLAIN: &str = "execution reverted: ";

    let reason = if let Some(start) = message.find(QUOTED) {
        let rest = &message[start + QUOTED.len()..];
        rest.split('\'').next().unwrap_or(rest)
    } else if let Some(start) = message.find(PLAIN) {
        &message[start + PLAIN.len()..]
    } else {
        message
    };

    let reason = reason.trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, routing::post, Json, Router};

    #[test]
    fn revert_reason_forms() {
        assert_eq!(
            extract_revert_reason(
                "VM Exception while processing transaction: reverted with reason string 'Only farmer'"
            )
            .as_deref(),
            Some("Only farmer")
        );
        assert_eq!(
            extract_revert_reason("execution reverted: Invalid product id").as_deref(),
            Some("Invalid product id")
        );
        assert_eq!(
            extract_revert_reason("out of gas").as_deref(),
            Some("out of gas")
        );
        assert_eq!(extract_revert_reason("execution reverted: "), None);
    }

    #[test]
    fn params_use_cursor_when_present() {
        let contract = Address::from_low_u64(1);
        let first = build_params(&contract, 0, 100, None, 50);
        assert_eq!(first["pagination"]["limit"], 50);
        assert!(first["pagination"].get("cursor").is_none());

        let next = build_params(&contract, 0, 100, Some("abc"), 50);
        assert_eq!(next["pagination"]["cursor"], "abc");
        assert_eq!(next["toBlock"], 100);
    }

    #[test]
    fn malformed_events_are_skipped() {
        let raw = vec![
            json!({ "name": "ProductPlanted", "args": { "id": 1 }, "blockHeight": 4, "txHash": "0x1" }),
            json!({ "name": "ProductPlanted", "args": { "id": 2 } }),
            json!({ "name": "ProductSold", "args": { "id": 1 }, "blockHeight": 9, "txHash": "0x2",
                    "timestamp": "2024-01-01T00:00:00Z" }),
        ];
        let events = decode_events(&raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, Some(1_704_067_200));
    }

    #[test]
    fn parse_iso_timestamp() {
        assert_eq!(parse_iso_to_unix("2024-01-01T00:00:00Z"), Some(1_704_067_200));
        assert_eq!(parse_iso_to_unix("yesterday"), None);
    }

    // ─── Against a local JSON-RPC stub ───────────────────

    #[derive(Clone)]
    struct Stub {
        hits: Arc<AtomicUsize>,
        replies: Arc<Vec<Value>>,
    }

    async fn handle(State(stub): State<Stub>, Json(_req): Json<Value>) -> Json<Value> {
        let n = stub.hits.fetch_add(1, Ordering::SeqCst);
        let reply = stub.replies[n.min(stub.replies.len() - 1)].clone();
        Json(reply)
    }

    async fn serve(replies: Vec<Value>) -> (String, Arc<AtomicUsize>) {
        let stub = Stub {
            hits: Arc::new(AtomicUsize::new(0)),
            replies: Arc::new(replies),
        };
        let hits = stub.hits.clone();
        let app = Router::new().route("/", post(handle)).with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    fn gateway(url: &str) -> RpcGateway {
        RpcGateway::new(Client::new(), url, Address::from_low_u64(0xc0), 2)
            .with_retry(Duration::from_millis(5), 3)
    }

    #[tokio::test]
    async fn soft_errors_are_retried() {
        let (url, hits) = serve(vec![
            json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32005, "message": "busy" } }),
            json!({ "jsonrpc": "2.0", "id": 1, "result": "0x539" }),
        ])
        .await;
        assert_eq!(gateway(&url).chain_id().await.unwrap(), 1337);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (url, hits) = serve(vec![
            json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32005, "message": "busy" } }),
        ])
        .await;
        let err = gateway(&url).latest_block().await.unwrap_err();
        assert!(matches!(err, TrackerError::GatewayUnavailable(_)), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hard_errors_are_not_retried() {
        let (url, hits) = serve(vec![
            json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32601, "message": "no such method" } }),
        ])
        .await;
        assert!(matches!(
            gateway(&url).latest_block().await,
            Err(TrackerError::InvalidInput(_))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_surfaces_revert_reason_once() {
        let (url, hits) = serve(vec![json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": 3, "message": "execution reverted: Only the farmer can plant" }
        })])
        .await;
        let outcome = gateway(&url)
            .send("plantProduct", &[json!(1)], &Address::from_low_u64(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Submission::Rejected {
                reason: Some("Only the farmer can plant".to_string())
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_acknowledgment_is_decoded() {
        let (url, _) = serve(vec![json!({
            "jsonrpc": "2.0", "id": 1,
            "result": { "success": true, "txHash": "0xabc", "output": 4 }
        })])
        .await;
        let outcome = gateway(&url)
            .send("addProduct", &[json!("Rice"), json!("Paddy")], &Address::from_low_u64(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Submission::Accepted {
                tx_hash: Some("0xabc".to_string()),
                output: Some(json!(4)),
            }
        );
    }

    #[tokio::test]
    async fn send_to_closed_port_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let err = gateway(&url)
            .send("plantProduct", &[json!(1)], &Address::from_low_u64(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::GatewayUnavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn events_are_paged_and_sorted() {
        let (url, hits) = serve(vec![
            json!({ "jsonrpc": "2.0", "id": 1, "result": {
                "events": [
                    { "name": "ProductPlanted", "args": { "id": 1 }, "blockHeight": 3, "txHash": "0x3" },
                    { "name": "ProductRegistered", "args": { "id": 1 }, "blockHeight": 2, "txHash": "0x2" }
                ],
                "cursor": "page-2",
                "latestBlock": 10
            }}),
            json!({ "jsonrpc": "2.0", "id": 1, "result": {
                "events": [
                    { "name": "ProductHarvested", "args": { "id": 1 }, "blockHeight": 5, "txHash": "0x5" }
                ],
                "cursor": "page-3",
                "latestBlock": 10
            }}),
        ])
        .await;
        let events = gateway(&url).query_events(0, 10).await.unwrap();
        let heights: Vec<u64> = events.iter().map(|e| e.block_height).collect();
        assert_eq!(heights, vec![2, 3, 5]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
