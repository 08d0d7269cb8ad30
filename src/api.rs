//! HTTP client for the POS server, used by the sync engine.
//!
//! Errors keep the HTTP status and the server's error `code` so callers can
//! tell a genuine `NOT_FOUND` from a proxy 404 or a transport failure.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::InvoicePayload;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the lightweight connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    /// Could not reach the server at all.
    #[error("{0}")]
    Transport(String),

    #[error("{message} (HTTP {status})")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid response from server: {0}")]
    Decode(String),
}

impl ApiError {
    /// The server answered 404 with its own `NOT_FOUND` error body.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ApiError::Status { status: 404, code: Some(code), .. } if code == "NOT_FOUND"
        )
    }

    /// Retrying cannot help: the server rejected the payload itself.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ApiError::Status { status: 400, code: Some(code), .. } if code == "VALIDATION_ERROR"
        )
    }
}

// ---------------------------------------------------------------------------
// URL normalisation and error mapping
// ---------------------------------------------------------------------------

/// Base URL of the shop server as the sync engine stores it.
///
/// Terminals usually reach the server over the shop LAN, so a bare host on
/// loopback or a private range gets `http://`; anything else gets
/// `https://`. Route paths are appended to the result, so a trailing `/` or
/// `/api` is dropped.
pub fn normalize_server_url(url: &str) -> String {
    let trimmed = url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else if is_lan_host(trimmed) {
        format!("http://{trimmed}")
    } else {
        format!("https://{trimmed}")
    };

    let base = with_scheme.trim_end_matches('/');
    base.strip_suffix("/api")
        .unwrap_or(base)
        .trim_end_matches('/')
        .to_string()
}

fn is_lan_host(host: &str) -> bool {
    const LAN_PREFIXES: &[&str] = &["localhost", "127.", "10.", "192.168."];
    LAN_PREFIXES.iter().any(|p| host.starts_with(p))
}

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach POS server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid POS server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Not authorized by POS server".to_string(),
        404 => "POS server endpoint not found".to_string(),
        s if s >= 500 => format!("POS server error (HTTP {s})"),
        s => format!("Unexpected response from POS server (HTTP {s})"),
    }
}

/// Server-assigned identity of a synced invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedOrder {
    pub server_id: String,
    pub ticket_number: Option<i64>,
    pub deduplicated: bool,
}

impl SyncedOrder {
    fn from_response(body: &Value) -> Result<Self, ApiError> {
        let order = body.get("order").unwrap_or(body);
        let server_id = order
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode("response has no order id".into()))?
            .to_string();
        Ok(Self {
            server_id,
            ticket_number: order.get("ticketNumber").and_then(Value::as_i64),
            deduplicated: body
                .get("deduplicated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerClient {
    http: Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: normalize_server_url(base_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Connectivity probe against `/api/health`.
    pub async fn is_online(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health probe failed: {}", friendly_error(&self.base_url, &e));
                false
            }
        }
    }

    /// JSON request. `path` includes the leading slash.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &full_url)
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let parsed = serde_json::from_str::<Value>(&body_text).ok();
            let code = parsed
                .as_ref()
                .and_then(|j| j.get("code"))
                .and_then(Value::as_str)
                .map(String::from);
            let message = parsed
                .as_ref()
                .and_then(|j| j.get("error").or_else(|| j.get("message")))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| status_error(status));
            return Err(ApiError::Status {
                status: status.as_u16(),
                code,
                message,
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Idempotent create keyed by `payload.client_request_id`.
    pub async fn post_invoice(&self, payload: &InvoicePayload) -> Result<SyncedOrder, ApiError> {
        let body = serde_json::to_value(payload).map_err(|e| ApiError::Decode(e.to_string()))?;
        let resp = self
            .request(Method::POST, "/api/orders/sync", Some(&body))
            .await?;
        SyncedOrder::from_response(&resp)
    }

    /// Update the order created from local record `local_id`.
    pub async fn put_invoice(
        &self,
        local_id: &str,
        payload: &InvoicePayload,
    ) -> Result<SyncedOrder, ApiError> {
        let body = serde_json::to_value(payload).map_err(|e| ApiError::Decode(e.to_string()))?;
        let path = format!("/api/orders/sync/{}", percent_encode(local_id));
        let resp = self.request(Method::PUT, &path, Some(&body)).await?;
        SyncedOrder::from_response(&resp)
    }

    /// Recent server orders for local replication.
    pub async fn fetch_recent(&self, limit: usize) -> Result<Vec<Value>, ApiError> {
        let path = format!("/api/orders/search?page=1&limit={limit}");
        let resp = self.request(Method::GET, &path, None).await?;
        Ok(resp
            .get("orders")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
