//! Chain RPC client with endpoint failover and backoff
//!
//! Speaks JSON-RPC 2.0 (EVM, Solana) and plain REST GETs (Esplora-style
//! Bitcoin APIs). Each attempt walks the endpoint list in order; a full pass
//! that only hit transient failures is retried under the shared backoff
//! policy.

use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::RpcError;

/// Endpoint configuration for one chain
#[derive(Clone, Deserialize)]
pub struct RpcEndpointConfig {
    pub rpc_url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl fmt::Debug for RpcEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcEndpointConfig")
            .field("rpc_url", &redact_url(&self.rpc_url))
            .field("fallback_urls", &self.fallback_urls.iter().map(|u| redact_url(u)).collect::<Vec<_>>())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl RpcEndpointConfig {
    /// Single endpoint with default timeout and retries
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            fallback_urls: Vec::new(),
            username: None,
            password: None,
            timeout_ms: None,
            max_retries: None,
        }
    }
}

/// Strip credentials and query strings (API keys) from a URL for logging
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut u) => {
            let _ = u.set_password(None);
            let _ = u.set_username("");
            u.set_query(None);
            // path segments often carry provider API keys
            if u.path().len() > 1 {
                u.set_path("/***");
            }
            u.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

pub struct RpcClient {
    label: String,
    endpoints: Vec<String>,
    http: Client,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("label", &self.label)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl RpcClient {
    pub fn from_config(
        label: impl Into<String>,
        cfg: &RpcEndpointConfig,
        backoff: BackoffPolicy,
    ) -> Result<Self, RpcError> {
        let endpoints: Vec<String> = std::iter::once(&cfg.rpc_url)
            .chain(cfg.fallback_urls.iter())
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints);
        }

        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms.unwrap_or(8_000)))
            .build()
            .map_err(|source| RpcError::Transport {
                endpoint: redact_url(&endpoints[0]),
                source,
            })?;

        Ok(Self {
            label: label.into(),
            endpoints,
            http,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            max_retries: cfg.max_retries.unwrap_or(3),
            backoff,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match (&self.username, &self.password) {
            (Some(user), pass) => req.basic_auth(user, pass.as_ref()),
            _ => req,
        }
    }

    /// JSON-RPC call, returning `result`
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let label = format!("{} {}", self.label, method);
        let body = &body;
        self.backoff
            .retry(&label, self.max_retries + 1, move || async move {
                self.each_endpoint(move |url| self.http.post(url).json(body))
                    .await
                    .and_then(unwrap_jsonrpc)
            })
            .await
    }

    /// REST GET of `path` relative to the endpoint base
    pub async fn get(&self, path: &str) -> Result<serde_json::Value, RpcError> {
        let label = format!("{} GET {}", self.label, path);
        let path = path.trim_start_matches('/');
        self.backoff
            .retry(&label, self.max_retries + 1, move || {
                self.each_endpoint(move |base| self.http.get(format!("{}/{}", base, path)))
            })
            .await
    }

    /// One pass over the endpoint list; first success wins. A permanent error
    /// stops the pass, otherwise the last transient error is returned.
    async fn each_endpoint<F>(&self, build: F) -> Result<serde_json::Value, RpcError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut last_err = RpcError::NoEndpoints;
        for (i, url) in self.endpoints.iter().enumerate() {
            let endpoint = redact_url(url);
            match self.send(build(url), &endpoint).await {
                Ok(v) => {
                    if i > 0 {
                        tracing::info!(chain = %self.label, endpoint = %endpoint, "[RPC] Fallback endpoint answered");
                    }
                    return Ok(v);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(chain = %self.label, endpoint = %endpoint, "[RPC] Endpoint failed: {}", e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn send(&self, req: RequestBuilder, endpoint: &str) -> Result<serde_json::Value, RpcError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(RpcError::RateLimited {
                endpoint: endpoint.to_string(),
            });
        }
        if !status.is_success() {
            return Err(RpcError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Split a JSON-RPC envelope into result or error. Provider rate limits
/// reported inside the envelope (code 429 / -32005) stay transient.
pub fn unwrap_jsonrpc(envelope: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
        let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        if code == 429 || code == -32005 {
            return Err(RpcError::RateLimited { endpoint: message });
        }
        return Err(RpcError::JsonRpc { code, message });
    }
    match envelope.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcError::Decode("response has neither result nor error".to_string())),
    }
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_hex_u64(value: &serde_json::Value) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected hex string, got {}", value)))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(if digits.is_empty() { "0" } else { digits }, 16)
        .map_err(|e| RpcError::Decode(format!("bad hex quantity {}: {}", s, e)))
}
