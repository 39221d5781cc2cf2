//! Solana native SOL deposit watcher
//!
//! Polls `getSignaturesForAddress` at `confirmed` commitment and decodes each
//! new signature from the pre/post lamport balances of the deposit account.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ChainWatcher, SeenCache};
use crate::address::validate_solana_address;
use crate::backoff::BackoffPolicy;
use crate::error::RpcError;
use crate::rpc::{RpcClient, RpcEndpointConfig};
use crate::types::{Chain, TransferEvent};

const LAMPORT_DECIMALS: u32 = 9;
const SEEN_CAPACITY: usize = 1_024;

fn default_initial_scan_limit() -> usize {
    10
}
fn default_poll_limit() -> usize {
    5
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_commitment() -> String {
    "confirmed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaWatcherConfig {
    pub name: Option<String>,
    #[serde(flatten)]
    pub rpc: RpcEndpointConfig,
    pub deposit_address: String,
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_initial_scan_limit")]
    pub initial_scan_limit: usize,
    #[serde(default = "default_poll_limit")]
    pub poll_limit: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl SolanaWatcherConfig {
    pub fn defaults() -> Self {
        Self {
            name: None,
            rpc: RpcEndpointConfig::new(""),
            deposit_address: String::new(),
            commitment: default_commitment(),
            initial_scan_limit: default_initial_scan_limit(),
            poll_limit: default_poll_limit(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rpc.rpc_url.trim().is_empty() {
            return Err("rpc_url is empty".to_string());
        }
        validate_solana_address(&self.deposit_address)?;
        if !matches!(self.commitment.as_str(), "confirmed" | "finalized") {
            return Err(format!("unsupported commitment '{}'", self.commitment));
        }
        Ok(())
    }
}

pub struct SolanaWatcher {
    name: String,
    cfg: SolanaWatcherConfig,
    client: RpcClient,
    seen: SeenCache,
    started: bool,
}

impl SolanaWatcher {
    pub fn new(name: String, cfg: SolanaWatcherConfig, backoff: BackoffPolicy) -> Result<Self, RpcError> {
        let client = RpcClient::from_config(name.clone(), &cfg.rpc, backoff)?;
        Ok(Self {
            name,
            cfg,
            client,
            seen: SeenCache::new(SEEN_CAPACITY),
            started: false,
        })
    }
}

#[async_trait]
impl ChainWatcher for SolanaWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn deposit_address(&self) -> &str {
        &self.cfg.deposit_address
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs.max(1))
    }

    async fn poll(&mut self) -> Result<Vec<TransferEvent>, RpcError> {
        let limit = if self.started {
            self.cfg.poll_limit
        } else {
            self.cfg.initial_scan_limit
        };
        let listing = self
            .client
            .call(
                "getSignaturesForAddress",
                json!([self.cfg.deposit_address, {"limit": limit, "commitment": self.cfg.commitment}]),
            )
            .await?;

        // a signature enters the seen-set only once its outcome is final
        let mut events = Vec::new();
        let mut complete = true;
        // newest first on the wire; hand over oldest first
        for signature in new_signatures(&listing, &self.seen)?.into_iter().rev() {
            let fetched = self
                .client
                .call(
                    "getTransaction",
                    json!([signature, {
                        "encoding": "jsonParsed",
                        "commitment": self.cfg.commitment,
                        "maxSupportedTransactionVersion": 0
                    }]),
                )
                .await;
            let tx = match fetched {
                Ok(tx) => tx,
                Err(e) if events.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(watcher = %self.name, tx = %signature, "[WATCHER] Poll cut short, retrying from here: {}", e);
                    complete = false;
                    break;
                }
            };
            if tx.is_null() {
                // listed before the node can serve it; retry next poll
                continue;
            }
            match decode_transfer(&signature, &tx, &self.cfg.deposit_address) {
                Ok(Some(event)) => {
                    tracing::info!(
                        chain = %Chain::Solana,
                        tx = %event.tx_ref,
                        from = %event.from_address,
                        amount = %event.amount,
                        "[WATCHER] Deposit confirmed"
                    );
                    events.push(event);
                }
                Ok(None) => tracing::debug!(watcher = %self.name, tx = %signature, "[WATCHER] Not an incoming transfer"),
                Err(e) => {
                    tracing::warn!(watcher = %self.name, tx = %signature, "[WATCHER] Skipping undecodable transaction: {}", e)
                }
            }
            self.seen.insert(signature);
        }
        if complete {
            self.started = true;
        }
        Ok(events)
    }
}

/// Successful signatures from a `getSignaturesForAddress` listing that the
/// cache has not seen, in listing order
pub fn new_signatures(listing: &Value, seen: &SeenCache) -> Result<Vec<String>, RpcError> {
    let entries = listing
        .as_array()
        .ok_or_else(|| RpcError::Decode("signature listing is not an array".to_string()))?;
    Ok(entries
        .iter()
        .filter(|e| e.get("err").map_or(true, Value::is_null))
        .filter_map(|e| e.get("signature").and_then(Value::as_str))
        .filter(|s| !seen.contains(s))
        .map(str::to_string)
        .collect())
}

fn account_key(entry: &Value) -> Option<&str> {
    entry
        .as_str()
        .or_else(|| entry.get("pubkey").and_then(Value::as_str))
}

/// Decode the incoming SOL amount for `deposit` from a parsed transaction.
/// `Ok(None)` for failed transactions or ones that did not credit the deposit.
pub fn decode_transfer(signature: &str, tx: &Value, deposit: &str) -> Result<Option<TransferEvent>, RpcError> {
    let meta = tx
        .get("meta")
        .ok_or_else(|| RpcError::Decode("transaction has no meta".to_string()))?;
    if meta.get("err").map_or(false, |e| !e.is_null()) {
        return Ok(None);
    }

    let keys: Vec<&str> = tx
        .pointer("/transaction/message/accountKeys")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::Decode("transaction has no account keys".to_string()))?
        .iter()
        .map(|k| account_key(k).unwrap_or(""))
        .collect();
    let balances = |field: &str| -> Result<Vec<i128>, RpcError> {
        meta.get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::Decode(format!("meta has no {}", field)))?
            .iter()
            .map(|b| {
                b.as_u64()
                    .map(i128::from)
                    .ok_or_else(|| RpcError::Decode(format!("bad lamport balance {}", b)))
            })
            .collect()
    };
    let pre = balances("preBalances")?;
    let post = balances("postBalances")?;
    if pre.len() != post.len() || pre.len() < keys.len() {
        return Err(RpcError::Decode("balance arrays do not match account keys".to_string()));
    }

    let Some(ours) = keys.iter().position(|k| *k == deposit) else {
        return Ok(None);
    };
    let delta = post[ours] - pre[ours];
    if delta <= 0 {
        return Ok(None);
    }

    let from = (0..keys.len())
        .find(|&i| i != ours && post[i] < pre[i])
        .map(|i| keys[i].to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let amount = Decimal::try_from_i128_with_scale(delta, LAMPORT_DECIMALS)
        .map_err(|e| RpcError::Decode(format!("lamport delta out of range: {}", e)))?
        .normalize();

    Ok(Some(TransferEvent {
        tx_ref: signature.to_string(),
        chain: Chain::Solana,
        from_address: from,
        to_address: deposit.to_string(),
        amount,
    }))
}
