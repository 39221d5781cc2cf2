//! Bitcoin deposit watcher over an Esplora-compatible REST API
//! (mempool.space, blockstream.info or a self-hosted electrs)

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{ChainWatcher, SeenCache};
use crate::address::validate_btc_address;
use crate::backoff::BackoffPolicy;
use crate::error::RpcError;
use crate::rpc::{RpcClient, RpcEndpointConfig};
use crate::types::{Chain, TransferEvent};

const SATS_DECIMALS: u32 = 8;
const SEEN_CAPACITY: usize = 1_024;

fn default_confirmations() -> u64 {
    3
}
fn default_poll_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinWatcherConfig {
    pub name: Option<String>,
    /// Esplora base URL, e.g. https://mempool.space/api
    #[serde(flatten)]
    pub rpc: RpcEndpointConfig,
    pub deposit_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl BitcoinWatcherConfig {
    pub fn defaults() -> Self {
        Self {
            name: None,
            rpc: RpcEndpointConfig::new(""),
            deposit_address: String::new(),
            confirmations: default_confirmations(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rpc.rpc_url.trim().is_empty() {
            return Err("rpc_url is empty".to_string());
        }
        validate_btc_address(&self.deposit_address)?;
        if self.confirmations == 0 {
            return Err("confirmations must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct BitcoinWatcher {
    name: String,
    cfg: BitcoinWatcherConfig,
    client: RpcClient,
    seen: SeenCache,
}

impl BitcoinWatcher {
    pub fn new(name: String, cfg: BitcoinWatcherConfig, backoff: BackoffPolicy) -> Result<Self, RpcError> {
        let client = RpcClient::from_config(name.clone(), &cfg.rpc, backoff)?;
        Ok(Self {
            name,
            cfg,
            client,
            seen: SeenCache::new(SEEN_CAPACITY),
        })
    }
}

#[async_trait]
impl ChainWatcher for BitcoinWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    fn deposit_address(&self) -> &str {
        &self.cfg.deposit_address
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs.max(1))
    }

    async fn poll(&mut self) -> Result<Vec<TransferEvent>, RpcError> {
        let tip = self
            .client
            .get("blocks/tip/height")
            .await?
            .as_u64()
            .ok_or_else(|| RpcError::Decode("tip height is not a number".to_string()))?;
        let txs = self
            .client
            .get(&format!("address/{}/txs", self.cfg.deposit_address))
            .await?;

        let mut events = confirmed_deposits(&txs, &self.cfg.deposit_address, tip, self.cfg.confirmations)?;
        events.retain(|e| !self.seen.contains(&e.tx_ref));
        // API lists newest first
        events.reverse();
        for event in &events {
            tracing::info!(
                chain = %Chain::Bitcoin,
                tx = %event.tx_ref,
                from = %event.from_address,
                amount = %event.amount,
                "[WATCHER] Deposit confirmed"
            );
            self.seen.insert(event.tx_ref.clone());
        }
        Ok(events)
    }
}

pub fn confirmations_at(tip: u64, block_height: u64) -> u64 {
    (tip + 1).saturating_sub(block_height)
}

/// Transactions paying `deposit` with at least `required` confirmations.
/// Several outputs to the deposit address in one transaction are summed.
/// An entry that cannot be decoded is logged and skipped.
pub fn confirmed_deposits(
    txs: &Value,
    deposit: &str,
    tip: u64,
    required: u64,
) -> Result<Vec<TransferEvent>, RpcError> {
    let list = txs
        .as_array()
        .ok_or_else(|| RpcError::Decode("address history is not an array".to_string()))?;

    let mut out = Vec::new();
    for tx in list {
        let confirmed = tx.pointer("/status/confirmed").and_then(Value::as_bool).unwrap_or(false);
        let Some(height) = tx.pointer("/status/block_height").and_then(Value::as_u64) else {
            continue;
        };
        if !confirmed || confirmations_at(tip, height) < required {
            continue;
        }
        match decode_deposit(tx, deposit) {
            Ok(Some(event)) => out.push(event),
            Ok(None) => {}
            Err(e) => {
                let txid = tx.get("txid").and_then(Value::as_str).unwrap_or("?");
                tracing::warn!(chain = %Chain::Bitcoin, tx = %txid, "[WATCHER] Skipping undecodable transaction: {}", e);
            }
        }
    }
    Ok(out)
}

fn decode_deposit(tx: &Value, deposit: &str) -> Result<Option<TransferEvent>, RpcError> {
    let txid = tx
        .get("txid")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Decode("transaction without txid".to_string()))?;

    let mut sats: i128 = 0;
    for vout in tx.get("vout").and_then(Value::as_array).into_iter().flatten() {
        if vout.get("scriptpubkey_address").and_then(Value::as_str) == Some(deposit) {
            sats += vout
                .get("value")
                .and_then(Value::as_u64)
                .map(i128::from)
                .ok_or_else(|| RpcError::Decode(format!("bad output value in {}", txid)))?;
        }
    }
    if sats <= 0 {
        return Ok(None); // spend from the deposit address
    }

    let from = tx
        .pointer("/vin/0/prevout/scriptpubkey_address")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let amount = Decimal::try_from_i128_with_scale(sats, SATS_DECIMALS)
        .map_err(|e| RpcError::Decode(format!("output sum out of range: {}", e)))?
        .normalize();
    Ok(Some(TransferEvent {
        tx_ref: txid.to_ascii_lowercase(),
        chain: Chain::Bitcoin,
        from_address: from.to_string(),
        to_address: deposit.to_string(),
        amount,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEPOSIT: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
    const SENDER: &str = "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh";

    fn history() -> Value {
        json!([
            {
                "txid": "CC03",
                "status": {"confirmed": false},
                "vin": [{"prevout": {"scriptpubkey_address": SENDER, "value": 9000}}],
                "vout": [{"scriptpubkey_address": DEPOSIT, "value": 5000}]
            },
            {
                "txid": "bb02",
                "status": {"confirmed": true, "block_height": 849_999},
                "vin": [{"prevout": {"scriptpubkey_address": SENDER, "value": 200_000_000}}],
                "vout": [
                    {"scriptpubkey_address": DEPOSIT, "value": 100_000_000},
                    {"scriptpubkey_address": DEPOSIT, "value": 50_000_000},
                    {"scriptpubkey_address": SENDER, "value": 49_990_000}
                ]
            },
            {
                "txid": "aa01",
                "status": {"confirmed": true, "block_height": 849_000},
                "vin": [{"prevout": {"scriptpubkey_address": DEPOSIT, "value": 150_000_000}}],
                "vout": [{"scriptpubkey_address": SENDER, "value": 149_990_000}]
            }
        ])
    }

    #[test]
    fn test_confirmed_deposits() {
        // 849_999 has 2 confirmations at tip 850_000
        assert!(confirmed_deposits(&history(), DEPOSIT, 850_000, 3).unwrap().is_empty());

        let events = confirmed_deposits(&history(), DEPOSIT, 850_001, 3).unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.tx_ref, "bb02");
        assert_eq!(e.amount.to_string(), "1.5");
        assert_eq!(e.from_address, SENDER);
        assert_eq!(e.chain, Chain::Bitcoin);
    }

    #[test]
    fn test_confirmations_at() {
        assert_eq!(confirmations_at(100, 100), 1);
        assert_eq!(confirmations_at(100, 98), 3);
        assert_eq!(confirmations_at(100, 150), 0);
    }

    #[test]
    fn test_malformed_history() {
        assert!(confirmed_deposits(&json!({"error": "x"}), DEPOSIT, 1, 1).is_err());
        let no_txid = json!([{"status": {"confirmed": true, "block_height": 1}, "vout": []}]);
        assert!(confirmed_deposits(&no_txid, DEPOSIT, 10, 1).unwrap().is_empty());
    }

    fn with_bad_entries() -> Value {
        let mut txs = history();
        let list = txs.as_array_mut().unwrap();
        list.insert(
            0,
            json!({
                "txid": "dd04",
                "status": {"confirmed": true, "block_height": 849_998},
                "vout": [{"scriptpubkey_address": DEPOSIT, "value": "lots"}]
            }),
        );
        list.insert(
            0,
            json!({
                "status": {"confirmed": true, "block_height": 849_998},
                "vout": [{"scriptpubkey_address": DEPOSIT, "value": 1_000}]
            }),
        );
        txs
    }

    #[test]
    fn test_bad_entry_does_not_hide_deposits() {
        let events = confirmed_deposits(&with_bad_entries(), DEPOSIT, 850_001, 3).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_ref, "bb02");
    }

    #[tokio::test]
    async fn test_poll_against_esplora() {
        use crate::test_utils::{fast_backoff, mock_endpoint, spawn_mock_rpc};

        let history_path = format!("/address/{}/txs", DEPOSIT);
        let url = spawn_mock_rpc(move |path, _| match path {
            "/blocks/tip/height" => Some(json!(850_001)),
            p if p == history_path => Some(with_bad_entries()),
            _ => None,
        })
        .await;
        let cfg = BitcoinWatcherConfig {
            rpc: mock_endpoint(&url),
            deposit_address: DEPOSIT.to_string(),
            ..BitcoinWatcherConfig::defaults()
        };
        let mut w = BitcoinWatcher::new("bitcoin".to_string(), cfg, fast_backoff()).unwrap();

        let events = w.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount.to_string(), "1.5");
        assert!(w.poll().await.unwrap().is_empty());
    }
}
