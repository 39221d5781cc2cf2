//! EVM native-coin deposit watcher (Ethereum, Base, BNB)
//!
//! Walks blocks up to `latest + 1 - confirmations` with full transaction
//! bodies, keeps plain value transfers to the deposit address and checks the
//! receipt succeeded before handing them over.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::ChainWatcher;
use crate::address::validate_evm_address;
use crate::backoff::BackoffPolicy;
use crate::error::RpcError;
use crate::rpc::{parse_hex_u64, RpcClient, RpcEndpointConfig};
use crate::types::{Chain, TransferEvent};

const WEI_DECIMALS: u32 = 18;

fn default_confirmations() -> u64 {
    3
}
fn default_catchup_blocks() -> u64 {
    10
}
fn default_max_blocks_per_poll() -> u64 {
    20
}
fn default_poll_interval_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmWatcherConfig {
    pub name: Option<String>,
    pub chain: Chain,
    /// Checked against `eth_chainId` on the first poll when set
    pub chain_id: Option<u64>,
    #[serde(flatten)]
    pub rpc: RpcEndpointConfig,
    pub deposit_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Blocks behind the safe tip scanned on startup
    #[serde(default = "default_catchup_blocks")]
    pub catchup_blocks: u64,
    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl EvmWatcherConfig {
    /// Default tuning for `chain`; endpoint and deposit address left empty
    pub fn defaults(chain: Chain) -> Self {
        Self {
            name: None,
            chain,
            chain_id: None,
            rpc: RpcEndpointConfig::new(""),
            deposit_address: String::new(),
            confirmations: default_confirmations(),
            catchup_blocks: default_catchup_blocks(),
            max_blocks_per_poll: default_max_blocks_per_poll(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.chain.is_evm() {
            return Err(format!("{} is not an EVM chain", self.chain));
        }
        if self.rpc.rpc_url.trim().is_empty() {
            return Err("rpc_url is empty".to_string());
        }
        validate_evm_address(&self.deposit_address)?;
        if self.confirmations == 0 {
            return Err("confirmations must be at least 1".to_string());
        }
        if self.max_blocks_per_poll == 0 {
            return Err("max_blocks_per_poll must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct EvmWatcher {
    name: String,
    cfg: EvmWatcherConfig,
    client: RpcClient,
    deposit: String,
    next_block: Option<u64>,
    chain_checked: bool,
}

impl EvmWatcher {
    pub fn new(name: String, cfg: EvmWatcherConfig, backoff: BackoffPolicy) -> Result<Self, RpcError> {
        let client = RpcClient::from_config(name.clone(), &cfg.rpc, backoff)?;
        let deposit = cfg.deposit_address.trim().to_ascii_lowercase();
        Ok(Self {
            name,
            cfg,
            client,
            deposit,
            next_block: None,
            chain_checked: false,
        })
    }

    async fn verify_chain_id(&mut self) -> Result<(), RpcError> {
        if self.chain_checked {
            return Ok(());
        }
        if let Some(expected) = self.cfg.chain_id {
            let got = parse_hex_u64(&self.client.call("eth_chainId", json!([])).await?)?;
            if got != expected {
                return Err(RpcError::Decode(format!(
                    "endpoint reports chain id {} but {} expects {}",
                    got, self.name, expected
                )));
            }
        }
        self.chain_checked = true;
        Ok(())
    }

    /// Successful deposits in block `number`, or `None` when the endpoint
    /// cannot serve the block or one of its receipts yet. Only transport and
    /// block-level errors are returned; a bad transaction is skipped.
    async fn scan_block(&self, number: u64) -> Result<Option<Vec<TransferEvent>>, RpcError> {
        let block = self
            .client
            .call("eth_getBlockByNumber", json!([format!("0x{:x}", number), true]))
            .await?;
        if block.is_null() {
            tracing::debug!(watcher = %self.name, block = number, "[WATCHER] Block not available yet");
            return Ok(None);
        }

        let mut found = Vec::new();
        for candidate in extract_deposits(&block, &self.deposit, self.cfg.chain)? {
            let receipt = self
                .client
                .call("eth_getTransactionReceipt", json!([candidate.tx_ref]))
                .await?;
            match receipt_status(&receipt) {
                Ok(ReceiptStatus::Succeeded) => found.push(candidate),
                Ok(ReceiptStatus::Reverted) => {
                    tracing::info!(chain = %self.cfg.chain, tx = %candidate.tx_ref, "[WATCHER] Skipping reverted transfer");
                }
                Ok(ReceiptStatus::Pending) => {
                    tracing::debug!(
                        watcher = %self.name,
                        block = number,
                        tx = %candidate.tx_ref,
                        "[WATCHER] Receipt not indexed yet"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    tracing::warn!(chain = %self.cfg.chain, tx = %candidate.tx_ref, "[WATCHER] Skipping transfer with bad receipt: {}", e);
                }
            }
        }
        Ok(Some(found))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Succeeded,
    Reverted,
    /// `null` receipt: the endpoint has the block but not the receipt yet
    Pending,
}

pub fn receipt_status(receipt: &Value) -> Result<ReceiptStatus, RpcError> {
    if receipt.is_null() {
        return Ok(ReceiptStatus::Pending);
    }
    let status = receipt
        .get("status")
        .ok_or_else(|| RpcError::Decode("receipt has no status".to_string()))?;
    Ok(if parse_hex_u64(status)? == 1 {
        ReceiptStatus::Succeeded
    } else {
        ReceiptStatus::Reverted
    })
}

#[async_trait]
impl ChainWatcher for EvmWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain(&self) -> Chain {
        self.cfg.chain
    }

    fn deposit_address(&self) -> &str {
        &self.deposit
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs.max(1))
    }

    async fn poll(&mut self) -> Result<Vec<TransferEvent>, RpcError> {
        self.verify_chain_id().await?;

        let latest = parse_hex_u64(&self.client.call("eth_blockNumber", json!([])).await?)?;
        let Some(safe_tip) = safe_tip(latest, self.cfg.confirmations) else {
            return Ok(Vec::new());
        };
        let start = *self
            .next_block
            .get_or_insert_with(|| catchup_start(safe_tip, self.cfg.catchup_blocks));
        if start > safe_tip {
            return Ok(Vec::new());
        }
        let end = safe_tip.min(start + self.cfg.max_blocks_per_poll - 1);

        // the cursor only moves past blocks whose deposits are in `events`
        let mut events = Vec::new();
        for number in start..=end {
            match self.scan_block(number).await {
                Ok(Some(found)) => {
                    events.extend(found);
                    self.next_block = Some(number + 1);
                }
                Ok(None) => break,
                Err(e) if events.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(watcher = %self.name, block = number, "[WATCHER] Poll cut short, resuming at this block: {}", e);
                    break;
                }
            }
        }
        for event in &events {
            tracing::info!(
                chain = %self.cfg.chain,
                tx = %event.tx_ref,
                from = %event.from_address,
                amount = %event.amount,
                "[WATCHER] Deposit confirmed"
            );
        }
        Ok(events)
    }
}

/// Highest block with at least `confirmations` confirmations
pub fn safe_tip(latest: u64, confirmations: u64) -> Option<u64> {
    (latest + 1).checked_sub(confirmations.max(1))
}

pub fn catchup_start(safe_tip: u64, catchup_blocks: u64) -> u64 {
    (safe_tip + 1).saturating_sub(catchup_blocks.max(1))
}

/// Value transfers to `deposit` in a block fetched with full transactions
pub fn extract_deposits(block: &Value, deposit: &str, chain: Chain) -> Result<Vec<TransferEvent>, RpcError> {
    let txs = block
        .get("transactions")
        .and_then(|t| t.as_array())
        .ok_or_else(|| RpcError::Decode("block has no transaction list".to_string()))?;

    let mut out = Vec::new();
    for tx in txs {
        // hash-only entries mean the block was fetched without bodies
        let Some(obj) = tx.as_object() else { continue };
        let Some(to) = obj.get("to").and_then(|v| v.as_str()) else {
            continue; // contract creation
        };
        if !to.eq_ignore_ascii_case(deposit) {
            continue;
        }
        match decode_deposit(obj, deposit, chain) {
            Ok(Some(event)) => out.push(event),
            Ok(None) => {}
            Err(e) => {
                let hash = obj.get("hash").and_then(|v| v.as_str()).unwrap_or("?");
                tracing::warn!(chain = %chain, tx = %hash, "[WATCHER] Skipping undecodable transaction: {}", e);
            }
        }
    }
    Ok(out)
}

fn decode_deposit(
    obj: &serde_json::Map<String, Value>,
    deposit: &str,
    chain: Chain,
) -> Result<Option<TransferEvent>, RpcError> {
    let value = wei_to_native(obj.get("value").unwrap_or(&Value::Null))?;
    if value <= Decimal::ZERO {
        return Ok(None);
    }
    let hash = obj
        .get("hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::Decode("transaction without hash".to_string()))?;
    let from = obj.get("from").and_then(|v| v.as_str()).unwrap_or("unknown");
    Ok(Some(TransferEvent {
        tx_ref: hash.to_ascii_lowercase(),
        chain,
        from_address: from.to_ascii_lowercase(),
        to_address: deposit.to_ascii_lowercase(),
        amount: value,
    }))
}

/// Hex wei quantity to a native-unit decimal
pub fn wei_to_native(value: &Value) -> Result<Decimal, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Decode(format!("expected hex value, got {}", value)))?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let wei = if digits.is_empty() {
        0
    } else {
        u128::from_str_radix(digits, 16).map_err(|e| RpcError::Decode(format!("bad wei value {}: {}", s, e)))?
    };
    let wei = i128::try_from(wei).map_err(|_| RpcError::Decode(format!("wei value {} out of range", s)))?;
    Decimal::try_from_i128_with_scale(wei, WEI_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|e| RpcError::Decode(format!("wei value {} out of range: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_backoff, mock_endpoint, spawn_mock_rpc};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::SeqCst};
    use std::sync::Arc;

    const DEPOSIT: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";
    const SENDER: &str = "0x1111111111111111111111111111111111111111";
    const ONE_ETH: &str = "0xde0b6b3a7640000";

    fn deposit_tx(hash: &str, value: &str) -> Value {
        json!({"hash": hash, "from": SENDER, "to": DEPOSIT, "value": value})
    }

    fn block_of(txs: Vec<Value>) -> Option<Value> {
        Some(json!({ "transactions": txs }))
    }

    fn requested_block(params: &Value) -> u64 {
        parse_hex_u64(&params[0]).unwrap()
    }

    fn refs(events: &[TransferEvent]) -> Vec<&str> {
        events.iter().map(|e| e.tx_ref.as_str()).collect()
    }

    /// One confirmation, catch-up starts one block behind the tip
    fn watcher_at(url: &str) -> EvmWatcher {
        let cfg = EvmWatcherConfig {
            rpc: mock_endpoint(url),
            deposit_address: DEPOSIT.to_string(),
            confirmations: 1,
            catchup_blocks: 2,
            ..EvmWatcherConfig::defaults(Chain::Base)
        };
        EvmWatcher::new("base".to_string(), cfg, fast_backoff()).unwrap()
    }

    #[tokio::test]
    async fn test_failed_block_keeps_earlier_deposits() {
        let latest = Arc::new(AtomicU64::new(16));
        let block16_fetches = Arc::new(AtomicU32::new(0));
        let (tip, fetches) = (latest.clone(), block16_fetches.clone());
        let url = spawn_mock_rpc(move |method, params| match method {
            "eth_blockNumber" => Some(json!(format!("0x{:x}", tip.load(SeqCst)))),
            "eth_getBlockByNumber" => match requested_block(params) {
                15 => block_of(vec![deposit_tx("0xa15", ONE_ETH)]),
                // first answer for 16 is garbage
                16 if fetches.fetch_add(1, SeqCst) == 0 => Some(json!({"number": "0x10"})),
                16 => block_of(vec![deposit_tx("0xa16", ONE_ETH)]),
                _ => block_of(vec![]),
            },
            "eth_getTransactionReceipt" => Some(json!({"status": "0x1"})),
            _ => None,
        })
        .await;
        let mut w = watcher_at(&url);

        let first = w.poll().await.unwrap();
        assert_eq!(refs(&first), vec!["0xa15"]);
        assert_eq!(w.next_block, Some(16));

        let second = w.poll().await.unwrap();
        assert_eq!(refs(&second), vec!["0xa16"]);
        assert!(w.poll().await.unwrap().is_empty());

        latest.store(18, SeqCst);
        assert!(w.poll().await.unwrap().is_empty());
        assert_eq!(w.next_block, Some(19));
        assert_eq!(block16_fetches.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_first_block_is_an_error() {
        let down = Arc::new(AtomicU32::new(1));
        let outage = down.clone();
        let url = spawn_mock_rpc(move |method, params| match method {
            "eth_blockNumber" => Some(json!("0xf")),
            "eth_getBlockByNumber" if outage.load(SeqCst) > 0 => None,
            "eth_getBlockByNumber" if requested_block(params) == 15 => block_of(vec![deposit_tx("0xa15", ONE_ETH)]),
            "eth_getBlockByNumber" => block_of(vec![]),
            "eth_getTransactionReceipt" => Some(json!({"status": "0x1"})),
            _ => None,
        })
        .await;
        let mut w = watcher_at(&url);

        assert!(w.poll().await.unwrap_err().is_transient());
        assert_eq!(w.next_block, Some(14));

        down.store(0, SeqCst);
        assert_eq!(refs(&w.poll().await.unwrap()), vec!["0xa15"]);
        assert_eq!(w.next_block, Some(16));
    }

    #[tokio::test]
    async fn test_undecodable_transaction_is_skipped() {
        let url = spawn_mock_rpc(|method, params| match method {
            "eth_blockNumber" => Some(json!("0x10")),
            "eth_getBlockByNumber" => match requested_block(params) {
                15 => block_of(vec![deposit_tx("0xbad", "0xZZ"), deposit_tx("0xa15", ONE_ETH)]),
                16 => block_of(vec![deposit_tx("0xa16", ONE_ETH)]),
                _ => block_of(vec![]),
            },
            "eth_getTransactionReceipt" => Some(json!({"status": "0x1"})),
            _ => None,
        })
        .await;
        let mut w = watcher_at(&url);

        let events = w.poll().await.unwrap();
        assert_eq!(refs(&events), vec!["0xa15", "0xa16"]);
        assert_eq!(w.next_block, Some(17));
    }

    #[tokio::test]
    async fn test_missing_receipt_holds_the_block() {
        let receipt_asks = Arc::new(AtomicU32::new(0));
        let asks = receipt_asks.clone();
        let url = spawn_mock_rpc(move |method, params| match method {
            "eth_blockNumber" => Some(json!("0xf")),
            "eth_getBlockByNumber" if requested_block(params) == 15 => {
                block_of(vec![deposit_tx("0xa15", ONE_ETH), deposit_tx("0xdead", ONE_ETH)])
            }
            "eth_getBlockByNumber" => block_of(vec![]),
            "eth_getTransactionReceipt" => match params[0].as_str() {
                Some("0xa15") if asks.fetch_add(1, SeqCst) == 0 => Some(Value::Null),
                Some("0xa15") => Some(json!({"status": "0x1"})),
                _ => Some(json!({"status": "0x0"})),
            },
            _ => None,
        })
        .await;
        let mut w = watcher_at(&url);

        // block 14 is done, 15 waits for its receipt
        assert!(w.poll().await.unwrap().is_empty());
        assert_eq!(w.next_block, Some(15));

        // reverted 0xdead is dropped
        assert_eq!(refs(&w.poll().await.unwrap()), vec!["0xa15"]);
        assert_eq!(w.next_block, Some(16));
    }

    #[tokio::test]
    async fn test_null_block_stops_the_scan() {
        let url = spawn_mock_rpc(|method, params| match method {
            "eth_blockNumber" => Some(json!("0x10")),
            "eth_getBlockByNumber" => match requested_block(params) {
                15 => block_of(vec![deposit_tx("0xa15", ONE_ETH)]),
                _ => Some(Value::Null),
            },
            "eth_getTransactionReceipt" => Some(json!({"status": "0x1"})),
            _ => None,
        })
        .await;
        let mut w = watcher_at(&url);

        assert_eq!(refs(&w.poll().await.unwrap()), vec!["0xa15"]);
        assert_eq!(w.next_block, Some(16));
        assert!(w.poll().await.unwrap().is_empty());
        assert_eq!(w.next_block, Some(16));
    }

    #[test]
    fn test_receipt_status() {
        assert_eq!(receipt_status(&json!({"status": "0x1"})).unwrap(), ReceiptStatus::Succeeded);
        assert_eq!(receipt_status(&json!({"status": "0x0"})).unwrap(), ReceiptStatus::Reverted);
        assert_eq!(receipt_status(&Value::Null).unwrap(), ReceiptStatus::Pending);
        assert!(receipt_status(&json!({"status": "0xzz"})).is_err());
    }

    fn block_fixture() -> Value {
        json!({
            "number": "0x1b4",
            "transactions": [
                {
                    "hash": "0xAAA1",
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x742d35Cc6634C0532925a3b844Bc454e4438f44e",
                    "value": "0xde0b6b3a7640000"
                },
                {
                    "hash": "0xaaa2",
                    "from": "0x2222222222222222222222222222222222222222",
                    "to": "0x9999999999999999999999999999999999999999",
                    "value": "0x1"
                },
                {
                    "hash": "0xaaa3",
                    "from": "0x3333333333333333333333333333333333333333",
                    "to": null,
                    "value": "0x0"
                },
                {
                    "hash": "0xaaa4",
                    "from": "0x4444444444444444444444444444444444444444",
                    "to": DEPOSIT,
                    "value": "0x0"
                }
            ]
        })
    }

    #[test]
    fn test_extract_deposits() {
        let events = extract_deposits(&block_fixture(), DEPOSIT, Chain::Base).unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.tx_ref, "0xaaa1");
        assert_eq!(e.chain, Chain::Base);
        assert_eq!(e.from_address, "0x1111111111111111111111111111111111111111");
        assert_eq!(e.to_address, DEPOSIT);
        assert_eq!(e.amount, Decimal::ONE);
    }

    #[test]
    fn test_hash_only_block_yields_nothing() {
        let block = json!({"transactions": ["0xaaa1", "0xaaa2"]});
        assert!(extract_deposits(&block, DEPOSIT, Chain::Ethereum).unwrap().is_empty());
        assert!(extract_deposits(&json!({}), DEPOSIT, Chain::Ethereum).is_err());
    }

    #[test]
    fn test_bad_transaction_does_not_spoil_the_block() {
        let block = json!({"transactions": [
            deposit_tx("0xbad", "0xZZ"),
            {"from": SENDER, "to": DEPOSIT, "value": ONE_ETH},
            deposit_tx("0xgood", ONE_ETH)
        ]});
        let events = extract_deposits(&block, DEPOSIT, Chain::Base).unwrap();
        assert_eq!(refs(&events), vec!["0xgood"]);
    }

    #[test]
    fn test_wei_to_native() {
        assert_eq!(wei_to_native(&json!("0x0")).unwrap(), Decimal::ZERO);
        assert_eq!(wei_to_native(&json!("0x1")).unwrap().to_string(), "0.000000000000000001");
        // 1.5 ETH
        assert_eq!(wei_to_native(&json!("0x14d1120d7b160000")).unwrap().to_string(), "1.5");
        assert!(wei_to_native(&json!(5)).is_err());
        assert!(wei_to_native(&json!("0xffffffffffffffffffffffffffffffff")).is_err());
    }

    #[test]
    fn test_confirmation_window() {
        assert_eq!(safe_tip(100, 3), Some(98));
        assert_eq!(safe_tip(1, 3), None);
        assert_eq!(safe_tip(2, 3), Some(0));
        assert_eq!(catchup_start(98, 10), 89);
        assert_eq!(catchup_start(4, 10), 0);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg: EvmWatcherConfig = toml::from_str(&format!(
            r#"
            chain = "bnb"
            rpc_url = "https://bsc-dataseed.binance.org"
            deposit_address = "{}"
            "#,
            DEPOSIT
        ))
        .unwrap();
        assert_eq!(cfg.confirmations, 3);
        assert!(cfg.validate().is_ok());

        cfg.chain = Chain::Solana;
        assert!(cfg.validate().is_err());
        cfg.chain = Chain::Bnb;
        cfg.deposit_address = "0x123".to_string();
        assert!(cfg.validate().is_err());
    }
}
