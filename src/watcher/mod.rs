//! Chain watchers
//!
//! Every watcher observes one `(chain, deposit address)` pair and yields
//! confirmed transfers. Delivery is at-least-once: a watcher may hand the
//! same transfer over again after a restart or an overlapping poll, and the
//! ledger drops the duplicate.
//!
//! ```text
//!   EvmWatcher ─┐
//!   SolWatcher ─┼─► run_watcher ─► mpsc<TransferEvent> ─► Orchestrator
//!   BtcWatcher ─┘     (poll, backoff, shutdown)
//! ```

pub mod bitcoin;
pub mod evm;
pub mod solana;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, RpcError};
use crate::types::{Chain, TransferEvent};

#[async_trait]
pub trait ChainWatcher: Send {
    /// Log label, e.g. "base" or "solana-main"
    fn name(&self) -> &str;
    fn chain(&self) -> Chain;
    fn deposit_address(&self) -> &str;
    fn poll_interval(&self) -> Duration;

    /// Fetch transfers that reached the confirmation threshold since the last
    /// poll. The first poll after construction also covers a bounded window of
    /// recent history.
    async fn poll(&mut self) -> Result<Vec<TransferEvent>, RpcError>;
}

/// Per-watcher configuration, tagged by `kind`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WatcherConfig {
    Evm(evm::EvmWatcherConfig),
    Solana(solana::SolanaWatcherConfig),
    Bitcoin(bitcoin::BitcoinWatcherConfig),
}

impl WatcherConfig {
    pub fn name(&self) -> String {
        match self {
            WatcherConfig::Evm(c) => c.name.clone().unwrap_or_else(|| c.chain.to_string()),
            WatcherConfig::Solana(c) => c.name.clone().unwrap_or_else(|| "solana".to_string()),
            WatcherConfig::Bitcoin(c) => c.name.clone().unwrap_or_else(|| "bitcoin".to_string()),
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            WatcherConfig::Evm(c) => c.chain,
            WatcherConfig::Solana(_) => Chain::Solana,
            WatcherConfig::Bitcoin(_) => Chain::Bitcoin,
        }
    }

    pub fn deposit_address(&self) -> &str {
        match self {
            WatcherConfig::Evm(c) => &c.deposit_address,
            WatcherConfig::Solana(c) => &c.deposit_address,
            WatcherConfig::Bitcoin(c) => &c.deposit_address,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name();
        let reason = match self {
            WatcherConfig::Evm(c) => c.validate().err(),
            WatcherConfig::Solana(c) => c.validate().err(),
            WatcherConfig::Bitcoin(c) => c.validate().err(),
        };
        match reason {
            Some(reason) => Err(ConfigError::Watcher { name, reason }),
            None => Ok(()),
        }
    }

    pub fn build(&self, backoff: BackoffPolicy) -> Result<Box<dyn ChainWatcher>, ConfigError> {
        self.validate()?;
        let name = self.name();
        let wrap = |e: RpcError| ConfigError::Watcher {
            name: name.clone(),
            reason: e.to_string(),
        };
        Ok(match self {
            WatcherConfig::Evm(c) => Box::new(evm::EvmWatcher::new(name.clone(), c.clone(), backoff).map_err(wrap)?),
            WatcherConfig::Solana(c) => {
                Box::new(solana::SolanaWatcher::new(name.clone(), c.clone(), backoff).map_err(wrap)?)
            }
            WatcherConfig::Bitcoin(c) => {
                Box::new(bitcoin::BitcoinWatcher::new(name.clone(), c.clone(), backoff).map_err(wrap)?)
            }
        })
    }
}

/// Bounded set of recently seen transaction refs (poll-overlap filter only;
/// the ledger is the authority on duplicates)
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    pub fn insert(&mut self, key: String) {
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Drive one watcher until shutdown or until the receiving side goes away.
/// Poll failures never end the loop; they back off and try again.
pub async fn run_watcher(
    mut watcher: Box<dyn ChainWatcher>,
    events: mpsc::Sender<TransferEvent>,
    backoff: BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = watcher.name().to_string();
    tracing::info!(
        watcher = %name,
        chain = %watcher.chain(),
        address = %watcher.deposit_address(),
        "[WATCHER] Started"
    );

    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match watcher.poll().await {
            Ok(batch) => {
                if failures > 0 {
                    tracing::info!(watcher = %name, "[WATCHER] Recovered after {} failed polls", failures);
                }
                failures = 0;
                if !batch.is_empty() {
                    tracing::debug!(watcher = %name, count = batch.len(), "[WATCHER] Confirmed transfers");
                }
                for event in batch {
                    if events.send(event).await.is_err() {
                        tracing::info!(watcher = %name, "[WATCHER] Event channel closed, stopping");
                        return;
                    }
                }
                watcher.poll_interval()
            }
            Err(e) => {
                let delay = backoff.delay(failures);
                failures = failures.saturating_add(1);
                tracing::warn!(
                    watcher = %name,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "[WATCHER] Poll failed: {}",
                    e
                );
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!(watcher = %name, "[WATCHER] Stopped");
}

pub fn spawn_watcher(
    watcher: Box<dyn ChainWatcher>,
    events: mpsc::Sender<TransferEvent>,
    backoff: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_watcher(watcher, events, backoff, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails twice, then yields the same transfer on every poll
    struct Flaky {
        polls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ChainWatcher for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn chain(&self) -> Chain {
            Chain::Base
        }
        fn deposit_address(&self) -> &str {
            "0x00000000000000000000000000000000000000bb"
        }
        fn poll_interval(&self) -> Duration {
            Duration::from_millis(1)
        }
        async fn poll(&mut self) -> Result<Vec<TransferEvent>, RpcError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                return Err(RpcError::RateLimited { endpoint: "test".into() });
            }
            Ok(vec![TransferEvent {
                tx_ref: "0xabc".into(),
                chain: Chain::Base,
                from_address: "0x00000000000000000000000000000000000000aa".into(),
                to_address: self.deposit_address().into(),
                amount: Decimal::ONE,
            }])
        }
    }

    #[test]
    fn test_seen_cache_is_bounded() {
        let mut cache = SeenCache::new(2);
        cache.insert("a".into());
        cache.insert("b".into());
        cache.insert("b".into());
        assert_eq!(cache.len(), 2);
        cache.insert("c".into());
        assert!(!cache.contains("a"));
        assert!(cache.contains("b") && cache.contains("c"));
    }

    #[tokio::test]
    async fn test_runner_survives_errors_and_stops_on_shutdown() {
        let polls = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let backoff = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 0.0);

        let handle = spawn_watcher(Box::new(Flaky { polls: polls.clone() }), tx, backoff, stop_rx);

        // redelivery is expected; the consumer dedups
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, second);
        assert!(polls.load(Ordering::SeqCst) >= 3);

        stop_tx.send(true).unwrap();
        while rx.recv().await.is_some() {}
        handle.await.unwrap();
    }

    #[test]
    fn test_tagged_config() {
        let cfg: WatcherConfig = toml::from_str(
            r#"
            kind = "evm"
            chain = "base"
            chain_id = 8453
            rpc_url = "https://mainnet.base.org"
            deposit_address = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.chain(), Chain::Base);
        assert_eq!(cfg.name(), "base");
        assert!(cfg.validate().is_ok());

        let bad: WatcherConfig = toml::from_str(
            r#"
            kind = "solana"
            rpc_url = "https://api.mainnet-beta.solana.com"
            deposit_address = "0xnot-solana"
            "#,
        )
        .unwrap();
        assert!(matches!(bad.validate(), Err(ConfigError::Watcher { .. })));
    }
}
