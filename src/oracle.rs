// Price oracle: unit prices in USD for every coin the conversion engine handles
//
// - CoinGeckoOracle keeps a cached symbol -> price map refreshed by a
//   background task (default every 5 minutes).
// - A cached price older than the staleness bound is not used; the static
//   fallback table answers instead, so conversion never hard-fails just because
//   the feed is down.
// - StaticPriceOracle serves a fixed table (fallback-only deployments, tests).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::error::RpcError;
use crate::types::Coin;

/// Source of unit prices in the reference currency (USD)
pub trait PriceOracle: Send + Sync {
    fn price(&self, coin: Coin) -> Option<Decimal>;

    /// Diagnostics view for `GET /oracle/prices`
    fn snapshot(&self) -> PricesResponse {
        let prices = Coin::ALL
            .iter()
            .filter_map(|c| self.price(*c).map(|p| (c.symbol().to_string(), p)))
            .collect();
        PricesResponse {
            prices,
            last_update: None,
            stale: false,
            source: "static".to_string(),
        }
    }
}

/// Response for /oracle/prices endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PricesResponse {
    pub prices: BTreeMap<String, Decimal>,
    pub last_update: Option<DateTime<Utc>>,
    pub stale: bool,
    pub source: String,
}

/// Fixed price table
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    prices: HashMap<Coin, Decimal>,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<Coin, Decimal>) -> Self {
        Self { prices }
    }

    pub fn with(mut self, coin: Coin, price: Decimal) -> Self {
        self.prices.insert(coin, price);
        self
    }
}

impl PriceOracle for StaticPriceOracle {
    fn price(&self, coin: Coin) -> Option<Decimal> {
        self.prices.get(&coin).copied().filter(|p| *p > Decimal::ZERO)
    }
}

/// Built-in fallback table used when the live feed is unavailable
pub fn default_fallback_prices() -> HashMap<Coin, Decimal> {
    HashMap::from([
        (Coin::Eth, Decimal::from(3500)),
        (Coin::Bnb, Decimal::from(600)),
        (Coin::Sol, Decimal::from(150)),
        (Coin::Btc, Decimal::from(65000)),
        (Coin::Zec, Decimal::from(45)),
    ])
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    fetched_at: DateTime<Utc>,
}

/// Live CoinGecko feed with a fallback table
#[derive(Clone)]
pub struct CoinGeckoOracle {
    http: reqwest::Client,
    api_url: String,
    max_age: Duration,
    fallback: HashMap<Coin, Decimal>,
    cache: Arc<RwLock<HashMap<Coin, CachedPrice>>>,
    last_update: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl CoinGeckoOracle {
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        max_age: Duration,
        fallback: HashMap<Coin, Decimal>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            max_age,
            fallback,
            cache: Arc::new(RwLock::new(HashMap::new())),
            last_update: Arc::new(RwLock::new(None)),
        }
    }

    fn simple_price_url(&self) -> String {
        let ids: Vec<&str> = Coin::ALL.iter().map(|c| c.coingecko_id()).collect();
        format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.api_url,
            ids.join(",")
        )
    }

    /// Fetch latest prices; returns how many coins were updated
    pub async fn refresh(&self) -> Result<usize, RpcError> {
        tracing::debug!("[ORACLE] Refreshing prices from CoinGecko");
        let url = self.simple_price_url();

        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                endpoint: self.api_url.clone(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RpcError::RateLimited {
                endpoint: self.api_url.clone(),
            });
        }
        if !status.is_success() {
            return Err(RpcError::Status {
                endpoint: self.api_url.clone(),
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        let fresh = parse_simple_price(&body);
        if fresh.is_empty() {
            return Err(RpcError::Decode("no usd prices in response".to_string()));
        }

        let now = Utc::now();
        {
            let mut cache = self.cache.write();
            for (coin, price) in &fresh {
                cache.insert(
                    *coin,
                    CachedPrice {
                        price: *price,
                        fetched_at: now,
                    },
                );
            }
        }
        *self.last_update.write() = Some(now);

        let summary: Vec<String> = fresh.iter().map(|(c, p)| format!("{}=${}", c, p)).collect();
        tracing::info!("[ORACLE] Prices refreshed: {}", summary.join(", "));
        Ok(fresh.len())
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read()
    }

    /// Stale when nothing was ever fetched or the last refresh is older than the bound
    pub fn is_stale(&self) -> bool {
        match self.last_update() {
            Some(at) => is_older_than(at, self.max_age),
            None => true,
        }
    }

    fn live_price(&self, coin: Coin) -> Option<Decimal> {
        let cache = self.cache.read();
        let cached = cache.get(&coin)?;
        if is_older_than(cached.fetched_at, self.max_age) {
            None
        } else {
            Some(cached.price)
        }
    }
}

impl PriceOracle for CoinGeckoOracle {
    fn price(&self, coin: Coin) -> Option<Decimal> {
        if let Some(p) = self.live_price(coin) {
            return Some(p);
        }
        let fallback = self.fallback.get(&coin).copied().filter(|p| *p > Decimal::ZERO);
        if fallback.is_some() {
            tracing::debug!("[ORACLE] Using fallback price for {}", coin);
        }
        fallback
    }

    fn snapshot(&self) -> PricesResponse {
        let prices = Coin::ALL
            .iter()
            .filter_map(|c| self.price(*c).map(|p| (c.symbol().to_string(), p)))
            .collect();
        let stale = self.is_stale();
        PricesResponse {
            prices,
            last_update: self.last_update(),
            stale,
            source: if stale { "fallback" } else { "coingecko" }.to_string(),
        }
    }
}

fn is_older_than(at: DateTime<Utc>, max_age: Duration) -> bool {
    match (Utc::now() - at).to_std() {
        Ok(age) => age > max_age,
        // timestamp in the future: clock skew, treat as fresh
        Err(_) => false,
    }
}

/// Parse `{"ethereum":{"usd":3500.12}, ...}` without going through f64
pub fn parse_simple_price(body: &serde_json::Value) -> HashMap<Coin, Decimal> {
    let mut out = HashMap::new();
    for coin in Coin::ALL {
        let Some(usd) = body.get(coin.coingecko_id()).and_then(|v| v.get("usd")) else {
            continue;
        };
        let parsed = match usd {
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string())),
            serde_json::Value::String(s) => Decimal::from_str(s),
            _ => continue,
        };
        match parsed {
            Ok(p) if p > Decimal::ZERO => {
                out.insert(coin, p);
            }
            _ => tracing::warn!("[ORACLE] Ignoring unusable price for {}: {}", coin, usd),
        }
    }
    out
}

/// Start background price refresh task
pub fn start_price_refresh_task(oracle: Arc<CoinGeckoOracle>, interval_secs: u64) {
    tokio::spawn(async move {
        tracing::info!("[ORACLE] Starting price refresh task (interval: {}s)", interval_secs);

        let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            // first tick completes immediately
            interval.tick().await;
            if let Err(e) = oracle.refresh().await {
                tracing::warn!("[ORACLE] Price refresh failed, serving fallback when stale: {}", e);
            }
        }
    });
}
