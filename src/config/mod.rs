//! Runtime configuration
//!
//! Resolution order: built-in defaults, then the TOML file (`--config`,
//! missing file = defaults), then environment variables, then CLI flags.
//! Watcher entries are validated one by one so a bad entry only disables
//! that watcher.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::app_state::ServiceOptions;
use crate::backoff::BackoffPolicy;
use crate::claims::ClaimSettings;
use crate::conversion::ConversionPolicy;
use crate::error::ConfigError;
use crate::oracle::default_fallback_prices;
use crate::rpc::RpcEndpointConfig;
use crate::telegram::DEFAULT_API_BASE;
use crate::types::{Chain, Coin};
use crate::watcher::bitcoin::BitcoinWatcherConfig;
use crate::watcher::evm::EvmWatcherConfig;
use crate::watcher::solana::SolanaWatcherConfig;
use crate::watcher::WatcherConfig;

pub const DEFAULT_CONFIG_PATH: &str = "zlink.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub telegram: TelegramConfig,
    pub claims: ClaimsConfig,
    pub conversion: ConversionConfig,
    pub oracle: OracleConfig,
    pub admin: AdminConfig,
    pub backoff: BackoffPolicy,
    pub http: HttpConfig,
    pub watchers: Vec<WatcherConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("zlink-data"),
            telegram: TelegramConfig::default(),
            claims: ClaimsConfig::default(),
            conversion: ConversionConfig::default(),
            oracle: OracleConfig::default(),
            admin: AdminConfig::default(),
            backoff: BackoffPolicy::default(),
            http: HttpConfig::default(),
            watchers: Vec::new(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Unset disables the chat surface (log-only delivery)
    pub bot_token: Option<String>,
    pub api_base: String,
    /// getUpdates long-poll timeout
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            poll_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "***"))
            .field("api_base", &self.api_base)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Public base URL claim links are built on
    pub base_url: String,
    pub expiry_hours: i64,
    /// Chat /claim may redeem a link issued to someone else
    pub allow_sharing: bool,
    pub web_redemption: bool,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            expiry_hours: 24,
            allow_sharing: true,
            web_redemption: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub fee_rate: Decimal,
    pub minimum_value: Decimal,
    pub payout_coin: Coin,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        let policy = ConversionPolicy::default();
        Self {
            fee_rate: policy.fee_rate,
            minimum_value: policy.minimum_value,
            payout_coin: policy.payout_coin,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub api_url: String,
    pub refresh_secs: u64,
    /// Cached prices older than this fall back to the static table
    pub max_age_secs: u64,
    /// Symbol -> USD price, e.g. `ZEC = "45"`
    pub fallback: BTreeMap<String, Decimal>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.coingecko.com/api/v3".to_string(),
            refresh_secs: 300,
            max_age_secs: 900,
            fallback: default_fallback_prices()
                .into_iter()
                .map(|(coin, price)| (coin.symbol().to_string(), price))
                .collect(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Unset disables the operator console
    pub activation_code: Option<String>,
    pub session_hours: i64,
    pub min_reason_len: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            activation_code: None,
            session_hours: 24,
            min_reason_len: crate::payouts::DEFAULT_MIN_REASON_LEN,
        }
    }
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("activation_code", &self.activation_code.as_ref().map(|_| "***"))
            .field("session_hours", &self.session_hours)
            .field("min_reason_len", &self.min_reason_len)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    /// Read `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(url) = get("BASE_URL") {
            self.claims.base_url = url;
        }
        if let Some(hours) = get("LINK_EXPIRY_HOURS") {
            self.claims.expiry_hours = hours
                .parse()
                .map_err(|_| invalid("LINK_EXPIRY_HOURS", format!("'{}' is not a number", hours)))?;
        }
        if let Some(code) = get("ZLINK_ADMIN_CODE") {
            self.admin.activation_code = Some(code);
        }
        if let Some(dir) = get("ZLINK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(bind) = get("ZLINK_HTTP_BIND") {
            self.http.bind = bind;
        }
        if let Some(flag) = get("ZLINK_WEB_REDEMPTION") {
            self.claims.web_redemption = parse_flag(&flag)
                .ok_or_else(|| invalid("ZLINK_WEB_REDEMPTION", format!("'{}' is not a boolean", flag)))?;
        }

        self.override_evm(Chain::Base, 8453, "https://mainnet.base.org", get("BASE_RPC_URL"), get("BASE_WALLET_ADDRESS"));
        self.override_evm(Chain::Bnb, 56, "https://bsc-dataseed.binance.org", get("BNB_RPC_URL"), get("BNB_WALLET_ADDRESS"));
        self.override_solana(get("SOLANA_RPC_URL"), get("SOL_WALLET_ADDRESS"));
        self.override_bitcoin(get("BITCOIN_API_URL"), get("BTC_WALLET_ADDRESS"));
        Ok(())
    }

    /// Update the configured watcher for `chain`, or add one when the
    /// deposit address is known
    fn override_evm(
        &mut self,
        chain: Chain,
        chain_id: u64,
        default_rpc: &str,
        rpc_url: Option<String>,
        address: Option<String>,
    ) {
        let existing = self.watchers.iter_mut().find_map(|w| match w {
            WatcherConfig::Evm(c) if c.chain == chain => Some(c),
            _ => None,
        });
        match existing {
            Some(c) => {
                if let Some(url) = rpc_url {
                    c.rpc.rpc_url = url;
                }
                if let Some(addr) = address {
                    c.deposit_address = addr;
                }
            }
            None => {
                let Some(deposit_address) = address else { return };
                self.watchers.push(WatcherConfig::Evm(EvmWatcherConfig {
                    name: None,
                    chain,
                    chain_id: Some(chain_id),
                    rpc: RpcEndpointConfig::new(rpc_url.unwrap_or_else(|| default_rpc.to_string())),
                    deposit_address,
                    ..EvmWatcherConfig::defaults(chain)
                }));
            }
        }
    }

    fn override_solana(&mut self, rpc_url: Option<String>, address: Option<String>) {
        let existing = self.watchers.iter_mut().find_map(|w| match w {
            WatcherConfig::Solana(c) => Some(c),
            _ => None,
        });
        match existing {
            Some(c) => {
                if let Some(url) = rpc_url {
                    c.rpc.rpc_url = url;
                }
                if let Some(addr) = address {
                    c.deposit_address = addr;
                }
            }
            None => {
                let (Some(url), Some(deposit_address)) = (rpc_url, address) else { return };
                self.watchers.push(WatcherConfig::Solana(SolanaWatcherConfig {
                    rpc: RpcEndpointConfig::new(url),
                    deposit_address,
                    ..SolanaWatcherConfig::defaults()
                }));
            }
        }
    }

    fn override_bitcoin(&mut self, api_url: Option<String>, address: Option<String>) {
        let existing = self.watchers.iter_mut().find_map(|w| match w {
            WatcherConfig::Bitcoin(c) => Some(c),
            _ => None,
        });
        match existing {
            Some(c) => {
                if let Some(url) = api_url {
                    c.rpc.rpc_url = url;
                }
                if let Some(addr) = address {
                    c.deposit_address = addr;
                }
            }
            None => {
                let (Some(url), Some(deposit_address)) = (api_url, address) else { return };
                self.watchers.push(WatcherConfig::Bitcoin(BitcoinWatcherConfig {
                    rpc: RpcEndpointConfig::new(url),
                    deposit_address,
                    ..BitcoinWatcherConfig::defaults()
                }));
            }
        }
    }

    /// Global settings only; watcher entries are checked by `usable_watchers`
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.conversion;
        if c.fee_rate < Decimal::ZERO || c.fee_rate >= Decimal::ONE {
            return Err(invalid("conversion.fee_rate", "must be in [0, 1)"));
        }
        if c.minimum_value < Decimal::ZERO {
            return Err(invalid("conversion.minimum_value", "must not be negative"));
        }
        if self.claims.expiry_hours <= 0 {
            return Err(invalid("claims.expiry_hours", "must be positive"));
        }
        url::Url::parse(&self.claims.base_url)
            .map_err(|e| invalid("claims.base_url", e.to_string()))?;
        self.http
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| invalid("http.bind", e.to_string()))?;
        if self.admin.session_hours <= 0 {
            return Err(invalid("admin.session_hours", "must be positive"));
        }
        if self.admin.min_reason_len == 0 {
            return Err(invalid("admin.min_reason_len", "must be at least 1"));
        }
        self.fallback_prices()?;
        Ok(())
    }

    /// Watcher entries that pass validation; the rest are logged and skipped
    pub fn usable_watchers(&self) -> Vec<WatcherConfig> {
        self.watchers
            .iter()
            .filter(|w| match w.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("[WATCHER] Skipping invalid watcher: {}", e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    pub fn fallback_prices(&self) -> Result<HashMap<Coin, Decimal>, ConfigError> {
        self.oracle
            .fallback
            .iter()
            .map(|(symbol, price)| {
                let coin = Coin::from_str(symbol).map_err(|e| invalid("oracle.fallback", e))?;
                if *price <= Decimal::ZERO {
                    return Err(invalid("oracle.fallback", format!("{} price must be positive", symbol)));
                }
                Ok((coin, *price))
            })
            .collect()
    }

    pub fn http_bind(&self) -> Result<SocketAddr, ConfigError> {
        self.http
            .bind
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("http.bind", e.to_string()))
    }

    pub fn to_service_options(&self) -> ServiceOptions {
        ServiceOptions {
            claims: ClaimSettings {
                base_url: self.claims.base_url.clone(),
                ttl: chrono::Duration::hours(self.claims.expiry_hours),
            },
            conversion: ConversionPolicy {
                fee_rate: self.conversion.fee_rate,
                minimum_value: self.conversion.minimum_value,
                payout_coin: self.conversion.payout_coin,
            },
            admin_code: self.admin.activation_code.clone(),
            admin_session_ttl: chrono::Duration::hours(self.admin.session_hours),
            min_reason_len: self.admin.min_reason_len,
            chat_allow_sharing: self.claims.allow_sharing,
            web_redemption: self.claims.web_redemption,
            deposit_addresses: self
                .usable_watchers()
                .iter()
                .map(|w| (w.chain(), w.deposit_address().to_string()))
                .collect(),
        }
    }
}
