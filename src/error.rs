//! Error taxonomy
//!
//! Validation and business-rule failures are typed so the command layer can
//! render a specific message for each. `StoreError` is the only kind that
//! maps to a generic "try again later" reply.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Coin, PayoutStatus, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("record {0} is missing")]
    Missing(String),
    #[error("record {0} already exists")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("wallet {wallet} is already registered to another user")]
    AlreadyRegisteredToOtherUser { wallet: String, owner: UserId },
    #[error("invalid address format: {0}")]
    InvalidAddressFormat(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn user_message(&self) -> String {
        match self {
            RegistryError::AlreadyRegisteredToOtherUser { .. } => {
                "❌ This wallet is already registered to another user.".to_string()
            }
            RegistryError::InvalidAddressFormat(reason) => format!("❌ {}", reason),
            RegistryError::Store(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no price available for {0}")]
    PriceUnavailable(Coin),
    #[error("arithmetic overflow converting {0}")]
    Overflow(Coin),
}

#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("claim token not found")]
    NotFound,
    #[error("claim token already claimed")]
    AlreadyClaimed,
    #[error("claim token expired")]
    Expired,
    #[error("claim token is reserved for @{intended_username}")]
    NotIntendedRecipient { intended_username: String },
    #[error("invalid payout address: {0}")]
    InvalidAddress(String),
    #[error("transfer value {value} is below the minimum {minimum}")]
    BelowMinimum { value: Decimal, minimum: Decimal },
    #[error("linked transfer {0} is missing from the ledger")]
    TransferMissing(String),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RedeemError {
    pub fn user_message(&self) -> String {
        match self {
            RedeemError::NotFound => "Invalid claim code.".to_string(),
            RedeemError::AlreadyClaimed => "This claim link has already been claimed.".to_string(),
            RedeemError::Expired => "This claim link has expired.".to_string(),
            RedeemError::NotIntendedRecipient { intended_username } => {
                format!("This claim link can only be claimed by @{}.", intended_username)
            }
            RedeemError::InvalidAddress(_) => {
                "Invalid Zcash address. Supported formats: t1/t3 (transparent), zs/zc (shielded), u1 (unified)."
                    .to_string()
            }
            RedeemError::BelowMinimum { value, minimum } => format!(
                "The deposit is worth ${} which is below the ${} minimum.",
                value.round_dp(2),
                minimum.round_dp(2)
            ),
            RedeemError::TransferMissing(_) => {
                "The deposit behind this link could not be found. Please contact support.".to_string()
            }
            RedeemError::Conversion(ConversionError::PriceUnavailable(coin)) => format!(
                "Pricing for {} is temporarily unavailable. Please try again shortly.",
                coin
            ),
            RedeemError::Conversion(ConversionError::Overflow(_)) => {
                "The deposit amount could not be converted. Please contact support.".to_string()
            }
            RedeemError::Store(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("payout claim not found")]
    NotFound,
    #[error("payout claim is already {0}")]
    NotPending(PayoutStatus),
    #[error("rejection reason must be at least {min} characters")]
    ReasonTooShort { min: usize },
    #[error("approval proof reference is empty")]
    EmptyProof,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApprovalError {
    pub fn user_message(&self) -> String {
        match self {
            ApprovalError::NotFound => "❌ Claim not found.".to_string(),
            ApprovalError::NotPending(status) => format!("❌ Claim is already {}.", status),
            ApprovalError::ReasonTooShort { min } => {
                format!("❌ Reason must be at least {} characters. Try again or /cancel.", min)
            }
            ApprovalError::EmptyProof => {
                "❌ Please send the payout transaction id. Try again or /cancel.".to_string()
            }
            ApprovalError::Store(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("no active admin session")]
    NoSession,
    #[error("invalid activation code")]
    InvalidCode,
    #[error("an action is already in progress")]
    StepInProgress,
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdminError {
    pub fn user_message(&self) -> String {
        match self {
            AdminError::NoSession => "🔒 Admin session is not active.".to_string(),
            AdminError::InvalidCode => "🔒 Invalid activation code.".to_string(),
            AdminError::StepInProgress => {
                "⚠️ Finish the current action first, or send /cancel.".to_string()
            }
            AdminError::Approval(e) => e.user_message(),
            AdminError::Store(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

/// Chain RPC / REST provider failures
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: String },
    #[error("json-rpc error {code}: {message}")]
    JsonRpc { code: i64, message: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("no endpoints configured")]
    NoEndpoints,
}

impl RpcError {
    /// Rate limits, timeouts, connection failures and 5xx are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport { source, .. } => !source.is_decode() && !source.is_builder(),
            RpcError::Status { status, .. } => *status >= 500 || *status == 408,
            RpcError::RateLimited { .. } => true,
            RpcError::JsonRpc { .. } | RpcError::Decode(_) | RpcError::NoEndpoints => false,
        }
    }
}

/// Messaging channel delivery failures
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Recipient blocked the bot, deleted their account, or never started a chat
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("api error {code}: {description}")]
    Api { code: u16, description: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("watcher {name}: {reason}")]
    Watcher { name: String, reason: String },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub const GENERIC_FAILURE: &str = "❌ An error occurred. Please try again later.";
