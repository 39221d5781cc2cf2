//! Core data model
//!
//! Records persisted by the ledger, registry, claim and payout services.
//! Amounts are `rust_decimal::Decimal` in the native unit of their ledger
//! (ETH, SOL, BTC, ZEC) so no binary floating point touches on-chain values.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledgers the watchers can observe deposits on
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Base,
    Bnb,
    Solana,
    Bitcoin,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Base => "base",
            Chain::Bnb => "bnb",
            Chain::Solana => "solana",
            Chain::Bitcoin => "bitcoin",
        }
    }

    /// Human readable network name used in messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Chain::Ethereum => "Ethereum",
            Chain::Base => "Base",
            Chain::Bnb => "BNB Smart Chain",
            Chain::Solana => "Solana",
            Chain::Bitcoin => "Bitcoin",
        }
    }

    /// Coin a deposit on this chain is denominated in
    pub fn native_coin(&self) -> Coin {
        match self {
            Chain::Ethereum | Chain::Base => Coin::Eth,
            Chain::Bnb => Coin::Bnb,
            Chain::Solana => Coin::Sol,
            Chain::Bitcoin => Coin::Btc,
        }
    }

    pub fn is_evm(&self) -> bool {
        matches!(self, Chain::Ethereum | Chain::Base | Chain::Bnb)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "base" => Ok(Chain::Base),
            "bnb" | "bsc" => Ok(Chain::Bnb),
            "solana" | "sol" => Ok(Chain::Solana),
            "bitcoin" | "btc" => Ok(Chain::Bitcoin),
            other => Err(format!("unknown chain '{}'", other)),
        }
    }
}

/// Coin symbols the price oracle knows about
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coin {
    Eth,
    Bnb,
    Sol,
    Btc,
    Zec,
}

impl Coin {
    pub const ALL: [Coin; 5] = [Coin::Eth, Coin::Bnb, Coin::Sol, Coin::Btc, Coin::Zec];

    pub fn symbol(&self) -> &'static str {
        match self {
            Coin::Eth => "ETH",
            Coin::Bnb => "BNB",
            Coin::Sol => "SOL",
            Coin::Btc => "BTC",
            Coin::Zec => "ZEC",
        }
    }

    /// CoinGecko id used by the live price feed
    pub fn coingecko_id(&self) -> &'static str {
        match self {
            Coin::Eth => "ethereum",
            Coin::Bnb => "binancecoin",
            Coin::Sol => "solana",
            Coin::Btc => "bitcoin",
            Coin::Zec => "zcash",
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Coin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Coin::ALL
            .iter()
            .copied()
            .find(|c| c.symbol().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown coin '{}'", s))
    }
}

/// Opaque external identity (messaging-platform user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id.to_string())
    }
}

/// Composite natural key of an observed transfer: `(chain, txRef)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferKey {
    pub chain: Chain,
    pub tx_ref: String,
}

impl TransferKey {
    /// Hex hashes (EVM, Bitcoin txids) are case-insensitive and stored lowercase.
    /// Solana signatures are base58 and keep their case.
    pub fn new(chain: Chain, tx_ref: &str) -> Self {
        let tx_ref = tx_ref.trim();
        let tx_ref = if chain == Chain::Solana {
            tx_ref.to_string()
        } else {
            tx_ref.to_ascii_lowercase()
        };
        Self { chain, tx_ref }
    }

    pub fn storage_key(&self) -> Vec<u8> {
        format!("{}:{}", self.chain.as_str(), self.tx_ref).into_bytes()
    }

    /// Shortened reference for chat messages
    pub fn short_ref(&self) -> String {
        let chars: Vec<char> = self.tx_ref.chars().collect();
        if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 10..].iter().collect();
            format!("{}...{}", head, tail)
        } else {
            self.tx_ref.clone()
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.tx_ref)
    }
}

/// Confirmed transfer produced by a chain watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub tx_ref: String,
    pub chain: Chain,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
}

impl TransferEvent {
    pub fn key(&self) -> TransferKey {
        TransferKey::new(self.chain, &self.tx_ref)
    }
}

/// One observed on-chain transfer (never deleted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub tx_ref: String,
    pub chain: Chain,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub observed_at: DateTime<Utc>,
    pub processed: bool,
}

impl TransferRecord {
    pub fn key(&self) -> TransferKey {
        TransferKey::new(self.chain, &self.tx_ref)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub display_name: String,
    pub payout_address: Option<String>,
    pub total_received: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletMapping {
    pub wallet_address: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

/// Single-use claim token, one per funded transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub token_id: String,
    pub issued_to_user_id: UserId,
    pub issued_to_username: String,
    pub linked_transfer: TransferKey,
    /// Advisory estimate shown at issuance; the payout is recomputed at redemption
    pub reward_amount_at_issuance: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed: bool,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_by_user_id: Option<UserId>,
}

impl ClaimToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Rejected,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payout awaiting (or resolved by) manual operator approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub claim_id: String,
    pub source_token_id: String,
    pub beneficiary_user_id: UserId,
    pub beneficiary_username: String,
    pub source_transfer: TransferKey,
    pub source_coin: Coin,
    pub source_amount: Decimal,
    pub source_value_in_reference_currency: Decimal,
    pub payout_coin: Coin,
    pub payout_amount: Decimal,
    pub payout_address: String,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub approval_proof: Option<String>,
    pub rejection_reason: Option<String>,
    pub refund_reference: Option<String>,
}

impl PendingPayout {
    pub fn short_id(&self) -> &str {
        &self.claim_id[..self.claim_id.len().min(8)]
    }
}
