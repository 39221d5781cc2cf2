//! Claim token service
//!
//! One unguessable, single-use, expiring token per funded transfer.
//!
//! Issuance is a transaction over `claim_tokens` + `token_by_transfer`, so
//! redelivering the same transfer returns the existing token instead of
//! minting a second one. Redemption re-checks the token inside a transaction
//! over `claim_tokens` + `pending_payouts`, flips `redeemed` and stages the
//! pending payout in the same commit: of N concurrent redeemers exactly one
//! commits, the rest observe `AlreadyClaimed`.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::Decimal;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, Transactional};

use crate::address;
use crate::conversion::ConversionEngine;
use crate::error::{RedeemError, StoreError};
use crate::identity::IdentityRegistry;
use crate::ledger::TransferLedger;
use crate::payouts;
use crate::store::{self, Store, TxResult};
use crate::types::{ClaimToken, Chain, Coin, PayoutStatus, PendingPayout, TransferKey, UserId};

/// Path marker preceding the token id in claim URLs
pub const CLAIM_PATH_MARKER: &str = "claim";

const TOKEN_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct ClaimSettings {
    pub base_url: String,
    pub ttl: Duration,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            ttl: Duration::hours(24),
        }
    }
}

/// Result of `issue`
#[derive(Debug, Clone, PartialEq)]
pub enum Issuance {
    Issued(ClaimToken),
    /// The transfer already had a token; nothing new was created
    Existing(ClaimToken),
}

impl Issuance {
    pub fn token(&self) -> &ClaimToken {
        match self {
            Issuance::Issued(t) | Issuance::Existing(t) => t,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Issuance::Issued(_))
    }
}

/// Read-only view for the claim page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimInfo {
    pub token_id: String,
    pub recipient: String,
    pub chain: Chain,
    pub source_coin: Coin,
    pub source_amount: Option<Decimal>,
    pub estimated_payout: Decimal,
    pub payout_coin: Coin,
    pub claimed: bool,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ClaimService {
    store: Store,
    ledger: TransferLedger,
    identity: IdentityRegistry,
    conversion: ConversionEngine,
    settings: ClaimSettings,
}

impl ClaimService {
    pub fn new(
        store: Store,
        ledger: TransferLedger,
        identity: IdentityRegistry,
        conversion: ConversionEngine,
        settings: ClaimSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            identity,
            conversion,
            settings,
        }
    }

    pub fn settings(&self) -> &ClaimSettings {
        &self.settings
    }

    pub fn claim_url(&self, token_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            CLAIM_PATH_MARKER,
            token_id
        )
    }

    /// Mint the token for a funded transfer, or return the one it already has
    pub fn issue(
        &self,
        user_id: &UserId,
        username: &str,
        reference_amount: Decimal,
        transfer: &TransferKey,
    ) -> Result<Issuance, StoreError> {
        let transfer_key = transfer.storage_key();
        let now = Utc::now();
        let candidate = ClaimToken {
            token_id: generate_token_id(),
            issued_to_user_id: user_id.clone(),
            issued_to_username: username.to_string(),
            linked_transfer: transfer.clone(),
            reward_amount_at_issuance: reference_amount,
            created_at: now,
            expires_at: now + self.settings.ttl,
            redeemed: false,
            redeemed_at: None,
            redeemed_by_user_id: None,
        };

        let issuance = (&self.store.claim_tokens, &self.store.token_by_transfer)
            .transaction(|(tokens, index)| -> TxResult<Issuance> {
                if let Some(existing_id) = index.get(&transfer_key)? {
                    let Some(bytes) = tokens.get(&existing_id)? else {
                        return Err(ConflictableTransactionError::Abort(StoreError::Missing(
                            String::from_utf8_lossy(&existing_id).into_owned(),
                        )));
                    };
                    return Ok(Issuance::Existing(store::tx_decode::<ClaimToken, StoreError>(&bytes)?));
                }
                let id = candidate.token_id.as_bytes();
                if tokens.get(id)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StoreError::Conflict(
                        candidate.token_id.clone(),
                    )));
                }
                tokens.insert(id, store::tx_encode::<_, StoreError>(&candidate)?)?;
                index.insert(transfer_key.as_slice(), id)?;
                Ok(Issuance::Issued(candidate.clone()))
            })
            .map_err(store::tx_error)?;

        match &issuance {
            Issuance::Issued(t) => tracing::info!(
                token = %t.token_id,
                user = %user_id,
                transfer = %transfer,
                "[CLAIMS] Claim token issued"
            ),
            Issuance::Existing(t) => tracing::debug!(
                token = %t.token_id,
                transfer = %transfer,
                "[CLAIMS] Transfer already has a claim token"
            ),
        }
        Ok(issuance)
    }

    pub fn get(&self, token_id: &str) -> Result<Option<ClaimToken>, StoreError> {
        store::get_json(&self.store.claim_tokens, token_id.trim().as_bytes())
    }

    pub fn token_for_transfer(&self, transfer: &TransferKey) -> Result<Option<ClaimToken>, StoreError> {
        match self.store.token_by_transfer.get(transfer.storage_key())? {
            Some(id) => store::get_json(&self.store.claim_tokens, &id),
            None => Ok(None),
        }
    }

    /// Tokens issued to a user, newest first
    pub fn tokens_issued_to(&self, user_id: &UserId) -> Result<Vec<ClaimToken>, StoreError> {
        let mut tokens: Vec<ClaimToken> = store::scan_json::<ClaimToken>(&self.store.claim_tokens)?
            .into_iter()
            .filter(|t| t.issued_to_user_id == *user_id)
            .collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tokens)
    }

    /// Validate and atomically redeem. Checks run in a fixed order and the
    /// first failure wins:
    /// exists, unredeemed, unexpired, recipient/sharing, payout address, minimum.
    pub fn redeem(
        &self,
        token_id: &str,
        redeemer: &UserId,
        redeemer_username: &str,
        payout_address: &str,
        allow_sharing: bool,
    ) -> Result<PendingPayout, RedeemError> {
        let token_id = token_id.trim();
        let payout_address = payout_address.trim();

        let token = self.get(token_id)?.ok_or(RedeemError::NotFound)?;
        if token.redeemed {
            return Err(RedeemError::AlreadyClaimed);
        }
        let now = Utc::now();
        if token.is_expired_at(now) {
            return Err(RedeemError::Expired);
        }
        if !allow_sharing && *redeemer != token.issued_to_user_id {
            return Err(RedeemError::NotIntendedRecipient {
                intended_username: token.issued_to_username.clone(),
            });
        }
        address::validate_zcash_address(payout_address).map_err(RedeemError::InvalidAddress)?;

        let transfer = self
            .ledger
            .get(&token.linked_transfer)?
            .ok_or_else(|| RedeemError::TransferMissing(token.linked_transfer.to_string()))?;
        let quote = self
            .conversion
            .quote(transfer.amount, transfer.chain.native_coin())?;
        if !quote.meets_minimum {
            return Err(RedeemError::BelowMinimum {
                value: quote.value,
                minimum: self.conversion.policy().minimum_value,
            });
        }

        let payout = PendingPayout {
            claim_id: uuid::Uuid::new_v4().to_string(),
            source_token_id: token.token_id.clone(),
            beneficiary_user_id: redeemer.clone(),
            beneficiary_username: redeemer_username.to_string(),
            source_transfer: token.linked_transfer.clone(),
            source_coin: quote.source_coin,
            source_amount: quote.source_amount,
            source_value_in_reference_currency: quote.value,
            payout_coin: quote.payout_coin,
            payout_amount: quote.payout_amount,
            payout_address: payout_address.to_string(),
            status: PayoutStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            approval_proof: None,
            rejection_reason: None,
            refund_reference: None,
        };

        (&self.store.claim_tokens, &self.store.pending_payouts)
            .transaction(|(tokens, pending)| -> TxResult<(), RedeemError> {
                let Some(bytes) = tokens.get(token_id.as_bytes())? else {
                    return Err(ConflictableTransactionError::Abort(RedeemError::NotFound));
                };
                let mut current = store::tx_decode::<ClaimToken, RedeemError>(&bytes)?;
                if current.redeemed {
                    return Err(ConflictableTransactionError::Abort(RedeemError::AlreadyClaimed));
                }
                if current.is_expired_at(Utc::now()) {
                    return Err(ConflictableTransactionError::Abort(RedeemError::Expired));
                }
                current.redeemed = true;
                current.redeemed_at = Some(now);
                current.redeemed_by_user_id = Some(redeemer.clone());
                tokens.insert(token_id.as_bytes(), store::tx_encode::<_, RedeemError>(&current)?)?;
                payouts::stage_in::<RedeemError>(pending, &payout)?;
                Ok(())
            })
            .map_err(store::tx_error)?;

        tracing::info!(
            token = %token_id,
            claim_id = %payout.claim_id,
            redeemer = %redeemer,
            shared = (*redeemer != token.issued_to_user_id),
            payout = %payout.payout_amount,
            "[CLAIMS] Claim token redeemed"
        );

        // remember the address for the next /claim without one
        if let Err(e) = self.identity.set_payout_address(redeemer, payout_address) {
            tracing::warn!(user = %redeemer, "[CLAIMS] Could not store payout address: {}", e);
        }

        Ok(payout)
    }

    pub fn info(&self, token_id: &str) -> Result<Option<ClaimInfo>, StoreError> {
        let Some(token) = self.get(token_id)? else {
            return Ok(None);
        };
        let source_amount = self.ledger.get(&token.linked_transfer)?.map(|t| t.amount);
        Ok(Some(ClaimInfo {
            token_id: token.token_id.clone(),
            recipient: token.issued_to_username.clone(),
            chain: token.linked_transfer.chain,
            source_coin: token.linked_transfer.chain.native_coin(),
            source_amount,
            estimated_payout: token.reward_amount_at_issuance,
            payout_coin: self.conversion.policy().payout_coin,
            claimed: token.redeemed,
            expired: !token.redeemed && token.is_expired_at(Utc::now()),
            created_at: token.created_at,
            expires_at: token.expires_at,
            redeemed_at: token.redeemed_at,
        }))
    }
}

/// 128 bits from the OS CSPRNG, hex encoded
pub fn generate_token_id() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_token_shaped(s: &str) -> bool {
    (8..=128).contains(&s.len())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Accept a bare token id or a claim URL (`.../claim/<id>`). Pure parsing.
pub fn extract_token_id(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(url) = url::Url::parse(input) {
        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
        let pos = segments.iter().position(|s| *s == CLAIM_PATH_MARKER)?;
        let candidate = segments.get(pos + 1)?;
        return is_token_shaped(candidate).then(|| candidate.to_string());
    }

    // scheme-less link such as "example.com/claim/<id>"
    let marker = format!("/{}/", CLAIM_PATH_MARKER);
    let candidate = match input.rfind(&marker) {
        Some(idx) => {
            let rest = &input[idx + marker.len()..];
            rest.split(['/', '?', '#']).next().unwrap_or_default()
        }
        None => input,
    };
    is_token_shaped(candidate).then(|| candidate.to_string())
}
