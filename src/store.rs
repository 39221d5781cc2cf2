// Store: sled-backed persistence shared by every core service
//
// Trees:
//   "transfers"          key "{chain}:{tx_ref}"     -> TransferRecord
//   "wallet_mappings"    key normalized address     -> WalletMapping
//   "users"              key user id                -> UserAccount
//   "claim_tokens"       key token id               -> ClaimToken
//   "token_by_transfer"  key "{chain}:{tx_ref}"     -> token id
//   "pending_payouts"    key claim id               -> PendingPayout
//   "admin_sessions"     key operator id            -> AdminSession
//
// Values are JSON so decimals keep their exact string form.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::path::Path;

use crate::error::StoreError;

pub const TRANSFERS_TREE: &str = "transfers";
pub const WALLET_MAPPINGS_TREE: &str = "wallet_mappings";
pub const USERS_TREE: &str = "users";
pub const CLAIM_TOKENS_TREE: &str = "claim_tokens";
pub const TOKEN_BY_TRANSFER_TREE: &str = "token_by_transfer";
pub const PENDING_PAYOUTS_TREE: &str = "pending_payouts";
pub const ADMIN_SESSIONS_TREE: &str = "admin_sessions";

/// Handle to the open database and its trees. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Db,
    pub transfers: Tree,
    pub wallet_mappings: Tree,
    pub users: Tree,
    pub claim_tokens: Tree,
    pub token_by_transfer: Tree,
    pub pending_payouts: Tree,
    pub admin_sessions: Tree,
}

impl Store {
    /// Open (or create) the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database that is discarded on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            transfers: db.open_tree(TRANSFERS_TREE)?,
            wallet_mappings: db.open_tree(WALLET_MAPPINGS_TREE)?,
            users: db.open_tree(USERS_TREE)?,
            claim_tokens: db.open_tree(CLAIM_TOKENS_TREE)?,
            token_by_transfer: db.open_tree(TOKEN_BY_TRANSFER_TREE)?,
            pending_payouts: db.open_tree(PENDING_PAYOUTS_TREE)?,
            admin_sessions: db.open_tree(ADMIN_SESSIONS_TREE)?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Result type of a transaction closure body
pub type TxResult<T, E = StoreError> = Result<T, ConflictableTransactionError<E>>;

/// Decode inside a transaction closure; a corrupt row aborts the transaction
pub fn tx_decode<T: DeserializeOwned, E: From<StoreError>>(
    bytes: &[u8],
) -> Result<T, ConflictableTransactionError<E>> {
    decode(bytes).map_err(|e| ConflictableTransactionError::Abort(E::from(e)))
}

pub fn tx_encode<T: Serialize, E: From<StoreError>>(
    value: &T,
) -> Result<Vec<u8>, ConflictableTransactionError<E>> {
    encode(value).map_err(|e| ConflictableTransactionError::Abort(E::from(e)))
}

/// Flatten a transaction outcome into the caller's error type
pub fn tx_error<E: From<StoreError>>(err: TransactionError<E>) -> E {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => E::from(StoreError::Sled(e)),
    }
}

/// Point read of a JSON value
pub fn get_json<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, StoreError> {
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Decode every value in a tree, skipping (and logging) corrupt rows
pub fn scan_json<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (key, value) = item?;
        match decode::<T>(&value) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(
                "[STORE] Skipping undecodable row {}: {}",
                String::from_utf8_lossy(&key),
                e
            ),
        }
    }
    Ok(out)
}
