//! Identity registry: wallet -> user attribution and user accounts
//!
//! A wallet address belongs to exactly one user. Registration is an
//! insert-if-absent on the normalized address, so a second user can never
//! take over a wallet that someone else registered first.

use chrono::Utc;
use rust_decimal::Decimal;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};

use crate::address::{self, AddressKind};
use crate::error::{RegistryError, StoreError};
use crate::store::{self, Store, TxResult};
use crate::types::{UserAccount, UserId, WalletMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New mapping created
    Registered(AddressKind),
    /// Wallet was already registered to the same user
    AlreadyOwned(AddressKind),
}

#[derive(Clone)]
pub struct IdentityRegistry {
    store: Store,
}

impl IdentityRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn register_wallet(
        &self,
        user_id: &UserId,
        wallet: &str,
    ) -> Result<Registration, RegistryError> {
        let kind = address::classify_wallet(wallet).map_err(RegistryError::InvalidAddressFormat)?;
        let normalized = address::normalize_wallet(wallet);

        let mapping = WalletMapping {
            wallet_address: normalized.clone(),
            user_id: user_id.clone(),
            created_at: Utc::now(),
        };
        let bytes = store::encode(&mapping)?;

        let swapped = self
            .store
            .wallet_mappings
            .compare_and_swap(
                normalized.as_bytes(),
                None as Option<&[u8]>,
                Some(bytes),
            )
            .map_err(StoreError::from)?;

        match swapped {
            Ok(()) => {
                tracing::info!(user = %user_id, wallet = %normalized, kind = %kind, "[IDENTITY] Wallet registered");
                Ok(Registration::Registered(kind))
            }
            Err(cas) => {
                let existing: WalletMapping = match cas.current {
                    Some(bytes) => store::decode(&bytes)?,
                    None => return Err(StoreError::Missing(normalized).into()),
                };
                if existing.user_id == *user_id {
                    Ok(Registration::AlreadyOwned(kind))
                } else {
                    tracing::warn!(
                        user = %user_id,
                        owner = %existing.user_id,
                        wallet = %normalized,
                        "[IDENTITY] Rejected registration of wallet owned by another user"
                    );
                    Err(RegistryError::AlreadyRegisteredToOtherUser {
                        wallet: normalized,
                        owner: existing.user_id,
                    })
                }
            }
        }
    }

    /// Attribution lookup. Unregistered senders are `None`, not an error.
    pub fn resolve_user(&self, wallet: &str) -> Result<Option<UserId>, StoreError> {
        let normalized = address::normalize_wallet(wallet);
        let mapping: Option<WalletMapping> =
            store::get_json(&self.store.wallet_mappings, normalized.as_bytes())?;
        Ok(mapping.map(|m| m.user_id))
    }

    pub fn wallets_for_user(&self, user_id: &UserId) -> Result<Vec<WalletMapping>, StoreError> {
        let mut wallets: Vec<WalletMapping> =
            store::scan_json::<WalletMapping>(&self.store.wallet_mappings)?
                .into_iter()
                .filter(|m| m.user_id == *user_id)
                .collect();
        wallets.sort_by_key(|m| m.created_at);
        Ok(wallets)
    }

    /// Create the account on first contact, refresh the display name afterwards
    pub fn upsert_user(&self, user_id: &UserId, display_name: &str) -> Result<UserAccount, StoreError> {
        let key = user_id.as_str().as_bytes();
        self.store
            .users
            .transaction(|tx| -> TxResult<UserAccount> {
                let account = match tx.get(key)? {
                    Some(bytes) => {
                        let mut account = store::tx_decode::<UserAccount, StoreError>(&bytes)?;
                        if account.display_name == display_name {
                            return Ok(account);
                        }
                        account.display_name = display_name.to_string();
                        account
                    }
                    None => new_account(user_id, display_name),
                };
                tx.insert(key, store::tx_encode::<_, StoreError>(&account)?)?;
                Ok(account)
            })
            .map_err(store::tx_error)
    }

    pub fn get_user(&self, user_id: &UserId) -> Result<Option<UserAccount>, StoreError> {
        store::get_json(&self.store.users, user_id.as_str().as_bytes())
    }

    /// Validate against the payout ledger grammar before anything is stored
    pub fn set_payout_address(&self, user_id: &UserId, payout_address: &str) -> Result<(), RegistryError> {
        let payout_address = payout_address.trim();
        address::validate_zcash_address(payout_address)
            .map_err(RegistryError::InvalidAddressFormat)?;

        let key = user_id.as_str().as_bytes();
        self.store
            .users
            .transaction(|tx| -> TxResult<()> {
                let mut account = match tx.get(key)? {
                    Some(bytes) => store::tx_decode::<UserAccount, StoreError>(&bytes)?,
                    None => new_account(user_id, user_id.as_str()),
                };
                account.payout_address = Some(payout_address.to_string());
                tx.insert(key, store::tx_encode::<_, StoreError>(&account)?)?;
                Ok(())
            })
            .map_err(store::tx_error)?;

        tracing::info!(user = %user_id, "[IDENTITY] Payout address updated");
        Ok(())
    }
}

fn new_account(user_id: &UserId, display_name: &str) -> UserAccount {
    UserAccount {
        user_id: user_id.clone(),
        display_name: display_name.to_string(),
        payout_address: None,
        total_received: Decimal::ZERO,
        created_at: Utc::now(),
    }
}

/// Add a confirmed payout to the beneficiary's running total inside a
/// caller-owned transaction. Negative amounts are ignored so the total
/// never decreases.
pub(crate) fn credit_in<E: From<StoreError>>(
    users: &TransactionalTree,
    user_id: &UserId,
    display_name: &str,
    amount: Decimal,
) -> Result<(), ConflictableTransactionError<E>> {
    let key = user_id.as_str().as_bytes();
    let mut account = match users.get(key)? {
        Some(bytes) => store::tx_decode::<UserAccount, E>(&bytes)?,
        None => new_account(user_id, display_name),
    };
    if amount > Decimal::ZERO {
        account.total_received += amount;
    }
    users.insert(key, store::tx_encode::<_, E>(&account)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e";

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(Store::temporary().unwrap())
    }

    #[test]
    fn test_register_and_resolve_case_insensitive() {
        let reg = registry();
        let alice = UserId::from("alice");
        assert_eq!(
            reg.register_wallet(&alice, WALLET).unwrap(),
            Registration::Registered(AddressKind::Evm)
        );
        assert_eq!(reg.resolve_user(&WALLET.to_uppercase().replacen("0X", "0x", 1)).unwrap(), Some(alice.clone()));
        assert_eq!(reg.resolve_user(&WALLET.to_lowercase()).unwrap(), Some(alice));
        assert_eq!(reg.resolve_user("0x0000000000000000000000000000000000000001").unwrap(), None);
    }

    #[test]
    fn test_wallet_uniqueness() {
        let reg = registry();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        reg.register_wallet(&alice, WALLET).unwrap();

        // same user again is idempotent
        assert_eq!(
            reg.register_wallet(&alice, &WALLET.to_lowercase()).unwrap(),
            Registration::AlreadyOwned(AddressKind::Evm)
        );

        let err = reg.register_wallet(&bob, &WALLET.to_lowercase()).unwrap_err();
        match err {
            RegistryError::AlreadyRegisteredToOtherUser { owner, .. } => assert_eq!(owner, alice),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reg.wallets_for_user(&alice).unwrap().len(), 1);
        assert!(reg.wallets_for_user(&bob).unwrap().is_empty());
    }

    #[test]
    fn test_register_rejects_garbage() {
        let reg = registry();
        let err = reg.register_wallet(&UserId::from("alice"), "not-a-wallet").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidAddressFormat(_)));
    }

    #[test]
    fn test_payout_address_validation() {
        let reg = registry();
        let alice = UserId::from("alice");
        reg.upsert_user(&alice, "Alice").unwrap();

        assert!(matches!(
            reg.set_payout_address(&alice, "0x742d35Cc6634C0532925a3b844Bc454e4438f44e"),
            Err(RegistryError::InvalidAddressFormat(_))
        ));
        assert_eq!(reg.get_user(&alice).unwrap().unwrap().payout_address, None);

        let zaddr = format!("t1{}", "a".repeat(33));
        reg.set_payout_address(&alice, &zaddr).unwrap();
        let account = reg.get_user(&alice).unwrap().unwrap();
        assert_eq!(account.payout_address, Some(zaddr));
        assert_eq!(account.display_name, "Alice");
    }

    #[test]
    fn test_upsert_refreshes_display_name() {
        let reg = registry();
        let alice = UserId::from("alice");
        let first = reg.upsert_user(&alice, "Alice").unwrap();
        let second = reg.upsert_user(&alice, "Alice B").unwrap();
        assert_eq!(second.display_name, "Alice B");
        assert_eq!(first.created_at, second.created_at);
    }
}
