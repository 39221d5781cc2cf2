//! Transfer ledger
//!
//! Durable dedup of observed transfers keyed on `(chain, txRef)`. Inserts go
//! through a compare-and-swap against an absent key so concurrent callers
//! (and separate processes sharing the database) agree on a single winner.

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};

use crate::error::StoreError;
use crate::store::{self, Store};
use crate::types::{TransferEvent, TransferKey, TransferRecord};

#[derive(Clone)]
pub struct TransferLedger {
    store: Store,
}

impl TransferLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert-or-ignore. Returns `true` only for the caller that created the row;
    /// a redelivered event is a no-op, not an error.
    pub fn record_if_new(&self, event: &TransferEvent) -> Result<bool, StoreError> {
        let key = event.key();
        let record = TransferRecord {
            tx_ref: key.tx_ref.clone(),
            chain: key.chain,
            from_address: event.from_address.clone(),
            to_address: event.to_address.clone(),
            amount: event.amount,
            observed_at: Utc::now(),
            processed: false,
        };
        let bytes = store::encode(&record)?;

        let swapped = self.store.transfers.compare_and_swap(
            key.storage_key(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;

        match swapped {
            Ok(()) => {
                tracing::info!(
                    chain = %key.chain,
                    tx_ref = %key.tx_ref,
                    amount = %event.amount,
                    "[LEDGER] Recorded new transfer"
                );
                Ok(true)
            }
            Err(_) => {
                tracing::debug!(chain = %key.chain, tx_ref = %key.tx_ref, "[LEDGER] Duplicate transfer ignored");
                Ok(false)
            }
        }
    }

    /// Flip `processed` to true. Idempotent; returns whether this call flipped it.
    pub fn mark_processed(&self, key: &TransferKey) -> Result<bool, StoreError> {
        let storage_key = key.storage_key();
        self.store
            .transfers
            .transaction(|tx| mark_processed_in::<StoreError>(tx, &storage_key))
            .map_err(store::tx_error)
    }

    pub fn get(&self, key: &TransferKey) -> Result<Option<TransferRecord>, StoreError> {
        store::get_json(&self.store.transfers, &key.storage_key())
    }

    /// Transfers still waiting for attribution, oldest first
    pub fn list_unprocessed(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let mut pending: Vec<TransferRecord> = store::scan_json::<TransferRecord>(&self.store.transfers)?
            .into_iter()
            .filter(|r| !r.processed)
            .collect();
        pending.sort_by_key(|r| r.observed_at);
        Ok(pending)
    }

    pub fn count(&self) -> usize {
        self.store.transfers.len()
    }
}

fn mark_processed_in<E: From<StoreError>>(
    tx: &TransactionalTree,
    storage_key: &[u8],
) -> Result<bool, ConflictableTransactionError<E>> {
    let Some(bytes) = tx.get(storage_key)? else {
        let key = String::from_utf8_lossy(storage_key).into_owned();
        return Err(ConflictableTransactionError::Abort(E::from(
            StoreError::Missing(key),
        )));
    };
    let mut record = store::tx_decode::<TransferRecord, E>(&bytes)?;
    if record.processed {
        return Ok(false);
    }
    record.processed = true;
    tx.insert(storage_key, store::tx_encode::<_, E>(&record)?)?;
    Ok(true)
}
