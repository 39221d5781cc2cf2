//! Payout approval queue
//!
//! `pending -> approved | rejected`, terminal. Each transition is a sled
//! transaction that re-reads the row, checks it is still pending and writes
//! every terminal field in the same commit. Approval also credits the
//! beneficiary's running total inside that transaction.

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionalTree, Transactional};
use std::sync::Arc;

use crate::error::{ApprovalError, StoreError};
use crate::identity;
use crate::notify::{self, MessagingChannel};
use crate::store::{self, Store, TxResult};
use crate::types::{PayoutStatus, PendingPayout, UserId};

/// Caller-typed refund references that mean "no refund"
const REFUND_SENTINELS: [&str; 7] = ["none", "n/a", "na", "-", "no", "skip", "null"];

/// Minimum rejection reason length
pub const DEFAULT_MIN_REASON_LEN: usize = 3;

/// Map sentinel or blank refund references to absent
pub fn normalize_refund_reference(input: Option<&str>) -> Option<String> {
    let trimmed = input?.trim();
    if trimmed.is_empty() || REFUND_SENTINELS.iter().any(|s| s.eq_ignore_ascii_case(trimmed)) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Insert a new pending payout inside a caller-owned transaction
pub(crate) fn stage_in<E: From<StoreError>>(
    payouts: &TransactionalTree,
    payout: &PendingPayout,
) -> Result<(), ConflictableTransactionError<E>> {
    let key = payout.claim_id.as_bytes();
    if payouts.get(key)?.is_some() {
        return Err(ConflictableTransactionError::Abort(E::from(StoreError::Conflict(
            payout.claim_id.clone(),
        ))));
    }
    payouts.insert(key, store::tx_encode::<_, E>(payout)?)?;
    Ok(())
}

#[derive(Clone)]
pub struct PayoutQueue {
    store: Store,
    channel: Arc<dyn MessagingChannel>,
    min_reason_len: usize,
}

impl PayoutQueue {
    pub fn new(store: Store, channel: Arc<dyn MessagingChannel>, min_reason_len: usize) -> Self {
        Self {
            store,
            channel,
            min_reason_len,
        }
    }

    pub fn min_reason_len(&self) -> usize {
        self.min_reason_len
    }

    /// Insert a pending payout on its own; redemption stages through `stage_in`
    pub fn enqueue(&self, payout: PendingPayout) -> Result<String, StoreError> {
        self.store
            .pending_payouts
            .transaction(|tx| stage_in::<StoreError>(tx, &payout))
            .map_err(store::tx_error)?;
        tracing::info!(claim_id = %payout.claim_id, user = %payout.beneficiary_user_id, "[PAYOUTS] Payout enqueued");
        Ok(payout.claim_id)
    }

    pub fn get(&self, claim_id: &str) -> Result<Option<PendingPayout>, StoreError> {
        store::get_json(&self.store.pending_payouts, claim_id.as_bytes())
    }

    /// Exact id, or an unambiguous prefix (chat surfaces show short ids)
    pub fn find(&self, id_or_prefix: &str) -> Result<Option<PendingPayout>, StoreError> {
        let id_or_prefix = id_or_prefix.trim();
        if id_or_prefix.is_empty() {
            return Ok(None);
        }
        if let Some(p) = self.get(id_or_prefix)? {
            return Ok(Some(p));
        }
        let mut matches = Vec::new();
        for item in self.store.pending_payouts.scan_prefix(id_or_prefix.as_bytes()) {
            let (_, bytes) = item?;
            matches.push(store::decode::<PendingPayout>(&bytes)?);
            if matches.len() > 1 {
                return Ok(None);
            }
        }
        Ok(matches.pop())
    }

    fn list_where(&self, keep: impl Fn(&PendingPayout) -> bool) -> Result<Vec<PendingPayout>, StoreError> {
        let mut out: Vec<PendingPayout> = store::scan_json::<PendingPayout>(&self.store.pending_payouts)?
            .into_iter()
            .filter(|p| keep(p))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.claim_id.cmp(&b.claim_id)));
        Ok(out)
    }

    /// Pending payouts, oldest first
    pub fn list_pending(&self) -> Result<Vec<PendingPayout>, StoreError> {
        self.list_where(|p| p.status == PayoutStatus::Pending)
    }

    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<PendingPayout>, StoreError> {
        self.list_where(|p| p.beneficiary_user_id == *user_id)
    }

    /// Mark paid. Credits the beneficiary and notifies them (best-effort).
    pub async fn approve(
        &self,
        claim_id: &str,
        proof_reference: &str,
        operator: &UserId,
    ) -> Result<PendingPayout, ApprovalError> {
        let proof = proof_reference.trim();
        if proof.is_empty() {
            return Err(ApprovalError::EmptyProof);
        }

        let resolved = (&self.store.pending_payouts, &self.store.users)
            .transaction(|(payouts, users)| -> TxResult<PendingPayout, ApprovalError> {
                let mut payout = load_pending(payouts, claim_id)?;
                payout.status = PayoutStatus::Approved;
                payout.resolved_at = Some(Utc::now());
                payout.resolved_by = Some(operator.clone());
                payout.approval_proof = Some(proof.to_string());
                payouts.insert(claim_id.as_bytes(), store::tx_encode::<_, ApprovalError>(&payout)?)?;
                identity::credit_in::<ApprovalError>(
                    users,
                    &payout.beneficiary_user_id,
                    &payout.beneficiary_username,
                    payout.payout_amount,
                )?;
                Ok(payout)
            })
            .map_err(store::tx_error)?;

        tracing::info!(
            claim_id = %resolved.claim_id,
            operator = %operator,
            amount = %resolved.payout_amount,
            "[PAYOUTS] Payout approved"
        );

        let text = format!(
            "✅ Your claim has been approved!\n\n\
             Amount: {} {}\n\
             Address: {}\n\
             Transaction: {}\n\n\
             Thank you for using ZLink!",
            resolved.payout_amount, resolved.payout_coin, resolved.payout_address, proof
        );
        notify::deliver(self.channel.as_ref(), &resolved.beneficiary_user_id, &text).await;
        Ok(resolved)
    }

    /// Mark rejected with a reason and optional refund reference; notifies the
    /// beneficiary (best-effort).
    pub async fn reject(
        &self,
        claim_id: &str,
        reason: &str,
        refund_reference: Option<&str>,
        operator: &UserId,
    ) -> Result<PendingPayout, ApprovalError> {
        let reason = reason.trim();
        if reason.chars().count() < self.min_reason_len {
            return Err(ApprovalError::ReasonTooShort {
                min: self.min_reason_len,
            });
        }
        let refund = normalize_refund_reference(refund_reference);

        let resolved = self
            .store
            .pending_payouts
            .transaction(|payouts| -> TxResult<PendingPayout, ApprovalError> {
                let mut payout = load_pending(payouts, claim_id)?;
                payout.status = PayoutStatus::Rejected;
                payout.resolved_at = Some(Utc::now());
                payout.resolved_by = Some(operator.clone());
                payout.rejection_reason = Some(reason.to_string());
                payout.refund_reference = refund.clone();
                payouts.insert(claim_id.as_bytes(), store::tx_encode::<_, ApprovalError>(&payout)?)?;
                Ok(payout)
            })
            .map_err(store::tx_error)?;

        tracing::info!(
            claim_id = %resolved.claim_id,
            operator = %operator,
            refund = resolved.refund_reference.is_some(),
            "[PAYOUTS] Payout rejected"
        );

        let mut text = format!(
            "❌ Your claim has been rejected.\n\nReason: {}\nAmount: {} {}",
            reason, resolved.payout_amount, resolved.payout_coin
        );
        if let Some(refund) = &resolved.refund_reference {
            text.push_str(&format!("\nRefund transaction: {}", refund));
        }
        text.push_str("\n\nIf you have questions, please contact support.");
        notify::deliver(self.channel.as_ref(), &resolved.beneficiary_user_id, &text).await;
        Ok(resolved)
    }
}

fn load_pending(
    payouts: &TransactionalTree,
    claim_id: &str,
) -> Result<PendingPayout, ConflictableTransactionError<ApprovalError>> {
    let Some(bytes) = payouts.get(claim_id.as_bytes())? else {
        return Err(ConflictableTransactionError::Abort(ApprovalError::NotFound));
    };
    let payout = store::tx_decode::<PendingPayout, ApprovalError>(&bytes)?;
    if payout.status != PayoutStatus::Pending {
        return Err(ConflictableTransactionError::Abort(ApprovalError::NotPending(
            payout.status,
        )));
    }
    Ok(payout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingChannel;
    use crate::types::{Chain, Coin, TransferKey};
    use rust_decimal::Decimal;

    fn payout(id: &str, user: &str, minutes_ago: i64) -> PendingPayout {
        PendingPayout {
            claim_id: id.to_string(),
            source_token_id: format!("tok-{id}"),
            beneficiary_user_id: UserId::from(user),
            beneficiary_username: user.to_string(),
            source_transfer: TransferKey::new(Chain::Base, &format!("0x{id}")),
            source_coin: Coin::Eth,
            source_amount: Decimal::ONE,
            source_value_in_reference_currency: Decimal::from(3500),
            payout_coin: Coin::Zec,
            payout_amount: Decimal::from(77),
            payout_address: crate::test_utils::zcash_address('a'),
            status: PayoutStatus::Pending,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            resolved_at: None,
            resolved_by: None,
            approval_proof: None,
            rejection_reason: None,
            refund_reference: None,
        }
    }

    fn queue() -> (PayoutQueue, RecordingChannel, Store) {
        let store = Store::temporary().unwrap();
        let channel = RecordingChannel::default();
        let q = PayoutQueue::new(store.clone(), Arc::new(channel.clone()), DEFAULT_MIN_REASON_LEN);
        (q, channel, store)
    }

    #[test]
    fn test_refund_sentinels() {
        assert_eq!(normalize_refund_reference(Some("none")), None);
        assert_eq!(normalize_refund_reference(Some(" N/A ")), None);
        assert_eq!(normalize_refund_reference(Some("-")), None);
        assert_eq!(normalize_refund_reference(Some("")), None);
        assert_eq!(normalize_refund_reference(None), None);
        assert_eq!(normalize_refund_reference(Some("0xrefund")), Some("0xrefund".to_string()));
    }

    #[test]
    fn test_list_pending_oldest_first() {
        let (q, _, _) = queue();
        q.enqueue(payout("b", "u1", 5)).unwrap();
        q.enqueue(payout("a", "u2", 10)).unwrap();
        q.enqueue(payout("c", "u1", 1)).unwrap();
        let ids: Vec<String> = q.list_pending().unwrap().into_iter().map(|p| p.claim_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(q.list_for_user(&UserId::from("u1")).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_approve_sets_terminal_fields_and_credits() {
        let (q, channel, store) = queue();
        q.enqueue(payout("p1", "alice", 1)).unwrap();

        let approved = q.approve("p1", "zec-txid-1", &UserId::from("op")).await.unwrap();
        assert_eq!(approved.status, PayoutStatus::Approved);
        assert_eq!(approved.approval_proof.as_deref(), Some("zec-txid-1"));
        assert!(approved.resolved_at.is_some());

        let stored = q.get("p1").unwrap().unwrap();
        assert_eq!(stored, approved);

        let account: crate::types::UserAccount =
            store::get_json(&store.users, b"alice").unwrap().unwrap();
        assert_eq!(account.total_received, Decimal::from(77));

        let sent = channel.messages_for(&UserId::from("alice"));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("zec-txid-1"));
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let (q, _, _) = queue();
        q.enqueue(payout("p1", "alice", 1)).unwrap();
        q.enqueue(payout("p2", "bob", 1)).unwrap();
        let op = UserId::from("op");

        q.approve("p1", "tx", &op).await.unwrap();
        assert!(matches!(
            q.approve("p1", "tx2", &op).await,
            Err(ApprovalError::NotPending(PayoutStatus::Approved))
        ));
        assert!(matches!(
            q.reject("p1", "duplicate", None, &op).await,
            Err(ApprovalError::NotPending(PayoutStatus::Approved))
        ));

        q.reject("p2", "duplicate", Some("none"), &op).await.unwrap();
        assert!(matches!(
            q.approve("p2", "tx", &op).await,
            Err(ApprovalError::NotPending(PayoutStatus::Rejected))
        ));
        assert!(matches!(
            q.approve("missing", "tx", &op).await,
            Err(ApprovalError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_reject_validation_and_refund() {
        let (q, channel, _) = queue();
        q.enqueue(payout("p1", "alice", 1)).unwrap();
        let op = UserId::from("op");

        assert!(matches!(
            q.reject("p1", "no", None, &op).await,
            Err(ApprovalError::ReasonTooShort { min: 3 })
        ));
        assert!(matches!(q.approve("p1", "  ", &op).await, Err(ApprovalError::EmptyProof)));
        assert_eq!(q.get("p1").unwrap().unwrap().status, PayoutStatus::Pending);

        let rejected = q.reject("p1", "duplicate", Some("0xabc"), &op).await.unwrap();
        assert_eq!(rejected.rejection_reason.as_deref(), Some("duplicate"));
        assert_eq!(rejected.refund_reference.as_deref(), Some("0xabc"));
        assert!(rejected.approval_proof.is_none());
        assert!(channel.messages_for(&UserId::from("alice"))[0].contains("0xabc"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_single_winner() {
        let (q, _, store) = queue();
        q.enqueue(payout("p1", "alice", 1)).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let op = UserId::from(format!("op{i}").as_str());
                if i % 2 == 0 {
                    q.approve("p1", &format!("tx{i}"), &op).await.is_ok()
                } else {
                    q.reject("p1", "duplicate", None, &op).await.is_ok()
                }
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);

        let account: Option<crate::types::UserAccount> = store::get_json(&store.users, b"alice").unwrap();
        let p = q.get("p1").unwrap().unwrap();
        match p.status {
            PayoutStatus::Approved => assert_eq!(account.unwrap().total_received, Decimal::from(77)),
            PayoutStatus::Rejected => assert!(account.is_none()),
            PayoutStatus::Pending => panic!("still pending"),
        }
    }

    #[test]
    fn test_find_by_prefix() {
        let (q, _, _) = queue();
        q.enqueue(payout("abc123", "u", 1)).unwrap();
        q.enqueue(payout("abd456", "u", 1)).unwrap();
        assert_eq!(q.find("abc").unwrap().unwrap().claim_id, "abc123");
        assert!(q.find("ab").unwrap().is_none());
        assert!(q.find("zzz").unwrap().is_none());
    }
}
