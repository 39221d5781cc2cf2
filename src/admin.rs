//! Operator sessions and the approve/reject dialogue state
//!
//! An operator activates a session by sending the configured code. The
//! session carries a `PendingStep` that only ever moves forward through one
//! action's steps and falls back to `None` on completion, `/cancel` or
//! expiry. Sessions live in the `admin_sessions` tree so a restart does not
//! drop an operator mid-dialogue.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AdminError, StoreError};
use crate::store::{self, Store, TxResult};
use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PendingStep {
    None,
    AwaitingApprovalProof { claim_id: String },
    AwaitingRejectionReason { claim_id: String },
    AwaitingRefundReference { claim_id: String, reason: String },
}

impl PendingStep {
    pub fn claim_id(&self) -> Option<&str> {
        match self {
            PendingStep::None => None,
            PendingStep::AwaitingApprovalProof { claim_id }
            | PendingStep::AwaitingRejectionReason { claim_id }
            | PendingStep::AwaitingRefundReference { claim_id, .. } => Some(claim_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, PendingStep::None)
    }

    /// Whether `next` is a legal successor of `self`
    fn allows(&self, next: &PendingStep) -> bool {
        match (self, next) {
            (_, PendingStep::None) => true,
            (PendingStep::None, PendingStep::AwaitingApprovalProof { .. }) => true,
            (PendingStep::None, PendingStep::AwaitingRejectionReason { .. }) => true,
            (
                PendingStep::AwaitingRejectionReason { claim_id: a },
                PendingStep::AwaitingRefundReference { claim_id: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

/// Per-operator interaction state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSession {
    pub operator_id: UserId,
    pub activated_at: DateTime<Utc>,
    pub session_expires_at: DateTime<Utc>,
    pub pending_step: PendingStep,
}

impl AdminSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.session_expires_at
    }
}

#[derive(Clone)]
pub struct AdminSessions {
    store: Store,
    activation_code: Option<String>,
    ttl: Duration,
}

impl AdminSessions {
    pub fn new(store: Store, activation_code: Option<String>, ttl: Duration) -> Self {
        let activation_code = activation_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if activation_code.is_none() {
            tracing::warn!("[ADMIN] No activation code configured, operator console disabled");
        }
        Self {
            store,
            activation_code,
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.activation_code.is_some()
    }

    /// Exact match against the configured code
    pub fn is_activation_code(&self, text: &str) -> bool {
        match &self.activation_code {
            Some(code) => constant_time_eq(code.as_bytes(), text.trim().as_bytes()),
            None => false,
        }
    }

    pub fn activate(&self, operator: &UserId, code: &str) -> Result<AdminSession, AdminError> {
        if !self.is_activation_code(code) {
            tracing::warn!(operator = %operator, "[ADMIN] Rejected activation attempt");
            return Err(AdminError::InvalidCode);
        }
        let now = Utc::now();
        let session = AdminSession {
            operator_id: operator.clone(),
            activated_at: now,
            session_expires_at: now + self.ttl,
            pending_step: PendingStep::None,
        };
        self.store
            .admin_sessions
            .insert(operator.as_str().as_bytes(), store::encode(&session)?)
            .map_err(StoreError::from)?;
        tracing::info!(operator = %operator, expires = %session.session_expires_at, "[ADMIN] Session activated");
        Ok(session)
    }

    /// Live session, if any. Expired sessions are removed on sight.
    pub fn session(&self, operator: &UserId) -> Result<Option<AdminSession>, StoreError> {
        let key = operator.as_str().as_bytes();
        let Some(session) = store::get_json::<AdminSession>(&self.store.admin_sessions, key)? else {
            return Ok(None);
        };
        if session.is_expired_at(Utc::now()) {
            self.store.admin_sessions.remove(key)?;
            tracing::info!(operator = %operator, "[ADMIN] Session expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub fn require(&self, operator: &UserId) -> Result<AdminSession, AdminError> {
        self.session(operator)?.ok_or(AdminError::NoSession)
    }

    /// Compare-and-set the step. Fails with `StepInProgress` when the stored
    /// step is not `expected` or `next` does not follow it.
    pub fn advance(
        &self,
        operator: &UserId,
        expected: &PendingStep,
        next: PendingStep,
    ) -> Result<AdminSession, AdminError> {
        if !expected.allows(&next) {
            return Err(AdminError::StepInProgress);
        }
        let key = operator.as_str().as_bytes();
        let now = Utc::now();
        self.store
            .admin_sessions
            .transaction(|tx| -> TxResult<AdminSession, AdminError> {
                let Some(bytes) = tx.get(key)? else {
                    return Err(sled::transaction::ConflictableTransactionError::Abort(
                        AdminError::NoSession,
                    ));
                };
                let mut session = store::tx_decode::<AdminSession, AdminError>(&bytes)?;
                if session.is_expired_at(now) {
                    return Err(sled::transaction::ConflictableTransactionError::Abort(
                        AdminError::NoSession,
                    ));
                }
                if session.pending_step != *expected {
                    return Err(sled::transaction::ConflictableTransactionError::Abort(
                        AdminError::StepInProgress,
                    ));
                }
                session.pending_step = next.clone();
                tx.insert(key, store::tx_encode::<_, AdminError>(&session)?)?;
                Ok(session)
            })
            .map_err(store::tx_error)
    }

    /// Start a dialogue from idle
    pub fn begin(&self, operator: &UserId, step: PendingStep) -> Result<AdminSession, AdminError> {
        self.advance(operator, &PendingStep::None, step)
    }

    /// Drop whatever step is in progress; returns the abandoned step
    pub fn cancel(&self, operator: &UserId) -> Result<PendingStep, AdminError> {
        let session = self.require(operator)?;
        if session.pending_step.is_idle() {
            return Ok(PendingStep::None);
        }
        let previous = session.pending_step.clone();
        self.advance(operator, &previous, PendingStep::None)?;
        Ok(previous)
    }

    pub fn end(&self, operator: &UserId) -> Result<bool, StoreError> {
        let removed = self.store.admin_sessions.remove(operator.as_str().as_bytes())?;
        if removed.is_some() {
            tracing::info!(operator = %operator, "[ADMIN] Session ended");
        }
        Ok(removed.is_some())
    }

    /// Operators with a live session (notified when a payout is queued)
    pub fn active_operators(&self) -> Result<Vec<UserId>, StoreError> {
        let now = Utc::now();
        Ok(store::scan_json::<AdminSession>(&self.store.admin_sessions)?
            .into_iter()
            .filter(|s| !s.is_expired_at(now))
            .map(|s| s.operator_id)
            .collect())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions(ttl: Duration) -> AdminSessions {
        AdminSessions::new(Store::temporary().unwrap(), Some("open-sesame".to_string()), ttl)
    }

    #[test]
    fn test_activation() {
        let s = sessions(Duration::hours(24));
        let op = UserId::from("op");
        assert!(matches!(s.activate(&op, "wrong"), Err(AdminError::InvalidCode)));
        assert!(matches!(s.require(&op), Err(AdminError::NoSession)));

        let session = s.activate(&op, " open-sesame ").unwrap();
        assert_eq!(session.pending_step, PendingStep::None);
        assert_eq!(s.require(&op).unwrap().operator_id, op);
        assert_eq!(s.active_operators().unwrap(), vec![op.clone()]);

        assert!(s.end(&op).unwrap());
        assert!(s.session(&op).unwrap().is_none());
    }

    #[test]
    fn test_disabled_without_code() {
        let s = AdminSessions::new(Store::temporary().unwrap(), Some("  ".to_string()), Duration::hours(1));
        assert!(!s.is_enabled());
        assert!(!s.is_activation_code(""));
        assert!(matches!(s.activate(&UserId::from("op"), ""), Err(AdminError::InvalidCode)));
    }

    #[test]
    fn test_rejection_steps_are_sequential() {
        let s = sessions(Duration::hours(24));
        let op = UserId::from("op");
        s.activate(&op, "open-sesame").unwrap();

        let reason_step = PendingStep::AwaitingRejectionReason { claim_id: "c1".into() };
        s.begin(&op, reason_step.clone()).unwrap();

        // cannot start a second action mid-dialogue
        assert!(matches!(
            s.begin(&op, PendingStep::AwaitingApprovalProof { claim_id: "c2".into() }),
            Err(AdminError::StepInProgress)
        ));
        // cannot skip to a refund for a different claim
        assert!(matches!(
            s.advance(
                &op,
                &reason_step,
                PendingStep::AwaitingRefundReference { claim_id: "c2".into(), reason: "dup".into() }
            ),
            Err(AdminError::StepInProgress)
        ));

        let refund_step = PendingStep::AwaitingRefundReference {
            claim_id: "c1".into(),
            reason: "duplicate".into(),
        };
        let session = s.advance(&op, &reason_step, refund_step.clone()).unwrap();
        assert_eq!(session.pending_step.claim_id(), Some("c1"));

        assert_eq!(s.cancel(&op).unwrap(), refund_step);
        assert!(s.require(&op).unwrap().pending_step.is_idle());
        assert_eq!(s.cancel(&op).unwrap(), PendingStep::None);
    }

    #[test]
    fn test_expired_session_is_dropped() {
        let s = sessions(Duration::seconds(-1));
        let op = UserId::from("op");
        s.activate(&op, "open-sesame").unwrap();
        assert!(s.session(&op).unwrap().is_none());
        assert!(matches!(
            s.begin(&op, PendingStep::AwaitingApprovalProof { claim_id: "c".into() }),
            Err(AdminError::NoSession)
        ));
        assert!(s.active_operators().unwrap().is_empty());
    }

    #[test]
    fn test_step_serialization_is_tagged() {
        let step = PendingStep::AwaitingRefundReference {
            claim_id: "c1".into(),
            reason: "dup".into(),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["step"], "awaiting_refund_reference");
        assert_eq!(json["claim_id"], "c1");
        let back: PendingStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
