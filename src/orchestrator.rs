//! Reconciliation orchestrator
//!
//! Turns watcher events into claim tokens:
//!
//! ```text
//! TransferEvent ─► record_if_new ─► resolve_user ─► estimate ─► issue ─► notify ─► mark_processed
//!                      │ dup+processed      │ None
//!                      ▼                    ▼
//!                   Duplicate          Unattributed (processed stays false)
//! ```
//!
//! `processed` is only set after the token exists and the user was told
//! about it, so a crash anywhere in between leaves the record eligible for
//! `reconcile_unprocessed`, which reissues idempotently (`Issuance::Existing`).
//! Redemption also goes through here so operators hear about new payouts.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::admin::AdminSessions;
use crate::claims::{ClaimService, Issuance};
use crate::commands;
use crate::conversion::ConversionEngine;
use crate::error::{RedeemError, StoreError};
use crate::identity::IdentityRegistry;
use crate::ledger::TransferLedger;
use crate::notify::{self, Action, MessagingChannel};
use crate::types::{ClaimToken, PendingPayout, TransferEvent, TransferRecord, UserId};
use crate::watcher::SeenCache;

/// Recently processed transfer keys kept in memory
const PROCESSED_CACHE: usize = 4_096;

#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Already recorded and processed
    Duplicate,
    /// Sender wallet not registered; held for manual reconciliation
    Unattributed,
    Issued(ClaimToken),
    /// Unprocessed record whose token already existed (recovery path)
    AlreadyIssued(ClaimToken),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attributed: usize,
    pub still_unattributed: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    ledger: TransferLedger,
    identity: IdentityRegistry,
    claims: ClaimService,
    conversion: ConversionEngine,
    admin: AdminSessions,
    channel: Arc<dyn MessagingChannel>,
    links_shareable: bool,
    /// Keys known to be processed; skips a ledger round-trip on redelivery
    processed: Mutex<SeenCache>,
}

impl Orchestrator {
    pub fn new(
        ledger: TransferLedger,
        identity: IdentityRegistry,
        claims: ClaimService,
        conversion: ConversionEngine,
        admin: AdminSessions,
        channel: Arc<dyn MessagingChannel>,
    ) -> Self {
        Self {
            ledger,
            identity,
            claims,
            conversion,
            admin,
            channel,
            links_shareable: true,
            processed: Mutex::new(SeenCache::new(PROCESSED_CACHE)),
        }
    }

    /// Whether issuance messages tell users their link can be passed on
    pub fn with_link_sharing(mut self, shareable: bool) -> Self {
        self.links_shareable = shareable;
        self
    }

    pub async fn handle_event(&self, event: &TransferEvent) -> Result<EventOutcome, StoreError> {
        let key = event.key();
        if self.processed.lock().contains(&key.to_string()) {
            return Ok(EventOutcome::Duplicate);
        }

        let inserted = self.ledger.record_if_new(event)?;
        let record = self
            .ledger
            .get(&key)?
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        if !inserted && record.processed {
            self.processed.lock().insert(key.to_string());
            tracing::debug!(chain = %event.chain, tx = %event.tx_ref, "[LEDGER] Duplicate transfer ignored");
            return Ok(EventOutcome::Duplicate);
        }
        if inserted {
            tracing::info!(
                chain = %record.chain,
                tx = %record.tx_ref,
                from = %record.from_address,
                amount = %record.amount,
                "[LEDGER] New transfer recorded"
            );
        }
        self.process_record(&record).await
    }

    async fn process_record(&self, record: &TransferRecord) -> Result<EventOutcome, StoreError> {
        let key = record.key();
        let Some(user_id) = self.identity.resolve_user(&record.from_address)? else {
            tracing::warn!(
                chain = %record.chain,
                tx = %record.tx_ref,
                from = %record.from_address,
                amount = %record.amount,
                "[LEDGER] Unattributed transfer, sender wallet is not registered"
            );
            return Ok(EventOutcome::Unattributed);
        };

        let username = self
            .identity
            .get_user(&user_id)?
            .map(|u| u.display_name)
            .unwrap_or_else(|| user_id.to_string());
        let estimate = self
            .conversion
            .estimate_payout(record.amount, record.chain.native_coin());

        let issuance = self.claims.issue(&user_id, &username, estimate, &key)?;
        self.notify_issued(record, issuance.token()).await;
        self.ledger.mark_processed(&key)?;
        self.processed.lock().insert(key.to_string());

        Ok(match issuance {
            Issuance::Issued(token) => EventOutcome::Issued(token),
            Issuance::Existing(token) => {
                tracing::info!(tx = %record.tx_ref, token = %token.token_id, "[CLAIMS] Reused existing token for transfer");
                EventOutcome::AlreadyIssued(token)
            }
        })
    }

    async fn notify_issued(&self, record: &TransferRecord, token: &ClaimToken) {
        let coin = record.chain.native_coin();
        let payout_coin = self.conversion.policy().payout_coin;
        let url = self.claims.claim_url(&token.token_id);
        let text = format!(
            "🎉 Your {payout} is ready!\n\n\
             💰 Deposit: {amount} {coin} on {chain}\n\
             📝 Transaction: {tx}\n\
             💎 Estimated payout: ~{estimate} {payout} (final amount is set when you claim)\n\n\
             🔑 Code: {token}\n\
             🔗 {url}\n\n\
             Claim it here with:\n/claim {token} <zcash_address>\n\n\
             ⏰ Expires: {expires}\n\
             {sharing}",
            payout = payout_coin,
            amount = record.amount,
            coin = coin,
            chain = record.chain.display_name(),
            tx = record.key().short_ref(),
            estimate = token.reward_amount_at_issuance,
            token = token.token_id,
            url = url,
            expires = token.expires_at.format("%Y-%m-%d %H:%M UTC"),
            sharing = if self.links_shareable {
                "💡 Claim links can be shared with anyone."
            } else {
                "🔒 Only you can redeem this claim."
            },
        );
        let actions = vec![
            vec![Action::new("⚙️ Set ZEC Address", "menu_setaddress")],
            vec![Action::new("❓ How to Claim", "menu_howto_claim")],
        ];
        let delivered = notify::deliver_with_actions(
            self.channel.as_ref(),
            &token.issued_to_user_id,
            &text,
            &actions,
        )
        .await;
        if delivered {
            tracing::info!(user = %token.issued_to_user_id, token = %token.token_id, "[NOTIFY] Claim link sent");
        }
    }

    /// Consume watcher events until every sender is gone
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransferEvent>) {
        while let Some(event) = events.recv().await {
            match self.handle_event(&event).await {
                Ok(EventOutcome::Issued(token)) => {
                    tracing::info!(
                        chain = %event.chain,
                        tx = %event.tx_ref,
                        user = %token.issued_to_user_id,
                        "[CLAIMS] Claim token issued"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    // record stays unprocessed; picked up by the next reconcile
                    tracing::error!(chain = %event.chain, tx = %event.tx_ref, "[LEDGER] Failed to process transfer: {}", e);
                }
            }
        }
        tracing::info!("[LEDGER] Event stream closed");
    }

    /// Re-run attribution for every unprocessed transfer (senders who
    /// registered after depositing, or records left by a crash)
    pub async fn reconcile_unprocessed(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        for record in self.ledger.list_unprocessed()? {
            match self.process_record(&record).await {
                Ok(EventOutcome::Unattributed) => report.still_unattributed += 1,
                Ok(_) => report.attributed += 1,
                Err(e) => {
                    tracing::error!(chain = %record.chain, tx = %record.tx_ref, "[LEDGER] Reconcile failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        tracing::info!(
            attributed = report.attributed,
            unattributed = report.still_unattributed,
            failed = report.failed,
            "[LEDGER] Reconciliation pass finished"
        );
        Ok(report)
    }

    pub fn unattributed(&self) -> Result<Vec<TransferRecord>, StoreError> {
        self.ledger.list_unprocessed()
    }

    /// Redeem a token and tell active operators a payout is waiting
    pub async fn redeem(
        &self,
        token_id: &str,
        redeemer: &UserId,
        redeemer_username: &str,
        payout_address: &str,
        allow_sharing: bool,
    ) -> Result<PendingPayout, RedeemError> {
        let payout = self
            .claims
            .redeem(token_id, redeemer, redeemer_username, payout_address, allow_sharing)?;
        self.announce_payout(&payout).await;
        Ok(payout)
    }

    async fn announce_payout(&self, payout: &PendingPayout) {
        let operators = match self.admin.active_operators() {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!("[ADMIN] Could not list operators: {}", e);
                return;
            }
        };
        if operators.is_empty() {
            return;
        }
        let text = format!("🆕 New claim awaiting approval\n\n{}", commands::render_payout(payout));
        let actions = commands::payout_actions(&payout.claim_id);
        for operator in &operators {
            notify::deliver_with_actions(self.channel.as_ref(), operator, &text, &actions).await;
        }
    }
}
