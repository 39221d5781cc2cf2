//! Command layer: chat input -> core operations -> reply text
//!
//! Transport-agnostic. The Telegram loop (or a test) builds an `Inbound`,
//! calls `CommandRouter::handle` and delivers the returned `Reply` to the
//! sender. Side effects on other users (payout outcomes, operator
//! announcements) go through the messaging channel inside the services.

use std::sync::Arc;

use crate::admin::PendingStep;
use crate::app_state::AppState;
use crate::claims::extract_token_id;
use crate::error::{AdminError, ApprovalError, StoreError, GENERIC_FAILURE};
use crate::identity::Registration;
use crate::notify::Action;
use crate::types::{PayoutStatus, PendingPayout, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `/name arg arg`
    Command { name: String, args: Vec<String> },
    /// Free text (admin code, dialogue answers)
    Text(String),
    /// Button payload
    Action(String),
}

impl Input {
    /// Parse a chat message. `/claim@ZlinkBot x` is the same as `/claim x`.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let Some(rest) = text.strip_prefix('/') else {
            return Input::Text(text.to_string());
        };
        let mut parts = rest.split_whitespace();
        let head = parts.next().unwrap_or("");
        let name = head.split('@').next().unwrap_or("").to_ascii_lowercase();
        Input::Command {
            name,
            args: parts.map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub user_id: UserId,
    pub username: Option<String>,
    pub input: Input,
}

impl Inbound {
    pub fn text(user_id: impl Into<UserId>, username: Option<&str>, text: &str) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.map(str::to_string),
            input: Input::parse(text),
        }
    }

    pub fn action(user_id: impl Into<UserId>, username: Option<&str>, payload: &str) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.map(str::to_string),
            input: Input::Action(payload.to_string()),
        }
    }

    fn display_name(&self) -> String {
        self.username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub actions: Vec<Vec<Action>>,
    /// Remove the inbound message from the chat (it carried a secret)
    pub delete_input: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_actions(mut self, actions: Vec<Vec<Action>>) -> Self {
        self.actions = actions;
        self
    }
}

fn main_menu() -> Vec<Vec<Action>> {
    vec![
        vec![
            Action::new("💰 Get ZEC", "menu_howtoget"),
            Action::new("💼 My Wallets", "menu_mywallets"),
        ],
        vec![
            Action::new("📊 My Stats", "menu_mystats"),
            Action::new("❓ Help", "menu_help"),
        ],
    ]
}

/// Approve / reject / view buttons for one payout
pub fn payout_actions(claim_id: &str) -> Vec<Vec<Action>> {
    vec![
        vec![
            Action::new("✅ Approve", format!("admin_approve_{}", claim_id)),
            Action::new("❌ Reject", format!("admin_reject_{}", claim_id)),
        ],
        vec![Action::new("🔍 Details", format!("admin_view_{}", claim_id))],
    ]
}

/// Multi-line payout description for operators
pub fn render_payout(p: &PendingPayout) -> String {
    let mut out = format!(
        "🆔 Claim: {}\n\
         👤 User: @{} ({})\n\
         💰 Sent: {} {} ({})\n\
         💵 Value: ${}\n\
         💎 Payout: {} {}\n\
         📍 To: {}\n\
         📅 Created: {}\n\
         📊 Status: {}",
        p.claim_id,
        p.beneficiary_username,
        p.beneficiary_user_id,
        p.source_amount,
        p.source_coin,
        p.source_transfer.short_ref(),
        p.source_value_in_reference_currency.round_dp(2),
        p.payout_amount,
        p.payout_coin,
        p.payout_address,
        p.created_at.format("%Y-%m-%d %H:%M UTC"),
        p.status,
    );
    if let Some(proof) = &p.approval_proof {
        out.push_str(&format!("\n🔗 Proof: {}", proof));
    }
    if let Some(reason) = &p.rejection_reason {
        out.push_str(&format!("\n📝 Reason: {}", reason));
    }
    if let Some(refund) = &p.refund_reference {
        out.push_str(&format!("\n↩️ Refund: {}", refund));
    }
    out
}

pub struct CommandRouter {
    state: Arc<AppState>,
}

impl CommandRouter {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn handle(&self, inbound: &Inbound) -> Reply {
        match &inbound.input {
            Input::Command { name, args } => self.command(inbound, name, args).await,
            Input::Text(text) => self.free_text(inbound, text).await,
            Input::Action(payload) => self.action(inbound, payload).await,
        }
    }

    async fn command(&self, inbound: &Inbound, name: &str, args: &[String]) -> Reply {
        let user = &inbound.user_id;
        match name {
            "start" => self.start(inbound),
            "help" => help(),
            "howtoget" => self.how_to_get(),
            "register" => self.register(inbound, args.first().map(String::as_str)),
            "mywallets" => self.my_wallets(user),
            "setaddress" => self.set_address(inbound, args.first().map(String::as_str)),
            "myaddress" => self.my_address(user),
            "mystats" => self.my_stats(user),
            "claim" => self.claim(inbound, args).await,
            "pending" => self.admin(user, |op| self.pending_panel(op)),
            "view" => match args.first() {
                Some(id) => self.admin(user, |_| self.view(id)),
                None => Reply::text("Usage: /view <claim id>"),
            },
            "approve" => match args.first() {
                Some(id) => self.begin_approve(user, id),
                None => Reply::text("Usage: /approve <claim id>"),
            },
            "reject" => match args.first() {
                Some(id) => self.begin_reject(user, id),
                None => Reply::text("Usage: /reject <claim id>"),
            },
            "cancel" => self.cancel(user),
            "exit" => self.exit(user),
            "reconcile" => self.reconcile(user).await,
            _ => Reply::text("Unknown command. Send /help to see what I can do."),
        }
    }

    async fn action(&self, inbound: &Inbound, payload: &str) -> Reply {
        let user = &inbound.user_id;
        if let Some(id) = payload.strip_prefix("admin_approve_") {
            return self.begin_approve(user, id);
        }
        if let Some(id) = payload.strip_prefix("admin_reject_") {
            return self.begin_reject(user, id);
        }
        if let Some(id) = payload.strip_prefix("admin_view_") {
            return self.admin(user, |_| self.view(id));
        }
        match payload {
            "admin_refresh" => self.admin(user, |op| self.pending_panel(op)),
            "admin_exit" => self.exit(user),
            "admin_cancel" => self.cancel(user),
            "menu_main" | "menu_start" => self.start(inbound),
            "menu_help" => help(),
            "menu_howtoget" => self.how_to_get(),
            "menu_howto_claim" => self.how_to_claim(),
            "menu_register" => Reply::text(
                "📝 Register the wallet you send from:\n\n\
                 /register 0xYourAddress  (Ethereum / Base / BNB)\n\
                 /register YourSolanaAddress\n\
                 /register bc1YourBitcoinAddress",
            ),
            "menu_mywallets" => self.my_wallets(user),
            "menu_setaddress" | "menu_settings" => Reply::text(
                "⚙️ Set the Zcash address payouts go to:\n\n/setaddress t1YourZcashAddress\n\n\
                 Supported: t1/t3 (transparent), zs/zc (shielded), u1 (unified).",
            ),
            "menu_myaddress" => self.my_address(user),
            "menu_mystats" => self.my_stats(user),
            other => {
                tracing::debug!(user = %user, payload = %other, "[TELEGRAM] Unknown action payload");
                Reply::text("This button is no longer available.")
            }
        }
    }

    async fn free_text(&self, inbound: &Inbound, text: &str) -> Reply {
        let user = &inbound.user_id;
        if self.state.admin.is_activation_code(text) {
            let mut reply = match self.state.admin.activate(user, text) {
                Ok(_) => {
                    let mut panel = self.pending_panel(user);
                    panel.text = format!("🔐 Admin mode activated.\n\n{}", panel.text);
                    panel
                }
                Err(e) => Reply::text(e.user_message()),
            };
            reply.delete_input = true;
            return reply;
        }

        match self.state.admin.session(user) {
            Ok(Some(session)) if !session.pending_step.is_idle() => {
                return self.continue_dialogue(user, session.pending_step, text).await;
            }
            Ok(_) => {}
            Err(e) => return store_failure(e),
        }

        // a pasted claim link with nothing else
        if text.contains(&format!("/{}/", crate::claims::CLAIM_PATH_MARKER)) {
            if let Some(token) = extract_token_id(text) {
                return Reply::text(format!(
                    "To claim this link send:\n/claim {} <zcash_address>",
                    token
                ));
            }
        }
        Reply::text("I didn't understand that. Send /help to see what I can do.")
            .with_actions(main_menu())
    }

    fn start(&self, inbound: &Inbound) -> Reply {
        if let Err(e) = self
            .state
            .identity
            .upsert_user(&inbound.user_id, &inbound.display_name())
        {
            return store_failure(e);
        }
        Reply::text(
            "🎉 Welcome to ZLink!\n\n\
             Send crypto from Ethereum, Base, BNB Chain, Solana or Bitcoin and receive ZEC via a claim link.\n\n\
             How it works:\n\
             1. Register your sender wallet with /register\n\
             2. Set your ZEC address with /setaddress\n\
             3. Send crypto to one of our deposit addresses (/howtoget)\n\
             4. Receive your claim link and redeem it with /claim",
        )
        .with_actions(main_menu())
    }

    fn how_to_get(&self) -> Reply {
        let addresses = &self.state.options.deposit_addresses;
        if addresses.is_empty() {
            return Reply::text("No deposit addresses are configured right now. Please check back later.");
        }
        let policy = self.state.conversion.policy();
        let mut text = String::from("💰 How to get ZEC\n\nSend to one of these addresses:\n");
        for (chain, address) in addresses {
            text.push_str(&format!("\n{} ({}):\n{}\n", chain.display_name(), chain.native_coin(), address));
        }
        text.push_str(&format!(
            "\nMinimum deposit value: ${}\nFee: {}%\n\n\
             Only deposits from a registered wallet can be matched to you, so /register first!",
            policy.minimum_value.round_dp(2),
            (policy.fee_rate * rust_decimal::Decimal::from(100)).normalize(),
        ));
        Reply::text(text)
    }

    fn register(&self, inbound: &Inbound, wallet: Option<&str>) -> Reply {
        let Some(wallet) = wallet else {
            return Reply::text(
                "❌ Please provide your wallet address.\n\n\
                 Usage:\n/register 0xYourAddress\n/register YourSolanaAddress\n/register bc1YourBitcoinAddress",
            );
        };
        if let Err(e) = self
            .state
            .identity
            .upsert_user(&inbound.user_id, &inbound.display_name())
        {
            return store_failure(e);
        }
        match self.state.identity.register_wallet(&inbound.user_id, wallet) {
            Ok(Registration::Registered(kind)) => Reply::text(format!(
                "✅ Wallet registered!\n\nAddress: {}\nType: {}\n\n\
                 Deposits from this wallet will now be matched to you.",
                wallet.trim(),
                kind
            ))
            .with_actions(vec![vec![
                Action::new("💰 How to Get ZEC", "menu_howtoget"),
                Action::new("⚙️ Set ZEC Address", "menu_setaddress"),
            ]]),
            Ok(Registration::AlreadyOwned(_)) => {
                Reply::text("ℹ️ This wallet is already registered to you.")
            }
            Err(e) => Reply::text(e.user_message()),
        }
    }

    fn my_wallets(&self, user: &UserId) -> Reply {
        match self.state.identity.wallets_for_user(user) {
            Ok(wallets) if wallets.is_empty() => Reply::text(
                "You haven't registered any wallets yet.\n\nUse /register <wallet> to add one.",
            ),
            Ok(wallets) => {
                let mut text = String::from("💼 Your registered wallets:\n");
                for (i, w) in wallets.iter().enumerate() {
                    text.push_str(&format!(
                        "\n{}. {}\n   📅 {}",
                        i + 1,
                        crate::address::short_address(&w.wallet_address),
                        w.created_at.format("%Y-%m-%d")
                    ));
                }
                Reply::text(text)
            }
            Err(e) => store_failure(e),
        }
    }

    fn set_address(&self, inbound: &Inbound, address: Option<&str>) -> Reply {
        let Some(address) = address else {
            return Reply::text("❌ Please provide a Zcash address.\n\nUsage: /setaddress t1YourZcashAddress");
        };
        if let Err(e) = self
            .state
            .identity
            .upsert_user(&inbound.user_id, &inbound.display_name())
        {
            return store_failure(e);
        }
        match self.state.identity.set_payout_address(&inbound.user_id, address) {
            Ok(()) => Reply::text(format!(
                "✅ Zcash address saved!\n\n{}\n\n/claim will use it when you don't give an address.",
                address.trim()
            )),
            Err(e) => Reply::text(e.user_message()),
        }
    }

    fn my_address(&self, user: &UserId) -> Reply {
        match self.state.identity.get_user(user) {
            Ok(Some(account)) => match account.payout_address {
                Some(addr) => Reply::text(format!("💼 Your Zcash address:\n\n{}", addr)),
                None => Reply::text("You haven't set a Zcash address yet.\n\nUse /setaddress t1YourZcashAddress"),
            },
            Ok(None) => Reply::text("You haven't set a Zcash address yet.\n\nUse /setaddress t1YourZcashAddress"),
            Err(e) => store_failure(e),
        }
    }

    fn my_stats(&self, user: &UserId) -> Reply {
        let account = match self.state.identity.get_user(user) {
            Ok(Some(a)) => a,
            Ok(None) => return Reply::text("No statistics yet. Send /start to get going."),
            Err(e) => return store_failure(e),
        };
        let wallets = match self.state.identity.wallets_for_user(user) {
            Ok(w) => w.len(),
            Err(e) => return store_failure(e),
        };
        let payouts = match self.state.payouts.list_for_user(user) {
            Ok(p) => p,
            Err(e) => return store_failure(e),
        };
        let count = |status: PayoutStatus| payouts.iter().filter(|p| p.status == status).count();
        Reply::text(format!(
            "📊 Your statistics\n\n\
             👤 @{}\n\
             💰 Total received: {} {}\n\
             🔗 Registered wallets: {}\n\
             💼 ZEC address: {}\n\
             ⏳ Pending claims: {}\n\
             ✅ Approved: {}\n\
             ❌ Rejected: {}\n\
             📅 Member since: {}",
            account.display_name,
            account.total_received,
            self.state.conversion.policy().payout_coin,
            wallets,
            if account.payout_address.is_some() { "set" } else { "not set" },
            count(PayoutStatus::Pending),
            count(PayoutStatus::Approved),
            count(PayoutStatus::Rejected),
            account.created_at.format("%Y-%m-%d"),
        ))
    }

    async fn claim(&self, inbound: &Inbound, args: &[String]) -> Reply {
        let Some(code) = args.first() else {
            return self.how_to_claim();
        };
        let Some(token_id) = extract_token_id(code) else {
            return Reply::text("❌ That doesn't look like a claim code or link.");
        };

        let address = match args.get(1) {
            Some(a) => a.clone(),
            None => match self.state.identity.get_user(&inbound.user_id) {
                Ok(Some(account)) => match account.payout_address {
                    Some(a) => a,
                    None => return missing_address(&token_id),
                },
                Ok(None) => return missing_address(&token_id),
                Err(e) => return store_failure(e),
            },
        };

        let result = self
            .state
            .orchestrator
            .redeem(
                &token_id,
                &inbound.user_id,
                &inbound.display_name(),
                &address,
                self.state.options.chat_allow_sharing,
            )
            .await;
        match result {
            Ok(payout) => Reply::text(format!(
                "✅ Claim submitted!\n\n\
                 💰 Amount: {} {}\n\
                 📍 To: {}\n\
                 🆔 Claim: {}\n\n\
                 Your payout is waiting for approval. We'll message you when it is sent.",
                payout.payout_amount,
                payout.payout_coin,
                payout.payout_address,
                payout.short_id()
            )),
            Err(e) => {
                tracing::info!(user = %inbound.user_id, token = %token_id, "[CLAIMS] Redemption refused: {}", e);
                Reply::text(format!("❌ Claim failed\n\n{}", e.user_message()))
            }
        }
    }

    /// Run `f` for an operator with a live session
    fn admin(&self, user: &UserId, f: impl FnOnce(&UserId) -> Reply) -> Reply {
        match self.state.admin.require(user) {
            Ok(_) => f(user),
            Err(e) => Reply::text(e.user_message()),
        }
    }

    fn pending_panel(&self, _operator: &UserId) -> Reply {
        let pending = match self.state.payouts.list_pending() {
            Ok(p) => p,
            Err(e) => return store_failure(e),
        };
        let mut text = format!("🔐 ADMIN PANEL\n\n📋 Pending claims: {}\n", pending.len());
        let mut actions = Vec::new();
        if pending.is_empty() {
            text.push_str("\n✅ Nothing waiting for approval.");
        } else {
            for (i, p) in pending.iter().enumerate() {
                text.push_str(&format!(
                    "\n{}. [{}] {} ${} → {} {} (@{})",
                    i + 1,
                    p.short_id(),
                    p.source_coin,
                    p.source_value_in_reference_currency.round_dp(2),
                    p.payout_amount,
                    p.payout_coin,
                    p.beneficiary_username
                ));
                actions.push(vec![Action::new(
                    format!("{}. {} → {} {}", i + 1, p.source_coin, p.payout_amount, p.payout_coin),
                    format!("admin_view_{}", p.claim_id),
                )]);
            }
        }
        text.push_str("\n\nCommands: /view <id>, /approve <id>, /reject <id>, /reconcile, /exit");
        actions.push(vec![
            Action::new("🔄 Refresh", "admin_refresh"),
            Action::new("🚪 Exit Admin", "admin_exit"),
        ]);
        Reply::text(text).with_actions(actions)
    }

    fn view(&self, id: &str) -> Reply {
        match self.state.payouts.find(id) {
            Ok(Some(p)) => {
                let actions = if p.status == PayoutStatus::Pending {
                    let mut a = payout_actions(&p.claim_id);
                    a.truncate(1);
                    a.push(vec![Action::new("← Back to Panel", "admin_refresh")]);
                    a
                } else {
                    vec![vec![Action::new("← Back to Panel", "admin_refresh")]]
                };
                Reply::text(format!("🔐 CLAIM DETAILS\n\n{}", render_payout(&p))).with_actions(actions)
            }
            Ok(None) => Reply::text(ApprovalError::NotFound.user_message()),
            Err(e) => store_failure(e),
        }
    }

    /// Resolve a (possibly short) id to a pending payout for a new dialogue
    fn pending_target(&self, id: &str) -> Result<PendingPayout, AdminError> {
        let payout = self.state.payouts.find(id)?.ok_or(ApprovalError::NotFound)?;
        if payout.status != PayoutStatus::Pending {
            return Err(ApprovalError::NotPending(payout.status).into());
        }
        Ok(payout)
    }

    fn begin_approve(&self, user: &UserId, id: &str) -> Reply {
        let result = self.state.admin.require(user).and_then(|_| {
            let payout = self.pending_target(id)?;
            self.state.admin.begin(
                user,
                PendingStep::AwaitingApprovalProof {
                    claim_id: payout.claim_id.clone(),
                },
            )?;
            Ok(payout)
        });
        match result {
            Ok(p) => Reply::text(format!(
                "✅ Approving claim {}\n\nSend {} {} to:\n{}\n\n\
                 Then reply with the payout transaction id, or /cancel.",
                p.short_id(),
                p.payout_amount,
                p.payout_coin,
                p.payout_address
            ))
            .with_actions(vec![vec![Action::new("✖️ Cancel", "admin_cancel")]]),
            Err(e) => Reply::text(e.user_message()),
        }
    }

    fn begin_reject(&self, user: &UserId, id: &str) -> Reply {
        let result = self.state.admin.require(user).and_then(|_| {
            let payout = self.pending_target(id)?;
            self.state.admin.begin(
                user,
                PendingStep::AwaitingRejectionReason {
                    claim_id: payout.claim_id.clone(),
                },
            )?;
            Ok(payout)
        });
        match result {
            Ok(p) => Reply::text(format!(
                "❌ Rejecting claim {}\n\nReply with the reason (at least {} characters), or /cancel.",
                p.short_id(),
                self.state.payouts.min_reason_len()
            ))
            .with_actions(vec![vec![Action::new("✖️ Cancel", "admin_cancel")]]),
            Err(e) => Reply::text(e.user_message()),
        }
    }

    async fn continue_dialogue(&self, user: &UserId, step: PendingStep, text: &str) -> Reply {
        match &step {
            PendingStep::None => Reply::default(),
            PendingStep::AwaitingApprovalProof { claim_id } => {
                match self.state.payouts.approve(claim_id, text, user).await {
                    Ok(p) => {
                        self.finish_step(user, &step);
                        Reply::text(format!(
                            "✅ Claim {} approved.\n\n@{} has been notified.\nPayout: {} {}",
                            p.short_id(),
                            p.beneficiary_username,
                            p.payout_amount,
                            p.payout_coin
                        ))
                        .with_actions(vec![vec![Action::new("← Back to Panel", "admin_refresh")]])
                    }
                    Err(e) => self.dialogue_error(user, &step, e),
                }
            }
            PendingStep::AwaitingRejectionReason { claim_id } => {
                let reason = text.trim();
                let min = self.state.payouts.min_reason_len();
                if reason.chars().count() < min {
                    return Reply::text(ApprovalError::ReasonTooShort { min }.user_message());
                }
                let next = PendingStep::AwaitingRefundReference {
                    claim_id: claim_id.clone(),
                    reason: reason.to_string(),
                };
                match self.state.admin.advance(user, &step, next) {
                    Ok(_) => Reply::text(
                        "↩️ If you refunded the deposit, reply with the refund transaction id.\n\
                         Otherwise reply \"none\".",
                    )
                    .with_actions(vec![vec![Action::new("✖️ Cancel", "admin_cancel")]]),
                    Err(e) => Reply::text(e.user_message()),
                }
            }
            PendingStep::AwaitingRefundReference { claim_id, reason } => {
                match self.state.payouts.reject(claim_id, reason, Some(text), user).await {
                    Ok(p) => {
                        self.finish_step(user, &step);
                        let refund = p.refund_reference.as_deref().unwrap_or("none");
                        Reply::text(format!(
                            "❌ Claim {} rejected.\n\n@{} has been notified.\nReason: {}\nRefund: {}",
                            p.short_id(),
                            p.beneficiary_username,
                            reason,
                            refund
                        ))
                        .with_actions(vec![vec![Action::new("← Back to Panel", "admin_refresh")]])
                    }
                    Err(e) => self.dialogue_error(user, &step, e),
                }
            }
        }
    }

    /// Input errors keep the step so the operator can retry; a claim that
    /// vanished or was resolved elsewhere ends the dialogue.
    fn dialogue_error(&self, user: &UserId, step: &PendingStep, err: ApprovalError) -> Reply {
        if matches!(err, ApprovalError::NotFound | ApprovalError::NotPending(_)) {
            self.finish_step(user, step);
        }
        Reply::text(err.user_message())
    }

    fn finish_step(&self, user: &UserId, step: &PendingStep) {
        if let Err(e) = self.state.admin.advance(user, step, PendingStep::None) {
            tracing::warn!(operator = %user, "[ADMIN] Could not clear dialogue step: {}", e);
        }
    }

    fn cancel(&self, user: &UserId) -> Reply {
        match self.state.admin.cancel(user) {
            Ok(PendingStep::None) => Reply::text("Nothing to cancel."),
            Ok(previous) => Reply::text(format!(
                "✖️ Cancelled action on claim {}.",
                previous.claim_id().unwrap_or("?")
            ))
            .with_actions(vec![vec![Action::new("← Back to Panel", "admin_refresh")]]),
            Err(e) => Reply::text(e.user_message()),
        }
    }

    fn exit(&self, user: &UserId) -> Reply {
        match self.state.admin.end(user) {
            Ok(true) => Reply::text("👋 Exited admin mode.").with_actions(main_menu()),
            Ok(false) => Reply::text(AdminError::NoSession.user_message()),
            Err(e) => store_failure(e),
        }
    }

    async fn reconcile(&self, user: &UserId) -> Reply {
        if let Err(e) = self.state.admin.require(user) {
            return Reply::text(e.user_message());
        }
        match self.state.orchestrator.reconcile_unprocessed().await {
            Ok(report) => Reply::text(format!(
                "🔁 Reconciliation finished\n\nMatched: {}\nStill unattributed: {}\nFailed: {}",
                report.attributed, report.still_unattributed, report.failed
            )),
            Err(e) => store_failure(e),
        }
    }

    fn how_to_claim(&self) -> Reply {
        claim_instructions(
            self.state.options.claims.ttl.num_hours(),
            self.state.options.chat_allow_sharing,
        )
    }
}

fn store_failure(e: StoreError) -> Reply {
    tracing::error!("[STORE] Command failed: {}", e);
    Reply::text(GENERIC_FAILURE)
}

fn missing_address(token_id: &str) -> Reply {
    Reply::text(format!(
        "❌ Please provide your Zcash address.\n\nUsage:\n/claim {} t1YourZcashAddress\n\n\
         Or save one first with /setaddress.",
        token_id
    ))
}

fn help() -> Reply {
    Reply::text(
        "❓ ZLink Help\n\n\
         /start - Start the bot\n\
         /howtoget - Where to send crypto\n\
         /register <wallet> - Register your sender wallet\n\
         /mywallets - Your registered wallets\n\
         /setaddress <address> - Set your ZEC address\n\
         /myaddress - Show your ZEC address\n\
         /mystats - Your statistics\n\
         /claim <code> [address] - Claim ZEC with a claim code or link\n\n\
         Zcash address formats: t1/t3 (transparent), zs/zc (shielded), u1 (unified).",
    )
    .with_actions(main_menu())
}

fn claim_instructions(ttl_hours: i64, sharing: bool) -> Reply {
    let who = if sharing {
        "✨ Links can be shared: whoever claims first receives the payout."
    } else {
        "👤 Only the user a link was issued to can claim it."
    };
    Reply::text(format!(
        "🎁 How to claim\n\n\
         /claim <code> <zcash_address>\n\
         /claim <code>   (uses your saved address)\n\n\
         You can paste the whole claim link instead of the code.\n\n\
         {}\n\
         ⏰ Links expire {} hours after they are issued.\n\
         🔒 A link can only be claimed once.",
        who, ttl_hours
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{zcash_address, TestApp, ADMIN_CODE};
    use crate::types::{Chain, TransferEvent};
    use rust_decimal::Decimal;

    const SENDER: &str = "0x1111111111111111111111111111111111111111";

    fn router(app: &TestApp) -> CommandRouter {
        CommandRouter::new(app.state.clone())
    }

    async fn say(router: &CommandRouter, user: &str, text: &str) -> Reply {
        router.handle(&Inbound::text(user, Some(user), text)).await
    }

    /// Registered user with one issued token; returns the token id
    async fn funded(app: &TestApp, user: &str, tx: &str) -> String {
        let r = router(app);
        say(&r, user, &format!("/register {}", SENDER)).await;
        let event = TransferEvent {
            tx_ref: tx.to_string(),
            chain: Chain::Base,
            from_address: SENDER.to_string(),
            to_address: "0x742d35cc6634c0532925a3b844bc454e4438f44e".to_string(),
            amount: Decimal::ONE,
        };
        match app.orchestrator.handle_event(&event).await.unwrap() {
            crate::orchestrator::EventOutcome::Issued(t) => t.token_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(
            Input::parse("/claim@ZlinkBot abc  t1x"),
            Input::Command {
                name: "claim".into(),
                args: vec!["abc".into(), "t1x".into()]
            }
        );
        assert_eq!(Input::parse("  hello "), Input::Text("hello".into()));
        assert_eq!(
            Input::parse("/START"),
            Input::Command { name: "start".into(), args: vec![] }
        );
    }

    #[tokio::test]
    async fn test_register_conflict_message() {
        let app = TestApp::new();
        let r = router(&app);
        assert!(say(&r, "1", &format!("/register {}", SENDER)).await.text.contains("registered"));
        let again = say(&r, "1", &format!("/register {}", SENDER.to_uppercase().replace("0X", "0x"))).await;
        assert!(again.text.contains("already registered to you"));
        let other = say(&r, "2", &format!("/register {}", SENDER)).await;
        assert!(other.text.contains("another user"));
        let bad = say(&r, "2", "/register hello").await;
        assert!(bad.text.starts_with("❌"));
    }

    #[tokio::test]
    async fn test_claim_uses_saved_address() {
        let app = TestApp::new();
        let r = router(&app);
        let token = funded(&app, "1", "0xaa").await;

        let no_addr = say(&r, "1", &format!("/claim {}", token)).await;
        assert!(no_addr.text.contains("provide your Zcash address"));

        say(&r, "1", &format!("/setaddress {}", zcash_address('c'))).await;
        let url = app.claims.claim_url(&token);
        let ok = say(&r, "1", &format!("/claim {}", url)).await;
        assert!(ok.text.contains("Claim submitted"), "{}", ok.text);
        assert!(ok.text.contains("77"));

        let twice = say(&r, "1", &format!("/claim {}", token)).await;
        assert!(twice.text.contains("already been claimed"));
    }

    #[tokio::test]
    async fn test_claim_by_someone_else_respects_sharing_flag() {
        let shared = TestApp::new();
        let token = funded(&shared, "1", "0xbb").await;
        let reply = say(&router(&shared), "2", &format!("/claim {} {}", token, zcash_address('d'))).await;
        assert!(reply.text.contains("Claim submitted"));

        let strict = TestApp::with_options(|o| o.chat_allow_sharing = false);
        let token = funded(&strict, "1", "0xbb").await;
        let reply = say(&router(&strict), "2", &format!("/claim {} {}", token, zcash_address('d'))).await;
        assert!(reply.text.contains("can only be claimed by @1"));
    }

    #[tokio::test]
    async fn test_claim_instructions_follow_sharing_flag() {
        let shared = TestApp::new();
        let reply = say(&router(&shared), "1", "/claim").await;
        assert!(reply.text.contains("Links can be shared"));

        let strict = TestApp::with_options(|o| o.chat_allow_sharing = false);
        let r = router(&strict);
        for reply in [
            say(&r, "1", "/claim").await,
            r.handle(&Inbound::action("1", Some("1"), "menu_howto_claim")).await,
        ] {
            assert!(!reply.text.contains("Links can be shared"), "{}", reply.text);
            assert!(reply.text.contains("Only the user a link was issued to"));
        }
    }

    #[tokio::test]
    async fn test_admin_requires_session() {
        let app = TestApp::new();
        let r = router(&app);
        assert!(say(&r, "9", "/pending").await.text.contains("not active"));
        let wrong = say(&r, "9", "let me in").await;
        assert!(!wrong.delete_input);

        let activated = say(&r, "9", ADMIN_CODE).await;
        assert!(activated.delete_input);
        assert!(activated.text.contains("ADMIN PANEL"));
        assert!(say(&r, "9", "/exit").await.text.contains("Exited"));
        assert!(say(&r, "9", "/pending").await.text.contains("not active"));
    }

    #[tokio::test]
    async fn test_approve_dialogue() {
        let app = TestApp::new();
        let r = router(&app);
        let token = funded(&app, "1", "0xcc").await;
        say(&r, "1", &format!("/claim {} {}", token, zcash_address('e'))).await;
        let pending = app.payouts.list_pending().unwrap();
        let claim_id = pending[0].claim_id.clone();

        say(&r, "9", ADMIN_CODE).await;
        let prompt = r
            .handle(&Inbound::action("9", None, &format!("admin_approve_{}", claim_id)))
            .await;
        assert!(prompt.text.contains("transaction id"));

        // second action while one is in progress
        let busy = say(&r, "9", &format!("/reject {}", &claim_id[..8])).await;
        assert!(busy.text.contains("Finish the current action"));

        let done = say(&r, "9", "zec-tx-0001").await;
        assert!(done.text.contains("approved"), "{}", done.text);

        let stored = app.payouts.get(&claim_id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Approved);
        assert_eq!(stored.approval_proof.as_deref(), Some("zec-tx-0001"));
        assert!(app.admin.require(&UserId::from("9")).unwrap().pending_step.is_idle());
        assert!(app
            .channel
            .messages_for(&UserId::from("1"))
            .iter()
            .any(|m| m.contains("approved") && m.contains("zec-tx-0001")));

        let stats = say(&r, "1", "/mystats").await;
        assert!(stats.text.contains("Total received: 77"));
    }

    #[tokio::test]
    async fn test_reject_dialogue_normalizes_refund() {
        let app = TestApp::new();
        let r = router(&app);
        let token = funded(&app, "1", "0xdd").await;
        say(&r, "1", &format!("/claim {} {}", token, zcash_address('f'))).await;
        let claim_id = app.payouts.list_pending().unwrap()[0].claim_id.clone();

        say(&r, "9", ADMIN_CODE).await;
        say(&r, "9", &format!("/reject {}", claim_id)).await;
        let short = say(&r, "9", "no").await;
        assert!(short.text.contains("at least 3"));
        let ask_refund = say(&r, "9", "duplicate").await;
        assert!(ask_refund.text.contains("refund"));
        let done = say(&r, "9", "none").await;
        assert!(done.text.contains("rejected"));

        let stored = app.payouts.get(&claim_id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("duplicate"));
        assert_eq!(stored.refund_reference, None);

        // terminal
        let again = say(&r, "9", &format!("/approve {}", claim_id)).await;
        assert!(again.text.contains("already rejected"));
    }

    #[tokio::test]
    async fn test_cancel_returns_to_idle() {
        let app = TestApp::new();
        let r = router(&app);
        let token = funded(&app, "1", "0xee").await;
        say(&r, "1", &format!("/claim {} {}", token, zcash_address('g'))).await;
        let claim_id = app.payouts.list_pending().unwrap()[0].claim_id.clone();

        say(&r, "9", ADMIN_CODE).await;
        say(&r, "9", &format!("/approve {}", claim_id)).await;
        let cancelled = r.handle(&Inbound::action("9", None, "admin_cancel")).await;
        assert!(cancelled.text.contains("Cancelled"));
        assert_eq!(say(&r, "9", "/cancel").await.text, "Nothing to cancel.");
        assert_eq!(
            app.payouts.get(&claim_id).unwrap().unwrap().status,
            PayoutStatus::Pending
        );
    }
}
