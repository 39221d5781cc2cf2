use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::admin::AdminSessions;
use crate::claims::{ClaimService, ClaimSettings};
use crate::conversion::{ConversionEngine, ConversionPolicy};
use crate::identity::IdentityRegistry;
use crate::ledger::TransferLedger;
use crate::notify::MessagingChannel;
use crate::oracle::PriceOracle;
use crate::orchestrator::Orchestrator;
use crate::payouts::{PayoutQueue, DEFAULT_MIN_REASON_LEN};
use crate::store::Store;
use crate::types::Chain;

/// Knobs the services are built with (resolved from `AppConfig`)
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub claims: ClaimSettings,
    pub conversion: ConversionPolicy,
    pub admin_code: Option<String>,
    pub admin_session_ttl: Duration,
    pub min_reason_len: usize,
    /// Allow claiming a link issued to someone else from the chat surface
    pub chat_allow_sharing: bool,
    /// Redemption through `POST /claim/{id}`
    pub web_redemption: bool,
    /// Deposit addresses shown by /howtoget
    pub deposit_addresses: Vec<(Chain, String)>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            claims: ClaimSettings::default(),
            conversion: ConversionPolicy::default(),
            admin_code: None,
            admin_session_ttl: Duration::hours(24),
            min_reason_len: DEFAULT_MIN_REASON_LEN,
            chat_allow_sharing: true,
            web_redemption: false,
            deposit_addresses: Vec::new(),
        }
    }
}

/// Every service, constructed once at startup and shared by the chat
/// surface, the HTTP view and the watcher pipeline
pub struct AppState {
    pub store: Store,
    pub ledger: TransferLedger,
    pub identity: IdentityRegistry,
    pub claims: ClaimService,
    pub payouts: PayoutQueue,
    pub admin: AdminSessions,
    pub conversion: ConversionEngine,
    pub oracle: Arc<dyn PriceOracle>,
    pub channel: Arc<dyn MessagingChannel>,
    pub orchestrator: Arc<Orchestrator>,
    pub options: ServiceOptions,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        store: Store,
        oracle: Arc<dyn PriceOracle>,
        channel: Arc<dyn MessagingChannel>,
        options: ServiceOptions,
    ) -> Self {
        let ledger = TransferLedger::new(store.clone());
        let identity = IdentityRegistry::new(store.clone());
        let conversion = ConversionEngine::new(oracle.clone(), options.conversion.clone());
        let claims = ClaimService::new(
            store.clone(),
            ledger.clone(),
            identity.clone(),
            conversion.clone(),
            options.claims.clone(),
        );
        let payouts = PayoutQueue::new(store.clone(), channel.clone(), options.min_reason_len);
        let admin = AdminSessions::new(store.clone(), options.admin_code.clone(), options.admin_session_ttl);
        let orchestrator = Arc::new(Orchestrator::new(
            ledger.clone(),
            identity.clone(),
            claims.clone(),
            conversion.clone(),
            admin.clone(),
            channel.clone(),
        )
        .with_link_sharing(options.chat_allow_sharing));

        Self {
            store,
            ledger,
            identity,
            claims,
            payouts,
            admin,
            conversion,
            oracle,
            channel,
            orchestrator,
            options,
            started_at: Utc::now(),
        }
    }
}
