//! Test utilities: in-memory stand-ins for the external collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::admin::AdminSessions;
use crate::app_state::{AppState, ServiceOptions};
use crate::claims::ClaimService;
use crate::error::DeliveryError;
use crate::identity::IdentityRegistry;
use crate::ledger::TransferLedger;
use crate::notify::MessagingChannel;
use crate::oracle::StaticPriceOracle;
use crate::orchestrator::Orchestrator;
use crate::payouts::PayoutQueue;
use crate::store::Store;
use crate::types::{Chain, Coin, UserId};

/// Operator activation code configured by `TestApp`
pub const ADMIN_CODE: &str = "open-sesame";

/// Oracle with the prices used throughout the test-suite:
/// ETH $3500, SOL $150, BTC $65000, BNB $600, ZEC $45
pub fn fixed_prices() -> StaticPriceOracle {
    StaticPriceOracle::default()
        .with(Coin::Eth, Decimal::from(3500))
        .with(Coin::Bnb, Decimal::from(600))
        .with(Coin::Sol, Decimal::from(150))
        .with(Coin::Btc, Decimal::from(65000))
        .with(Coin::Zec, Decimal::from(45))
}

/// Channel that records every message instead of sending it
#[derive(Debug, Default, Clone)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<(UserId, String)>>>,
}

impl RecordingChannel {
    pub fn messages(&self) -> Vec<(UserId, String)> {
        self.sent.lock().clone()
    }

    pub fn messages_for(&self, user: &UserId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl MessagingChannel for RecordingChannel {
    async fn send_to_user(&self, user: &UserId, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().push((user.clone(), text.to_string()));
        Ok(())
    }
}

/// Syntactically valid transparent Zcash address for tests
pub fn zcash_address(fill: char) -> String {
    format!("t1{}", fill.to_string().repeat(33))
}

/// Fully wired services over a temporary database
pub struct TestApp {
    pub state: Arc<AppState>,
    pub channel: RecordingChannel,
    pub store: Store,
    pub ledger: TransferLedger,
    pub identity: IdentityRegistry,
    pub claims: ClaimService,
    pub payouts: PayoutQueue,
    pub admin: AdminSessions,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    pub fn with_options(configure: impl FnOnce(&mut ServiceOptions)) -> Self {
        let mut options = ServiceOptions {
            admin_code: Some(ADMIN_CODE.to_string()),
            deposit_addresses: vec![(
                Chain::Base,
                "0x742d35cc6634c0532925a3b844bc454e4438f44e".to_string(),
            )],
            ..ServiceOptions::default()
        };
        configure(&mut options);

        let channel = RecordingChannel::default();
        let store = match Store::temporary() {
            Ok(store) => store,
            Err(e) => panic!("temporary store: {}", e),
        };
        let state = Arc::new(AppState::new(
            store,
            Arc::new(fixed_prices()),
            Arc::new(channel.clone()),
            options,
        ));
        Self {
            channel,
            store: state.store.clone(),
            ledger: state.ledger.clone(),
            identity: state.identity.clone(),
            claims: state.claims.clone(),
            payouts: state.payouts.clone(),
            admin: state.admin.clone(),
            orchestrator: state.orchestrator.clone(),
            state,
        }
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers a chain request: JSON-RPC `(method, params)` or a REST
/// `(path, null)`. `None` makes the server reply 503.
pub type RpcResponder = Arc<dyn Fn(&str, &serde_json::Value) -> Option<serde_json::Value> + Send + Sync>;

/// Local chain endpoint for watcher tests. Serves JSON-RPC on `POST /` and
/// REST on every other path; returns the base URL.
pub async fn spawn_mock_rpc<F>(respond: F) -> String
where
    F: Fn(&str, &serde_json::Value) -> Option<serde_json::Value> + Send + Sync + 'static,
{
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn jsonrpc(State(respond): State<RpcResponder>, Json(body): Json<Value>) -> Response {
        let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = body.get("params").cloned().unwrap_or(Value::Null);
        match respond(method, &params) {
            Some(result) => Json(json!({"jsonrpc": "2.0", "id": body["id"].clone(), "result": result})).into_response(),
            None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }

    async fn rest(State(respond): State<RpcResponder>, uri: Uri) -> Response {
        match respond(uri.path(), &Value::Null) {
            Some(body) => Json(body).into_response(),
            None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        }
    }

    let respond: RpcResponder = Arc::new(respond);
    let app = Router::new().route("/", post(jsonrpc)).fallback(rest).with_state(respond);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Single endpoint, one attempt per call, short timeout
pub fn mock_endpoint(url: &str) -> crate::rpc::RpcEndpointConfig {
    crate::rpc::RpcEndpointConfig {
        timeout_ms: Some(2_000),
        max_retries: Some(0),
        ..crate::rpc::RpcEndpointConfig::new(url)
    }
}

pub fn fast_backoff() -> crate::backoff::BackoffPolicy {
    use std::time::Duration;
    crate::backoff::BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 0.0)
}
