//! HTTP surface: claim status page, web redemption (behind a flag),
//! health and price diagnostics.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;
use crate::claims::ClaimInfo;
use crate::error::{ConversionError, RedeemError};
use crate::types::UserId;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/claim/:token_id", get(claim_page).post(redeem_claim))
        .route("/api/claim/:token_id", get(claim_json))
        .route("/health", get(health))
        .route("/oracle/prices", get(oracle_prices))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn load_info(state: &AppState, token_id: &str) -> Result<ClaimInfo, Response> {
    match state.claims.info(token_id.trim()) {
        Ok(Some(info)) => Ok(info),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "claim link not found")),
        Err(e) => {
            tracing::error!(token = %token_id, "[STORE] Claim lookup failed: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

/// GET /api/claim/:token_id
async fn claim_json(State(state): State<Arc<AppState>>, Path(token_id): Path<String>) -> Response {
    match load_info(&state, &token_id) {
        Ok(info) => Json(info).into_response(),
        Err(resp) => resp,
    }
}

/// GET /claim/:token_id - status page, never redeems
async fn claim_page(State(state): State<Arc<AppState>>, Path(token_id): Path<String>) -> Response {
    match load_info(&state, &token_id) {
        Ok(info) => Html(render_claim_page(&info, state.options.web_redemption)).into_response(),
        Err(resp) if resp.status() == StatusCode::NOT_FOUND => (
            StatusCode::NOT_FOUND,
            Html(page("Claim not found", "<p>This claim link does not exist.</p>")),
        )
            .into_response(),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub user_id: String,
    pub username: Option<String>,
    pub payout_address: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub ok: bool,
    pub claim_id: String,
    pub payout_amount: String,
    pub payout_coin: String,
    pub status: String,
}

/// POST /claim/:token_id
async fn redeem_claim(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
    Json(req): Json<RedeemRequest>,
) -> Response {
    if !state.options.web_redemption {
        return error_response(
            StatusCode::FORBIDDEN,
            "web redemption is disabled; claim through the bot with /claim",
        );
    }
    let user = UserId(req.user_id.trim().to_string());
    if user.as_str().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id is required");
    }
    let username = req
        .username
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| user.to_string());

    match state
        .orchestrator
        .redeem(&token_id, &user, &username, &req.payout_address, false)
        .await
    {
        Ok(payout) => Json(RedeemResponse {
            ok: true,
            claim_id: payout.claim_id,
            payout_amount: payout.payout_amount.to_string(),
            payout_coin: payout.payout_coin.to_string(),
            status: payout.status.to_string(),
        })
        .into_response(),
        Err(e) => {
            tracing::info!(token = %token_id, user = %user, "[CLAIMS] Web redemption refused: {}", e);
            error_response(redeem_status(&e), e.user_message())
        }
    }
}

fn redeem_status(e: &RedeemError) -> StatusCode {
    match e {
        RedeemError::NotFound => StatusCode::NOT_FOUND,
        RedeemError::AlreadyClaimed => StatusCode::CONFLICT,
        RedeemError::Expired => StatusCode::GONE,
        RedeemError::NotIntendedRecipient { .. } => StatusCode::FORBIDDEN,
        RedeemError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        RedeemError::BelowMinimum { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RedeemError::Conversion(ConversionError::PriceUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        RedeemError::Conversion(_) | RedeemError::TransferMissing(_) | RedeemError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now() - state.started_at;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime.num_seconds(),
        "admin_console": state.admin.is_enabled(),
        "web_redemption": state.options.web_redemption,
    }))
}

/// GET /oracle/prices
async fn oracle_prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.oracle.snapshot())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title} · ZLink</title>\
         <style>body{{font-family:sans-serif;max-width:560px;margin:40px auto;padding:0 16px}}\
         .status{{font-weight:bold}}code{{word-break:break-all}}</style></head>\
         <body><h1>{title}</h1>{body}</body></html>",
        title = escape(title),
        body = body
    )
}

pub fn render_claim_page(info: &ClaimInfo, web_redemption: bool) -> String {
    let status = if info.claimed {
        "✅ Already claimed"
    } else if info.expired {
        "⏰ Expired"
    } else {
        "🎁 Ready to claim"
    };
    let amount = info
        .source_amount
        .map(|a| format!("{} {}", a, info.source_coin))
        .unwrap_or_else(|| "unknown".to_string());

    let mut body = format!(
        "<p class=\"status\">{status}</p>\
         <p>Recipient: @{recipient}</p>\
         <p>Deposit: {amount} on {chain}</p>\
         <p>Estimated payout: {payout} {payout_coin}</p>\
         <p>Expires: {expires}</p>",
        status = status,
        recipient = escape(&info.recipient),
        amount = escape(&amount),
        chain = info.chain.display_name(),
        payout = info.estimated_payout,
        payout_coin = info.payout_coin,
        expires = info.expires_at.format("%Y-%m-%d %H:%M UTC"),
    );
    if !info.claimed && !info.expired {
        body.push_str(&format!(
            "<p>To claim, send this to the ZLink bot:</p><p><code>/claim {}</code></p>",
            escape(&info.token_id)
        ));
        if web_redemption {
            body.push_str("<p>You can also claim from this page through the API.</p>");
        }
    }
    page("ZLink Claim", &body)
}
