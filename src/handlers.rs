//! HTTP endpoints exposed by the facilitator (spec.md §6).
//!
//! Follows the teacher's handler shape — `State<AppState>` extraction, `#[instrument(skip_all)]`
//! on every handler, a plain `match result { Ok => ..., Err => ... }` body — generalized from
//! the teacher's single `verify`/`settle` pair to this system's larger route set (settlement
//! status lookup, FCR introspection, the deferred voucher store).

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

use crate::app::AppState;
use crate::fcr::Level;
use crate::risk::RiskError;
use crate::types::{
    ConfirmationLevel, EvmAddress, PaymentId, PaymentRequest, SettlementStatus, TokenAmount,
    UnixTimestamp,
};
use crate::verification::{self, VerificationError};
use crate::voucher::{Voucher, VoucherError};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/verify", post(post_verify))
        .route("/settle", post(post_settle))
        .route("/settle/{payment_id}", get(get_settlement))
        .route("/health", get(get_health))
        .route("/fcr/status", get(get_fcr_status))
        .route("/fcr/levels", get(get_fcr_levels))
        .route("/fcr/wait/{level}", get(get_fcr_wait))
        .route("/deferred/buyers/{addr}", get(get_deferred_buyer))
        .route("/deferred/vouchers", post(post_deferred_voucher))
        .route("/deferred/vouchers/{id}/settle", post(post_deferred_settle))
        .with_state(state)
}

fn today_epoch_day(now: UnixTimestamp) -> u64 {
    now.0 / 86_400
}

fn verification_reason(error: &VerificationError) -> String {
    match error {
        VerificationError::TokenMismatch { .. } => "token_mismatch".to_string(),
        VerificationError::RecipientMismatch { .. } => "recipient_mismatch".to_string(),
        VerificationError::InsufficientValue { .. } => "insufficient_amount".to_string(),
        VerificationError::InvalidSignature(_) => "invalid_signature".to_string(),
        VerificationError::InvalidTiming(_) => "expired_or_not_yet_valid".to_string(),
        VerificationError::ExpiresTooSoon(_) => "expires_too_soon".to_string(),
        VerificationError::NonceAlreadyUsed => "nonce_already_used".to_string(),
        VerificationError::InsufficientBalance => "insufficient_balance".to_string(),
        VerificationError::Chain(_) => "balance_check_failed".to_string(),
        VerificationError::ChainMismatch { .. } => "chain_mismatch".to_string(),
        VerificationError::RiskRejected(risk_error) => match risk_error {
            RiskError::ExceedsSinglePaymentLimit { limit, .. } => {
                format!("exceeds_single_payment_limit:{limit}")
            }
            RiskError::ExceedsPendingLimit { limit, .. } => format!("exceeds_pending_limit:{limit}"),
            RiskError::ExceedsDailyLimit { limit, .. } => format!("exceeds_daily_limit:{limit}"),
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    valid: bool,
    risk_score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wallet_balance: Option<TokenAmount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_amount: Option<TokenAmount>,
}

/// `POST /verify`: checks acceptability without reserving wallet exposure (spec.md §4.4).
#[instrument(skip_all)]
async fn post_verify(State(state): State<AppState>, Json(body): Json<PaymentRequest>) -> impl IntoResponse {
    let now = UnixTimestamp::now();
    state.risk.observe_wallet(body.payment.from, now).await;

    let result = verification::verify_payment(
        &state.chain,
        &state.risk,
        &state.verification,
        &body.payment,
        &body.requirements,
        now,
        today_epoch_day(now),
    )
    .await;

    match result {
        Ok(_outcome) => {
            let balance = state
                .chain
                .balance_of(body.payment.token, body.payment.from)
                .await
                .ok();
            let pending = state.risk.pending_exposure(body.payment.from).await;
            (
                StatusCode::OK,
                Json(VerifyResponse {
                    valid: true,
                    risk_score: 0,
                    reason: None,
                    wallet_balance: balance,
                    pending_amount: Some(pending),
                }),
            )
                .into_response()
        }
        Err(error) => {
            tracing::warn!(%error, "verification failed");
            (
                StatusCode::BAD_REQUEST,
                Json(VerifyResponse {
                    valid: false,
                    risk_score: 1,
                    reason: Some(verification_reason(&error)),
                    wallet_balance: None,
                    pending_amount: None,
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_id: Option<PaymentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn fcr_headers(state: &AppState, level: ConfirmationLevel) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&level.to_string()) {
        headers.insert("x-fcr-level", value);
    }
    if let Some(progress) = state.fcr.current_progress().await {
        if let Ok(value) = HeaderValue::from_str(&progress.instance.to_string()) {
            headers.insert("x-fcr-instance", value);
        }
        if let Ok(value) = HeaderValue::from_str(&progress.phase.to_string()) {
            headers.insert("x-fcr-phase", value);
        }
    }
    headers
}

/// `POST /settle`: verifies with risk reservation, submits on-chain, commits bond collateral.
#[instrument(skip_all)]
async fn post_settle(State(state): State<AppState>, Json(body): Json<PaymentRequest>) -> impl IntoResponse {
    let now = UnixTimestamp::now();
    state.risk.observe_wallet(body.payment.from, now).await;
    let payment_id = body.payment.payment_id();

    if let Ok(existing) = state.settlement.get(payment_id).await {
        let headers = fcr_headers(&state, existing.confirmation_level).await;
        return (
            StatusCode::BAD_REQUEST,
            headers,
            Json(SettleResponse {
                success: false,
                payment_id: Some(payment_id),
                transaction_handle: existing.transaction.map(|t| t.to_string()),
                error: Some("payment_already_submitted".to_string()),
            }),
        )
            .into_response();
    }

    let verification = verification::verify_and_reserve(
        &state.chain,
        &state.risk,
        &state.verification,
        &body.payment,
        &body.requirements,
        now,
        today_epoch_day(now),
    )
    .await;

    let outcome = match verification {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, "settle-time verification failed");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                Json(SettleResponse {
                    success: false,
                    payment_id: Some(payment_id),
                    transaction_handle: None,
                    error: Some(verification_reason(&error)),
                }),
            )
                .into_response();
        }
    };

    match state
        .settlement
        .submit(body.payment.clone(), body.requirements.clone(), state.provider, now)
        .await
    {
        Ok(record) => {
            let headers = fcr_headers(&state, record.confirmation_level).await;
            (
                StatusCode::OK,
                headers,
                Json(SettleResponse {
                    success: true,
                    payment_id: Some(payment_id),
                    transaction_handle: record.transaction.map(|t| t.to_string()),
                    error: None,
                }),
            )
                .into_response()
        }
        Err(error) => {
            // A bond-capacity failure leaves the transfer unsubmitted and retryable, so the
            // wallet's risk credit stays held rather than released back for immediate reuse.
            // Any other failure means no settlement is in flight for this payment at all, so
            // the credit is released.
            if !matches!(error, crate::settlement::SettlementError::Bond(_)) {
                state.risk.release_credit(body.payment.from, body.payment.value).await;
            }
            tracing::error!(%error, payer = %outcome.payer, "settlement submission failed");
            let reason = match &error {
                crate::settlement::SettlementError::Bond(_) => {
                    format!("insufficient_bond_capacity: {error}")
                }
                crate::settlement::SettlementError::Chain(_) => format!("submission_failed: {error}"),
                crate::settlement::SettlementError::NotFound(_) => "internal_error".to_string(),
            };
            (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                Json(SettleResponse {
                    success: false,
                    payment_id: Some(payment_id),
                    transaction_handle: None,
                    error: Some(reason),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementStatusResponse {
    payment_id: PaymentId,
    status: SettlementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_handle: Option<String>,
    attempts: u32,
    created_at: UnixTimestamp,
    updated_at: UnixTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    fcr: ConfirmationLevel,
}

/// `GET /settle/{paymentId}`.
#[instrument(skip_all)]
async fn get_settlement(State(state): State<AppState>, Path(payment_id): Path<String>) -> impl IntoResponse {
    let Ok(payment_id) = parse_payment_id(&payment_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.settlement.get(payment_id).await {
        Ok(record) => {
            let headers = fcr_headers(&state, record.confirmation_level).await;
            (
                StatusCode::OK,
                headers,
                Json(SettlementStatusResponse {
                    payment_id: record.payment_id,
                    status: record.status,
                    transaction_handle: record.transaction.map(|t| t.to_string()),
                    attempts: record.attempts,
                    created_at: record.created_at,
                    updated_at: record.updated_at,
                    error: record.last_error,
                    fcr: record.confirmation_level,
                }),
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn parse_payment_id(raw: &str) -> Result<PaymentId, ()> {
    alloy_primitives::B256::from_str(raw).map(PaymentId).map_err(|_| ())
}

/// `GET /health`.
#[instrument(skip_all)]
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let connectivity = state.chain.current_height().await.is_ok();
    Json(json!({
        "chainId": state.chain_id,
        "chainName": state.chain_name,
        "chainConnected": connectivity,
        "fcrEnabled": true,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FcrStatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    round: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_head: Option<u64>,
}

/// `GET /fcr/status`.
#[instrument(skip_all)]
async fn get_fcr_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_head = state.fcr.current_chain_head().await;
    match state.fcr.current_progress().await {
        Some(progress) => Json(FcrStatusResponse {
            instance: Some(progress.instance),
            round: Some(progress.round),
            phase: Some(progress.phase.to_string()),
            chain_head,
        }),
        None => Json(FcrStatusResponse {
            instance: None,
            round: None,
            phase: None,
            chain_head,
        }),
    }
}

/// `GET /fcr/levels`: static catalogue, not derived from any runtime state.
#[instrument(skip_all)]
async fn get_fcr_levels() -> impl IntoResponse {
    Json(json!([
        {"code": "L0", "name": "accepted", "description": "seen, not yet included in any block", "latency": "~0s"},
        {"code": "L1", "name": "included", "description": "included in a tipset at the reported height", "latency": "seconds"},
        {"code": "L2", "name": "fast-safe", "description": "covered by the active instance's COMMIT quorum or an elapsed round-0 PREPARE window", "latency": "single digit seconds"},
        {"code": "L3", "name": "finalized", "description": "covered by a finalized certificate", "latency": "tens of seconds"},
        {"code": "LB", "name": "bond-backstopped", "description": "provider is paid from bond collateral regardless of on-chain outcome", "latency": "n/a"},
    ]))
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout: Option<u64>,
}

/// `GET /fcr/wait/{level}?timeout=ms`: suspends until the monitor's current instance
/// reaches `level` or the timeout elapses.
#[instrument(skip_all)]
async fn get_fcr_wait(
    State(state): State<AppState>,
    Path(level): Path<String>,
    Query(query): Query<WaitQuery>,
) -> impl IntoResponse {
    let target = match level.to_uppercase().as_str() {
        "L0" => Level::L0,
        "L1" => Level::L1,
        "L2" => Level::L2,
        "L3" => Level::L3,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    let timeout = Duration::from_millis(query.timeout.unwrap_or(5_000));
    let deadline = tokio::time::Instant::now() + timeout;
    let current_height = state.chain.current_height().await.unwrap_or(0);

    loop {
        let level_now = state.fcr.evaluate(current_height).await;
        if level_now >= target {
            return (StatusCode::OK, Json(json!({"level": level_now_name(level_now)}))).into_response();
        }
        if tokio::time::Instant::now() >= deadline {
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn level_now_name(level: Level) -> &'static str {
    match level {
        Level::L0 => "L0",
        Level::L1 => "L1",
        Level::L2 => "L2",
        Level::L3 => "L3",
    }
}

/// `GET /deferred/buyers/{addr}`.
#[instrument(skip_all)]
async fn get_deferred_buyer(State(state): State<AppState>, Path(addr): Path<String>) -> impl IntoResponse {
    let Ok(address) = alloy_primitives::Address::from_str(&addr) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let buyer = EvmAddress(address);
    let vouchers = state.voucher.vouchers_for_buyer(buyer).await;
    let account = match state.voucher.buyer_account(buyer).await {
        Ok(account) => account,
        Err(error) => {
            tracing::warn!(%error, "escrow account read failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };
    let (balance, thawing_amount, thaw_end_time) = account
        .map(|a| (a.balance, a.thawing_amount, a.thaw_end_time))
        .unwrap_or((TokenAmount::ZERO, TokenAmount::ZERO, UnixTimestamp(0)));
    Json(json!({
        "balance": balance.to_string(),
        "thawingAmount": thawing_amount.to_string(),
        "thawEndTime": thaw_end_time.0,
        "voucherCount": vouchers.len(),
        "vouchers": vouchers.iter().map(|v| json!({
            "id": v.id().to_string(),
            "seller": v.seller.to_string(),
            "valueAggregate": v.value_aggregate.to_string(),
            "nonce": v.nonce,
        })).collect::<Vec<_>>(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoucherRequest {
    buyer: EvmAddress,
    seller: EvmAddress,
    escrow: EvmAddress,
    value_aggregate: TokenAmount,
    nonce: u64,
    timestamp: UnixTimestamp,
    signature: crate::types::EvmSignature,
}

fn voucher_reason(error: &VoucherError) -> &'static str {
    match error {
        VoucherError::NonceNotMonotonic { .. } => "StaleVoucher",
        VoucherError::ValueNotMonotonic { .. } => "StaleVoucher",
        VoucherError::Expired(_) => "VoucherExpired",
        VoucherError::InvalidSignature(_) => "InvalidSignature",
        VoucherError::NoAccount(..) => "NoAccount",
        VoucherError::NotFound(_) => "NotFound",
        VoucherError::AlreadySettled(_) => "AlreadySettled",
        VoucherError::EscrowNotConfigured => "EscrowNotConfigured",
        VoucherError::Escrow(_) => "EscrowCallFailed",
    }
}

/// `POST /deferred/vouchers`.
#[instrument(skip_all)]
async fn post_deferred_voucher(State(state): State<AppState>, Json(body): Json<VoucherRequest>) -> impl IntoResponse {
    let voucher = Voucher {
        buyer: body.buyer,
        seller: body.seller,
        escrow: body.escrow,
        value_aggregate: body.value_aggregate,
        nonce: body.nonce,
        timestamp: body.timestamp,
        signature: body.signature,
    };
    let now = UnixTimestamp::now();
    match state.voucher.store_voucher(state.chain_id, voucher, now).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => {
            tracing::warn!(%error, "voucher rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": voucher_reason(&error)})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeferredSettleRequest {
    buyer: EvmAddress,
    seller: EvmAddress,
}

/// `POST /deferred/vouchers/{id}/settle`.
#[instrument(skip_all)]
async fn post_deferred_settle(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DeferredSettleRequest>,
) -> impl IntoResponse {
    let Ok(voucher_id) = parse_payment_id(&id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.voucher.settle_voucher(body.buyer, body.seller, voucher_id).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "voucherId": voucher_id.to_string(),
            "delta": outcome.delta.to_string(),
            "transactionHandle": outcome.transaction.to_string(),
        }))
        .into_response(),
        Err(error) => {
            tracing::warn!(%error, "voucher settlement failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": voucher_reason(&error)})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::stub::StubBondLedger;
    use crate::chain::stub::StubChainRpc;
    use crate::fcr::FcrMonitor;
    use crate::risk::{LimitTable, RiskState, TierDailyCaps};
    use crate::types::{EvmAddress, EvmSignature, Nonce};
    use alloy_primitives::{Address, B256, U256};
    use std::time::Duration as StdDuration;

    fn test_state() -> AppState {
        let limits = LimitTable {
            max_per_transaction: TokenAmount(U256::from(500u64)),
            max_pending_per_wallet: TokenAmount(U256::from(1_000u64)),
            daily_limit_per_wallet: TokenAmount(U256::from(100_000u64)),
            tier_daily_caps: TierDailyCaps {
                unknown: TokenAmount(U256::from(1_000u64)),
                history_7d: TokenAmount(U256::from(10_000u64)),
                history_30d: TokenAmount(U256::from(100_000u64)),
                verified: TokenAmount(U256::from(100_000u64)),
            },
        };
        AppState {
            chain: Arc::new(StubChainRpc::default()),
            risk: Arc::new(RiskState::new(limits)),
            settlement: Arc::new(crate::settlement::SettlementEngine::new(
                Arc::new(StubChainRpc::default()),
                Arc::new(StubBondLedger::default()),
                Arc::new(FcrMonitor::new(StdDuration::from_secs(5))),
                crate::settlement::SettlementConfig {
                    max_attempts: 3,
                    bond_window_seconds: 3600,
                    retry_backoff: StdDuration::from_secs(1),
                },
            )),
            fcr: Arc::new(FcrMonitor::new(StdDuration::from_secs(5))),
            voucher: Arc::new(crate::voucher::VoucherStore::new(
                "TestToken".to_string(),
                "1".to_string(),
                Some(Arc::new(crate::escrow::stub::StubEscrowContract::default())),
            )),
            verification: Arc::new(crate::verification::VerificationConfig {
                eip712_name: "TestToken".to_string(),
                eip712_version_override: None,
            }),
            provider: EvmAddress(Address::repeat_byte(9)),
            chain_id: 314159,
            chain_name: "TestToken".to_string(),
        }
    }

    fn sample_payment_request() -> PaymentRequest {
        let token = EvmAddress(Address::repeat_byte(1));
        let from = EvmAddress(Address::repeat_byte(2));
        let to = EvmAddress(Address::repeat_byte(3));
        let payment = crate::types::PaymentAuthorization {
            token,
            from,
            to,
            value: TokenAmount(U256::from(100u64)),
            valid_after: UnixTimestamp(0),
            valid_before: UnixTimestamp(u64::MAX),
            nonce: Nonce(B256::repeat_byte(4)),
            signature: EvmSignature([7u8; 65]),
        };
        let requirements = crate::types::PaymentRequirements {
            pay_to: to,
            max_amount_required: TokenAmount(U256::from(100u64)),
            token_address: token,
            chain_id: 314159,
            resource: "r".to_string(),
            description: "d".to_string(),
        };
        PaymentRequest { payment, requirements }
    }

    #[tokio::test]
    async fn verify_rejects_garbage_signature() {
        let state = test_state();
        let response = post_verify(State(state), Json(sample_payment_request()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settle_rejects_garbage_signature_without_reserving_credit() {
        let state = test_state();
        let payer = sample_payment_request().payment.from;
        let response = post_settle(State(state.clone()), Json(sample_payment_request()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            state.risk.pending_exposure(payer).await,
            TokenAmount(U256::ZERO)
        );
    }

    #[tokio::test]
    async fn get_settlement_404s_for_unknown_payment_id() {
        let state = test_state();
        let raw = B256::repeat_byte(0xAB).to_string();
        let response = get_settlement(State(state), Path(raw)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_chain_connectivity() {
        let state = test_state();
        let response = get_health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn fcr_levels_lists_all_four_plus_bond_backstop() {
        let response = get_fcr_levels().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn parses_valid_and_rejects_invalid_payment_ids() {
        let raw = B256::repeat_byte(0x11).to_string();
        assert!(parse_payment_id(&raw).is_ok());
        assert!(parse_payment_id("not-a-hash").is_err());
    }

    #[test]
    fn verification_reason_embeds_the_offending_limit() {
        let error = VerificationError::RiskRejected(RiskError::ExceedsSinglePaymentLimit {
            limit: TokenAmount(U256::from(500u64)),
            value: TokenAmount(U256::from(600u64)),
        });
        assert_eq!(
            verification_reason(&error),
            "exceeds_single_payment_limit:500"
        );
    }
}
