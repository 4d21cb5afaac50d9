use axum::{extract::State, Json};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use super::handler::AppState;
use super::models::MessageResponse;
use crate::error::{AppError, AppResult};
use crate::payments::models::PaymentStatus;

/// Settlement provider IPN payload (NOWPayments-style)
#[derive(Debug, Deserialize)]
pub struct SettlementWebhookPayload {
    pub payment_id: serde_json::Value,
    pub payment_status: String,
    #[serde(default)]
    pub actually_paid: Option<Decimal>,
}

/// Card processor webhook payload
#[derive(Debug, Deserialize)]
pub struct CardWebhookPayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

fn parse_status(raw: &str) -> AppResult<PaymentStatus> {
    PaymentStatus::from_provider_str(raw)
        .ok_or_else(|| AppError::BadRequest(format!("unrecognized payment status: {}", raw)))
}

/// POST /webhooks/settlement
///
/// Webhook deliveries can arrive out of order and after the poll loop has
/// already observed the same status; both funnel into the shared transition
/// logic, which ignores stale reads.
pub async fn settlement_webhook(
    State(state): State<AppState>,
    Json(payload): Json<SettlementWebhookPayload>,
) -> AppResult<Json<MessageResponse>> {
    let provider_payment_id = match &payload.payment_id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let status = parse_status(&payload.payment_status)?;

    info!(
        provider_payment_id = %provider_payment_id,
        status = %status,
        "settlement webhook received"
    );

    state
        .monitor
        .handle_provider_event(
            state.monitor.provider_name(),
            &provider_payment_id,
            status,
            payload.actually_paid,
        )
        .await?;

    Ok(Json(MessageResponse::new("processed")))
}

/// POST /webhooks/card
pub async fn card_webhook(
    State(state): State<AppState>,
    Json(payload): Json<CardWebhookPayload>,
) -> AppResult<Json<MessageResponse>> {
    let status = parse_status(&payload.status)?;

    info!(
        provider_payment_id = %payload.id,
        status = %status,
        "card webhook received"
    );

    state
        .monitor
        .handle_provider_event(
            state.sweep.card_provider(),
            &payload.id,
            status,
            payload.amount,
        )
        .await?;

    Ok(Json(MessageResponse::new("processed")))
}
