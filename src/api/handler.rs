use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppResult, LedgerError},
    ledger::{models::SpendOutcome, repository::LedgerRepository},
    monitoring::{FailureRecord, MetricsSnapshot, PaymentMonitor, PendingPaymentQueue},
    payments::{models::Payment, repository::PaymentRepository},
    renewal::{AdminTask, AdminTaskRepository, RenewalSweep},
    renewal::sweep::SweepStats,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerRepository>,
    pub payments: Arc<PaymentRepository>,
    pub admin_tasks: Arc<AdminTaskRepository>,
    pub queue: Arc<PendingPaymentQueue>,
    pub monitor: Arc<PaymentMonitor>,
    pub sweep: Arc<RenewalSweep>,
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Create a crypto invoice for a credit purchase
/// POST /invoices
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(request): Json<CreateInvoiceRequest>,
) -> AppResult<Json<InvoiceResponse>> {
    info!(user_id = %request.user_id, amount = %request.amount, "invoice requested");

    let (payment, invoice) = state
        .monitor
        .create_invoice(request.user_id, request.amount, &request.currency)
        .await?;

    Ok(Json(InvoiceResponse::from_parts(payment, invoice)))
}

/// Debit a user's credit balance
/// POST /credits/spend
pub async fn spend_credits(
    State(state): State<AppState>,
    Json(request): Json<SpendRequest>,
) -> AppResult<Json<SpendResponse>> {
    let outcome = state
        .ledger
        .spend(request.user_id, request.amount, &request.description)
        .await?;

    match outcome {
        SpendOutcome::Ok(row) => Ok(Json(SpendResponse {
            transaction_id: row.id,
            balance: row.balance_after.unwrap_or_default(),
        })),
        SpendOutcome::InsufficientBalance { available } => {
            Err(LedgerError::InsufficientBalance {
                required: request.amount.to_string(),
                available: available.to_string(),
            }
            .into())
        }
    }
}

/// GET /credits/:user_id/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.ledger.current_balance(user_id).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

/// GET /credits/:user_id/transactions
pub async fn list_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<crate::ledger::models::CreditTransaction>>> {
    Ok(Json(state.ledger.transactions_for_user(user_id).await?))
}

/// GET /payments/:id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<Payment>> {
    Ok(Json(state.payments.get(payment_id).await?))
}

/// GET /admin/monitoring
pub async fn monitoring_state(
    State(state): State<AppState>,
) -> AppResult<Json<MonitoringStateResponse>> {
    Ok(Json(MonitoringStateResponse {
        running: state.monitor.is_running(),
        queued: state.queue.len().await,
    }))
}

/// POST /admin/monitoring/start
pub async fn start_monitoring(State(state): State<AppState>) -> Json<MessageResponse> {
    state.monitor.start();
    Json(MessageResponse::new("monitoring started"))
}

/// POST /admin/monitoring/stop
pub async fn stop_monitoring(State(state): State<AppState>) -> Json<MessageResponse> {
    state.monitor.stop();
    Json(MessageResponse::new("monitoring stopped"))
}

/// GET /admin/monitoring/metrics
pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.monitor.metrics.snapshot())
}

/// POST /admin/monitoring/metrics/reset
pub async fn reset_metrics(State(state): State<AppState>) -> Json<MessageResponse> {
    state.monitor.metrics.reset();
    Json(MessageResponse::new("metrics reset"))
}

/// GET /admin/failures?category=network
pub async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailureQuery>,
) -> Json<Vec<FailureRecord>> {
    Json(state.monitor.failures().list_active(query.category).await)
}

/// Re-queue a stuck payment for monitoring
/// POST /admin/payments/:id/retry
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    state.monitor.retry_payment(payment_id).await?;
    Ok(Json(MessageResponse::new("payment re-queued")))
}

/// GET /admin/tasks?category=renewal_missing_price
pub async fn list_admin_tasks(
    State(state): State<AppState>,
    Query(query): Query<AdminTaskQuery>,
) -> AppResult<Json<Vec<AdminTask>>> {
    Ok(Json(state.admin_tasks.list_open(query.category).await?))
}

/// Trigger a renewal sweep outside its schedule
/// POST /admin/renewals/run
pub async fn run_renewal_sweep(State(state): State<AppState>) -> AppResult<Json<SweepStats>> {
    Ok(Json(state.sweep.run().await?))
}
