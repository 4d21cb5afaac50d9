use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitoring::FailureCategory;
use crate::payments::models::{Payment, PaymentStatus};
use crate::payments::provider::ProviderInvoice;
use crate::renewal::AdminTaskCategory;

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub payment_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub pay_address: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

impl InvoiceResponse {
    pub fn from_parts(payment: Payment, invoice: ProviderInvoice) -> Self {
        Self {
            payment_id: payment.id,
            provider: payment.provider,
            provider_payment_id: invoice.provider_payment_id,
            pay_address: invoice.pay_address,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            expires_at: payment.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct SpendResponse {
    pub transaction_id: Uuid,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct FailureQuery {
    pub category: Option<FailureCategory>,
}

#[derive(Debug, Deserialize)]
pub struct AdminTaskQuery {
    pub category: Option<AdminTaskCategory>,
}

#[derive(Debug, Serialize)]
pub struct MonitoringStateResponse {
    pub running: bool,
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
