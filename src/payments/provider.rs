use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::models::PaymentStatus;
use crate::error::{AppError, AppResult};

/// Status snapshot read back from the settlement provider
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub status: PaymentStatus,
    pub amount_received: Option<Decimal>,
}

/// A freshly created crypto invoice
#[derive(Debug, Clone)]
pub struct ProviderInvoice {
    pub provider_payment_id: String,
    pub pay_address: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// External settlement provider for asynchronous crypto payments. Polled by
/// the monitoring loop; its webhook events feed the same transition logic.
#[async_trait]
pub trait SettlementProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_status(&self, provider_payment_id: &str) -> AppResult<ProviderStatus>;

    async fn create_invoice(
        &self,
        amount: Decimal,
        currency: &str,
        order_reference: &str,
    ) -> AppResult<ProviderInvoice>;
}

/// Card-network payment processor. Confirmation arrives via webhook and is
/// funneled through the same payment state machine.
#[async_trait]
pub trait CardProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the provider-side payment id of the created charge
    async fn create_charge(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: serde_json::Value,
    ) -> AppResult<String>;
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    payment_status: String,
    #[serde(default)]
    actually_paid: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct InvoicePayload {
    payment_id: serde_json::Value,
    #[serde(default)]
    pay_address: Option<String>,
    #[serde(default)]
    expiration_estimate_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ChargePayload {
    id: String,
}

/// Settlement provider backed by an HTTP JSON API (NOWPayments-style)
pub struct HttpSettlementProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSettlementProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl SettlementProvider for HttpSettlementProvider {
    fn name(&self) -> &'static str {
        "nowpayments"
    }

    async fn get_status(&self, provider_payment_id: &str) -> AppResult<ProviderStatus> {
        let payload: StatusPayload = self
            .client
            .get(format!("{}/payment/{}", self.base_url, provider_payment_id))
            .header("x-api-key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status = PaymentStatus::from_provider_str(&payload.payment_status).ok_or_else(|| {
            AppError::Provider(format!(
                "unrecognized payment status: {}",
                payload.payment_status
            ))
        })?;

        Ok(ProviderStatus {
            status,
            amount_received: payload.actually_paid,
        })
    }

    async fn create_invoice(
        &self,
        amount: Decimal,
        currency: &str,
        order_reference: &str,
    ) -> AppResult<ProviderInvoice> {
        let payload: InvoicePayload = self
            .client
            .post(format!("{}/payment", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({
                "price_amount": amount,
                "price_currency": currency,
                "order_id": order_reference,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Some providers return numeric ids, some strings
        let provider_payment_id = match &payload.payment_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        Ok(ProviderInvoice {
            provider_payment_id,
            pay_address: payload.pay_address,
            expires_at: payload.expiration_estimate_date,
        })
    }
}

/// Card processor backed by an HTTP JSON API
pub struct HttpCardProcessor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCardProcessor {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl CardProcessor for HttpCardProcessor {
    fn name(&self) -> &'static str {
        "card"
    }

    async fn create_charge(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: serde_json::Value,
    ) -> AppResult<String> {
        let payload: ChargePayload = self
            .client
            .post(format!("{}/invoice", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "amount": amount,
                "currency": currency,
                "metadata": metadata,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(payload.id)
    }
}

/// Scripted provider for tests: returns queued responses in order, then
/// repeats the last one.
#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    pub struct MockSettlementProvider {
        responses: Mutex<Vec<AppResult<ProviderStatus>>>,
        pub status_calls: std::sync::atomic::AtomicU32,
    }

    impl MockSettlementProvider {
        pub fn new(responses: Vec<AppResult<ProviderStatus>>) -> Self {
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                status_calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        pub fn ok(status: PaymentStatus, amount_received: Option<Decimal>) -> AppResult<ProviderStatus> {
            Ok(ProviderStatus {
                status,
                amount_received,
            })
        }

        pub fn network_err() -> AppResult<ProviderStatus> {
            Err(AppError::Provider("connection reset".to_string()))
        }
    }

    #[async_trait]
    impl SettlementProvider for MockSettlementProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn get_status(&self, _provider_payment_id: &str) -> AppResult<ProviderStatus> {
            self.status_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                match responses.last() {
                    Some(Ok(status)) => Ok(status.clone()),
                    Some(Err(_)) | None => Err(AppError::Provider("connection reset".to_string())),
                }
            }
        }

        async fn create_invoice(
            &self,
            _amount: Decimal,
            _currency: &str,
            order_reference: &str,
        ) -> AppResult<ProviderInvoice> {
            Ok(ProviderInvoice {
                provider_payment_id: format!("mock-{}", order_reference),
                pay_address: Some("mock-address".to_string()),
                expires_at: None,
            })
        }
    }

}
