use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, PaymentError};

const SELECT_COLUMNS: &str = r#"
    id, user_id, provider, provider_payment_id, status, purpose, amount, currency,
    order_id, subscription_id, credit_transaction_id, expires_at, metadata,
    created_at, updated_at
"#;

pub struct NewPayment<'a> {
    pub user_id: Uuid,
    pub provider: &'a str,
    pub provider_payment_id: &'a str,
    pub purpose: PaymentPurpose,
    pub amount: Decimal,
    pub currency: &'a str,
    pub order_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub credit_transaction_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

pub struct PaymentRepository {
    pub pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewPayment<'_>) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments
                (user_id, provider, provider_payment_id, status, purpose, amount, currency,
                 order_id, subscription_id, credit_transaction_id, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(new.user_id)
        .bind(new.provider)
        .bind(new.provider_payment_id)
        .bind(PaymentStatus::Pending)
        .bind(new.purpose)
        .bind(new.amount)
        .bind(new.currency)
        .bind(new.order_id)
        .bind(new.subscription_id)
        .bind(new.credit_transaction_id)
        .bind(new.expires_at)
        .bind(new.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.find(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(payment_id.to_string()).into())
    }

    pub async fn find(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM payments WHERE id = $1
            "#
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Webhook entry point: providers identify payments by their own id
    pub async fn find_by_provider_payment_id(
        &self,
        provider: &str,
        provider_payment_id: &str,
    ) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM payments
            WHERE provider = $1 AND provider_payment_id = $2
            "#
        ))
        .bind(provider)
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Compare-and-swap the status. Returns false when the row no longer
    /// holds `from` - a concurrent writer got there first and the caller
    /// must re-read rather than overwrite.
    pub async fn transition(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(payment_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Back-link a payment to the pending deposit row it will settle into
    pub async fn link_credit_transaction(
        &self,
        payment_id: Uuid,
        credit_transaction_id: Uuid,
    ) -> AppResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET credit_transaction_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(credit_transaction_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Is there already a non-terminal renewal charge for this subscription?
    /// Guards the sweep against issuing duplicate charges.
    pub async fn has_pending_renewal_charge(&self, subscription_id: Uuid) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM payments
                WHERE subscription_id = $1
                  AND purpose = 'subscription_renewal'
                  AND status NOT IN ('finished', 'failed', 'expired', 'refunded')
            )
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
