use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, RenewalError};

const SELECT_COLUMNS: &str = r#"
    id, user_id, status, auto_renew, renewal_method, price_cents, currency,
    duration_months, order_id, next_billing_at, renewal_date, end_date,
    status_reason, created_at, updated_at
"#;

pub struct SubscriptionRepository {
    pub pool: PgPool,
}

impl SubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM subscriptions WHERE id = $1
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RenewalError::SubscriptionNotFound(subscription_id.to_string()))?;

        Ok(sub)
    }

    /// Subscriptions due for renewal: active, auto-renewing, and either past
    /// their billing date or (with no billing date set) ending within the
    /// lookahead window
    pub async fn due_candidates(
        &self,
        lookahead: Duration,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let horizon = Utc::now() + ChronoDuration::from_std(lookahead).unwrap_or_default();

        let subs = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM subscriptions
            WHERE status = 'active'
              AND auto_renew = TRUE
              AND (next_billing_at <= NOW()
                   OR (next_billing_at IS NULL AND end_date <= $1))
            ORDER BY next_billing_at ASC NULLS LAST
            LIMIT $2
            "#
        ))
        .bind(horizon)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Defer the next renewal attempt without touching the period itself
    pub async fn push_next_billing(
        &self,
        subscription_id: Uuid,
        retry_interval: Duration,
        status_reason: Option<&str>,
    ) -> AppResult<()> {
        let next = Utc::now() + ChronoDuration::from_std(retry_interval).unwrap_or_default();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET next_billing_at = $2,
                status_reason = COALESCE($3, status_reason),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(next)
        .bind(status_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Advance the period after a successful renewal: end_date,
    /// renewal_date and next_billing_at all move forward by the duration
    pub async fn apply_renewal_success(
        &self,
        subscription_id: Uuid,
        duration_months: i32,
        status_reason: &str,
    ) -> AppResult<Subscription> {
        let sub = self.get(subscription_id).await?;
        let months = Months::new(duration_months.max(1) as u32);

        let base = sub.end_date.unwrap_or_else(Utc::now);
        let new_end = checked_add(base, months);
        let new_next = new_end;
        let renewal_date = Utc::now();

        let updated = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET end_date = $2,
                renewal_date = $3,
                next_billing_at = $4,
                status_reason = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(new_end)
        .bind(renewal_date)
        .bind(new_next)
        .bind(status_reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }
}

fn checked_add(date: DateTime<Utc>, months: Months) -> DateTime<Utc> {
    date.checked_add_months(months).unwrap_or(date)
}

/// Order lookups for the renewal fallback chain
pub struct OrderRepository {
    pub pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, renewal_method, total_cents, currency, created_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn first_item(&self, order_id: Uuid) -> AppResult<Option<OrderItem>> {
        let item = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, price_cents, currency, duration_months, created_at
            FROM order_items WHERE order_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }
}
