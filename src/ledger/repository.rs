use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, LedgerError};
use crate::payments::models::{MonitoringStatus, PaymentStatus};

const SELECT_COLUMNS: &str = r#"
    id, user_id, tx_type, amount, balance_before, balance_after, description,
    payment_id, payment_provider, payment_status, monitoring_status,
    retry_count, metadata, created_at
"#;

/// Ledger repository - the source of truth for user balances.
///
/// Balances are only ever mutated through `spend` (renewal debit / checkout)
/// and `finalize_deposit` (allocation), each serialized per user with a
/// transaction-scoped advisory lock so the before/after chain never forks.
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Serialize concurrent writers touching the same entity
    async fn advisory_lock(
        tx: &mut Transaction<'static, Postgres>,
        scope: &str,
        id: Uuid,
    ) -> AppResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", scope, id))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn balance_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        user_id: Uuid,
    ) -> AppResult<Decimal> {
        let balance: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT balance_after FROM credit_transactions
            WHERE user_id = $1 AND balance_after IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Current running balance for a user (finalized rows only)
    pub async fn current_balance(&self, user_id: Uuid) -> AppResult<Decimal> {
        let balance: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT balance_after FROM credit_transactions
            WHERE user_id = $1 AND balance_after IS NOT NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Debit a user's balance. `amount` is the positive value to spend;
    /// the stored row carries it negated, per the sign convention.
    pub async fn spend(
        &self,
        user_id: Uuid,
        amount: Decimal,
        description: &str,
    ) -> AppResult<SpendOutcome> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmountSign {
                tx_type: TransactionType::Purchase.to_string(),
                amount: amount.to_string(),
            }
            .into());
        }

        let mut tx = self.begin_tx().await?;
        Self::advisory_lock(&mut tx, "ledger:user", user_id).await?;

        let balance = Self::balance_in_tx(&mut tx, user_id).await?;
        if balance < amount {
            return Ok(SpendOutcome::InsufficientBalance { available: balance });
        }

        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            INSERT INTO credit_transactions
                (user_id, tx_type, amount, balance_before, balance_after, description, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, '{{}}'::jsonb)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(TransactionType::Purchase)
        .bind(-amount)
        .bind(balance)
        .bind(balance - amount)
        .bind(description)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(user_id = %user_id, amount = %amount, "ledger debit applied");
        Ok(SpendOutcome::Ok(row))
    }

    /// Create the pending deposit row for a freshly issued crypto invoice.
    /// Balance fields stay NULL until the payment settles and is allocated.
    pub async fn insert_pending_deposit(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
        provider: &str,
        expected_amount: Decimal,
        description: &str,
    ) -> AppResult<CreditTransaction> {
        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            INSERT INTO credit_transactions
                (user_id, tx_type, amount, description, payment_id, payment_provider,
                 payment_status, monitoring_status, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '{{}}'::jsonb)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(TransactionType::Deposit)
        .bind(expected_amount)
        .bind(description)
        .bind(payment_id)
        .bind(provider)
        .bind(PaymentStatus::Pending)
        .bind(MonitoringStatus::Pending)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Finalize a settled deposit: set the settled amount and the balance
    /// chain, and flip the durable `payment_completed` flag. The conditional
    /// UPDATE makes a concurrent second finalization observe zero affected
    /// rows instead of double-crediting.
    ///
    /// The row enters the balance chain at finalization time, so
    /// `created_at` is moved to NOW(): `balance_before` is computed from the
    /// balance current at settlement, and rows finalized between invoice
    /// creation and settlement must sort before this one.
    pub async fn finalize_deposit(
        &self,
        payment_id: Uuid,
        settled_amount: Decimal,
    ) -> AppResult<FinalizeOutcome> {
        let mut tx = self.begin_tx().await?;
        Self::advisory_lock(&mut tx, "ledger:payment", payment_id).await?;

        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM credit_transactions
            WHERE payment_id = $1
            FOR UPDATE
            "#
        ))
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::RowNotFound(payment_id.to_string()))?;

        if row.is_payment_completed() {
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        Self::advisory_lock(&mut tx, "ledger:user", row.user_id).await?;
        let balance = Self::balance_in_tx(&mut tx, row.user_id).await?;

        let updated = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            UPDATE credit_transactions
            SET amount = $2,
                balance_before = $3,
                balance_after = $4,
                payment_status = $5,
                monitoring_status = $6,
                metadata = metadata || '{{"payment_completed": true}}'::jsonb,
                created_at = NOW()
            WHERE id = $1
              AND (metadata->>'payment_completed') IS DISTINCT FROM 'true'
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(row.id)
        .bind(settled_amount)
        .bind(balance)
        .bind(balance + settled_amount)
        .bind(PaymentStatus::Finished)
        .bind(MonitoringStatus::Completed)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        match updated {
            Some(row) => {
                info!(payment_id = %payment_id, amount = %settled_amount, "deposit finalized");
                Ok(FinalizeOutcome::Finalized(row))
            }
            None => Ok(FinalizeOutcome::AlreadyCompleted),
        }
    }

    /// Mirror a payment state transition onto the linked ledger row
    pub async fn update_payment_tracking(
        &self,
        payment_id: Uuid,
        payment_status: PaymentStatus,
        monitoring_status: MonitoringStatus,
        retry_count: i32,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE credit_transactions
            SET payment_status = $2, monitoring_status = $3, retry_count = $4
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .bind(payment_status)
        .bind(monitoring_status)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Payments whose monitoring never reached a terminal state - the
    /// monitoring queue is rebuilt from these at process start
    pub async fn unresolved_payments(&self) -> AppResult<Vec<(Uuid, i32)>> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT payment_id, retry_count FROM credit_transactions
            WHERE payment_id IS NOT NULL
              AND monitoring_status IN ('pending', 'retrying')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn find_by_payment_id(
        &self,
        payment_id: Uuid,
    ) -> AppResult<Option<CreditTransaction>> {
        let row = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM credit_transactions
            WHERE payment_id = $1
            "#
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Full history for a user ordered by (created_at, id), the order over
    /// which the running-balance invariant is defined
    pub async fn transactions_for_user(&self, user_id: Uuid) -> AppResult<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn finalized_row(amount: Decimal, before: Decimal) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tx_type: if amount >= Decimal::ZERO {
                TransactionType::Deposit
            } else {
                TransactionType::Purchase
            },
            amount,
            balance_before: Some(before),
            balance_after: Some(before + amount),
            description: None,
            payment_id: None,
            payment_provider: None,
            payment_status: None,
            monitoring_status: None,
            retry_count: 0,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Running-balance invariant: every prefix sums to the last balance_after
    #[test]
    fn test_running_balance_invariant() {
        let history = vec![
            finalized_row(dec!(20.00), dec!(0)),
            finalized_row(dec!(-9.99), dec!(20.00)),
            finalized_row(dec!(5.00), dec!(10.01)),
        ];

        let mut running = Decimal::ZERO;
        for row in &history {
            running += row.amount;
            assert_eq!(Some(running), row.balance_after);
            assert_eq!(
                row.balance_after.unwrap(),
                row.balance_before.unwrap() + row.amount
            );
        }
        assert_eq!(running, dec!(15.01));
    }

    /// A crypto deposit whose invoice predates a spend settles afterwards:
    /// finalization moves it to the head of the `(created_at, id)` chain, so
    /// its `balance_before` reflects the intervening debit and the latest
    /// row by `created_at` is the one carrying the credited balance
    #[test]
    fn test_deposit_settling_after_spend_joins_chain_at_finalization() {
        let history = vec![
            finalized_row(dec!(20.00), dec!(0)),
            finalized_row(dec!(-9.99), dec!(20.00)),
            // settled at finalization time, after the spend above
            finalized_row(dec!(50.00), dec!(10.01)),
        ];

        let mut running = Decimal::ZERO;
        for row in &history {
            running += row.amount;
            assert_eq!(Some(running), row.balance_after);
        }

        // The balance read picks the chain-final row, which must be the
        // freshly finalized deposit
        let last = history.last().unwrap();
        assert_eq!(last.balance_after, Some(dec!(60.01)));
        assert_eq!(running, dec!(60.01));
    }
}
