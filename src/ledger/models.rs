use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::payments::models::{MonitoringStatus, PaymentStatus};

/// Ledger transaction type. The sign of `amount` is fixed by the type:
/// credits are non-negative, debits non-positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Purchase,
    Refund,
    Bonus,
    Withdrawal,
    RefundReversal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Bonus => "bonus",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::RefundReversal => "refund_reversal",
        }
    }

    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit | TransactionType::Refund | TransactionType::Bonus
        )
    }

    /// Check that the signed amount is admissible for this type
    pub fn accepts_amount(&self, amount: Decimal) -> bool {
        if self.is_credit() {
            amount >= Decimal::ZERO
        } else {
            amount <= Decimal::ZERO
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable ledger row. Balance fields are NULL until the row is finalized
/// (pending crypto deposits are created before settlement); once set they are
/// never mutated, and only finalized rows count toward the running balance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub description: Option<String>,
    pub payment_id: Option<Uuid>,
    pub payment_provider: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub monitoring_status: Option<MonitoringStatus>,
    pub retry_count: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    pub fn is_finalized(&self) -> bool {
        self.balance_after.is_some()
    }

    /// Durable half of the allocation idempotency guard
    pub fn is_payment_completed(&self) -> bool {
        self.metadata
            .get("payment_completed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Result of a balance debit attempt
#[derive(Debug)]
pub enum SpendOutcome {
    Ok(CreditTransaction),
    InsufficientBalance { available: Decimal },
}

/// Result of finalizing a pending deposit (allocation path)
#[derive(Debug)]
pub enum FinalizeOutcome {
    Finalized(CreditTransaction),
    AlreadyCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_sign_fixed_by_type() {
        assert!(TransactionType::Deposit.accepts_amount(dec!(10)));
        assert!(!TransactionType::Deposit.accepts_amount(dec!(-10)));
        assert!(TransactionType::Purchase.accepts_amount(dec!(-10)));
        assert!(!TransactionType::Purchase.accepts_amount(dec!(10)));
        // Zero is admissible on both sides
        assert!(TransactionType::Bonus.accepts_amount(Decimal::ZERO));
        assert!(TransactionType::Withdrawal.accepts_amount(Decimal::ZERO));
    }

    #[test]
    fn test_payment_completed_flag() {
        let mut tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tx_type: TransactionType::Deposit,
            amount: dec!(5),
            balance_before: None,
            balance_after: None,
            description: None,
            payment_id: Some(Uuid::new_v4()),
            payment_provider: Some("nowpayments".to_string()),
            payment_status: Some(PaymentStatus::Pending),
            monitoring_status: Some(MonitoringStatus::Pending),
            retry_count: 0,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(!tx.is_payment_completed());
        assert!(!tx.is_finalized());

        tx.metadata = serde_json::json!({ "payment_completed": true });
        assert!(tx.is_payment_completed());
    }
}
