use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Provider-facing payment status.
///
/// `pending -> {waiting, confirming, confirmed, sending, partially_paid}* ->
/// {finished | failed | expired | refunded}`; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Waiting,
    Confirming,
    Confirmed,
    Sending,
    PartiallyPaid,
    Finished,
    Failed,
    Expired,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Waiting => "waiting",
            PaymentStatus::Confirming => "confirming",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Sending => "sending",
            PaymentStatus::PartiallyPaid => "partially_paid",
            PaymentStatus::Finished => "finished",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_provider_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "waiting" => Some(PaymentStatus::Waiting),
            "confirming" => Some(PaymentStatus::Confirming),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "sending" => Some(PaymentStatus::Sending),
            "partially_paid" => Some(PaymentStatus::PartiallyPaid),
            "finished" | "succeeded" | "success" => Some(PaymentStatus::Finished),
            "failed" | "error" => Some(PaymentStatus::Failed),
            "expired" => Some(PaymentStatus::Expired),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Finished
                | PaymentStatus::Failed
                | PaymentStatus::Expired
                | PaymentStatus::Refunded
        )
    }

    /// Monotonic position in the lifecycle. Terminal states share the top
    /// rank: once one is reached no further transition is accepted.
    fn rank(&self) -> u8 {
        match self {
            PaymentStatus::Pending => 0,
            PaymentStatus::Waiting => 1,
            PaymentStatus::Confirming => 2,
            PaymentStatus::Confirmed => 3,
            PaymentStatus::Sending => 4,
            PaymentStatus::PartiallyPaid => 5,
            PaymentStatus::Finished
            | PaymentStatus::Failed
            | PaymentStatus::Expired
            | PaymentStatus::Refunded => 10,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of comparing a stored status against one observed from the
/// provider. Poll and webhook paths both go through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    /// Observed status is forward progress - apply it
    Advance,
    /// Same status observed again - nothing to do
    Unchanged,
    /// Stale or out-of-order read - log and ignore
    Rejected,
}

/// Only monotonic progress toward a terminal state is accepted. A status
/// that regresses (e.g. `finished` observed, then later `pending`) indicates
/// a stale read and is ignored rather than applied.
pub fn evaluate_transition(current: PaymentStatus, observed: PaymentStatus) -> TransitionDecision {
    if current == observed {
        return TransitionDecision::Unchanged;
    }
    if current.is_terminal() {
        return TransitionDecision::Rejected;
    }
    if observed.rank() > current.rank() {
        TransitionDecision::Advance
    } else {
        TransitionDecision::Rejected
    }
}

/// Monitoring-side status tracked on the linked ledger row. `Pending` and
/// `Retrying` are non-terminal: the pending queue is rehydrated from them
/// at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "monitoring_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MonitoringStatus {
    Pending,
    Retrying,
    Completed,
    Failed,
}

impl MonitoringStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitoringStatus::Completed | MonitoringStatus::Failed)
    }
}

/// What a payment is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_purpose", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    CreditPurchase,
    OrderPayment,
    SubscriptionRenewal,
}

/// Provider-agnostic payment intent. Created when a charge or crypto
/// invoice is initiated; mutated only by status-transition logic; never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_payment_id: String,
    pub status: PaymentStatus,
    pub purpose: PaymentPurpose,
    pub amount: Decimal,
    pub currency: String,
    pub order_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub credit_transaction_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_progress_accepted() {
        assert_eq!(
            evaluate_transition(PaymentStatus::Pending, PaymentStatus::Confirming),
            TransitionDecision::Advance
        );
        assert_eq!(
            evaluate_transition(PaymentStatus::Confirming, PaymentStatus::Finished),
            TransitionDecision::Advance
        );
        assert_eq!(
            evaluate_transition(PaymentStatus::PartiallyPaid, PaymentStatus::Expired),
            TransitionDecision::Advance
        );
    }

    #[test]
    fn test_same_status_is_noop() {
        assert_eq!(
            evaluate_transition(PaymentStatus::Waiting, PaymentStatus::Waiting),
            TransitionDecision::Unchanged
        );
    }

    /// Feeding [pending, confirming, finished, pending] must leave the
    /// stored status at finished, with the last event ignored
    #[test]
    fn test_regression_after_terminal_ignored() {
        let mut current = PaymentStatus::Pending;
        let observed = [
            PaymentStatus::Pending,
            PaymentStatus::Confirming,
            PaymentStatus::Finished,
            PaymentStatus::Pending,
        ];
        for status in observed {
            if evaluate_transition(current, status) == TransitionDecision::Advance {
                current = status;
            }
        }
        assert_eq!(current, PaymentStatus::Finished);
    }

    #[test]
    fn test_regression_between_progress_states_ignored() {
        assert_eq!(
            evaluate_transition(PaymentStatus::Confirmed, PaymentStatus::Waiting),
            TransitionDecision::Rejected
        );
    }

    #[test]
    fn test_no_transition_between_terminal_states() {
        assert_eq!(
            evaluate_transition(PaymentStatus::Failed, PaymentStatus::Finished),
            TransitionDecision::Rejected
        );
        assert_eq!(
            evaluate_transition(PaymentStatus::Finished, PaymentStatus::Refunded),
            TransitionDecision::Rejected
        );
    }

    #[test]
    fn test_provider_status_aliases() {
        assert_eq!(
            PaymentStatus::from_provider_str("succeeded"),
            Some(PaymentStatus::Finished)
        );
        assert_eq!(PaymentStatus::from_provider_str("bogus"), None);
    }
}
