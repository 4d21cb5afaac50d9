use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::FinalizeOutcome;
use crate::ledger::repository::LedgerRepository;
use crate::payments::models::PaymentStatus;
use crate::payments::repository::PaymentRepository;

/// Result of an allocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Allocated,
    AlreadyAllocated,
    /// Underlying payment is not in a finished state
    Rejected,
}

#[derive(Debug, Clone, Copy)]
enum Marker {
    InProgress(Instant),
    Done(Instant),
}

/// Fast-path half of the allocation idempotency guard: a short-lived
/// in-process marker keyed by payment id. The durable half is the
/// `payment_completed` flag in the ledger row's metadata; the marker only
/// short-circuits same-process races and duplicate queue entries.
pub struct AllocationGuard {
    markers: Mutex<HashMap<Uuid, Marker>>,
    ttl: Duration,
}

impl AllocationGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            markers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Claim the payment. Returns false when another caller already holds
    /// or completed it within the TTL.
    pub fn begin(&self, payment_id: Uuid) -> bool {
        let now = Instant::now();
        let mut markers = self.markers.lock();
        match markers.get(&payment_id) {
            Some(Marker::InProgress(at)) | Some(Marker::Done(at))
                if now.duration_since(*at) < self.ttl =>
            {
                false
            }
            _ => {
                markers.insert(payment_id, Marker::InProgress(now));
                true
            }
        }
    }

    pub fn finish(&self, payment_id: Uuid) {
        self.markers
            .lock()
            .insert(payment_id, Marker::Done(Instant::now()));
    }

    /// Drop the claim so a later attempt can retry (allocation errored or
    /// was rejected)
    pub fn abort(&self, payment_id: Uuid) {
        self.markers.lock().remove(&payment_id);
    }
}

/// Idempotently materializes a ledger credit from a finalized payment
pub struct CreditAllocator {
    ledger: Arc<LedgerRepository>,
    payments: Arc<PaymentRepository>,
    guard: AllocationGuard,
}

impl CreditAllocator {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        payments: Arc<PaymentRepository>,
        marker_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            payments,
            guard: AllocationGuard::new(marker_ttl),
        }
    }

    /// Credit the user for a settled payment, exactly once. A retry, a
    /// duplicate queue entry, or a concurrent second instance observes
    /// `AlreadyAllocated` instead of crediting twice.
    pub async fn allocate(
        &self,
        payment_id: Uuid,
        settled_amount: Option<Decimal>,
    ) -> AppResult<AllocationOutcome> {
        if !self.guard.begin(payment_id) {
            return Ok(AllocationOutcome::AlreadyAllocated);
        }

        let result = self.allocate_guarded(payment_id, settled_amount).await;
        match &result {
            Ok(AllocationOutcome::Allocated) | Ok(AllocationOutcome::AlreadyAllocated) => {
                self.guard.finish(payment_id);
            }
            Ok(AllocationOutcome::Rejected) | Err(_) => {
                self.guard.abort(payment_id);
            }
        }
        result
    }

    async fn allocate_guarded(
        &self,
        payment_id: Uuid,
        settled_amount: Option<Decimal>,
    ) -> AppResult<AllocationOutcome> {
        let payment = self.payments.get(payment_id).await?;

        // Defensive check against out-of-order invocation
        if payment.status != PaymentStatus::Finished {
            warn!(
                payment_id = %payment_id,
                status = %payment.status,
                "allocation rejected: payment not finished"
            );
            return Ok(AllocationOutcome::Rejected);
        }

        let amount = settled_amount.unwrap_or(payment.amount);

        match self.ledger.finalize_deposit(payment_id, amount).await? {
            FinalizeOutcome::Finalized(row) => {
                info!(
                    payment_id = %payment_id,
                    user_id = %payment.user_id,
                    amount = %amount,
                    balance_after = ?row.balance_after,
                    "credit allocated"
                );
                Ok(AllocationOutcome::Allocated)
            }
            FinalizeOutcome::AlreadyCompleted => Ok(AllocationOutcome::AlreadyAllocated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_single_claim() {
        let guard = AllocationGuard::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        assert!(guard.begin(id));
        assert!(!guard.begin(id));

        guard.finish(id);
        assert!(!guard.begin(id));
    }

    #[test]
    fn test_guard_abort_allows_retry() {
        let guard = AllocationGuard::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        assert!(guard.begin(id));
        guard.abort(id);
        assert!(guard.begin(id));
    }

    #[test]
    fn test_guard_marker_expires() {
        let guard = AllocationGuard::new(Duration::from_millis(0));
        let id = Uuid::new_v4();

        assert!(guard.begin(id));
        // TTL of zero: the stale marker no longer blocks
        assert!(guard.begin(id));
    }

    #[tokio::test]
    async fn test_guard_concurrent_claims_exactly_one_wins() {
        let guard = Arc::new(AllocationGuard::new(Duration::from_secs(60)));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move { guard.begin(id) }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
