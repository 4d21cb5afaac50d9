use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::allocation::{AllocationOutcome, CreditAllocator};
use super::failures::{FailureCategory, FailureRegistry};
use super::metrics::MonitorMetrics;
use super::queue::{backoff_delay, PendingPaymentQueue};
use crate::error::{AppResult, PaymentError};
use crate::ledger::repository::LedgerRepository;
use crate::payments::models::{
    evaluate_transition, MonitoringStatus, Payment, PaymentPurpose, PaymentStatus,
    TransitionDecision,
};
use crate::payments::provider::{ProviderInvoice, SettlementProvider};
use crate::payments::repository::{NewPayment, PaymentRepository};
use crate::renewal::sweep::RenewalSweep;

/// What to do with a status observed from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// Same non-finished status observed again
    NoOp,
    /// Stored status is already `finished`: re-run the success side effects,
    /// which are individually idempotent, in case an earlier attempt died
    /// between the status write and allocation
    RedriveFinished,
    /// Stale or out-of-order read
    Ignore,
    /// Forward progress: apply the CAS and mirror `monitoring` onto the
    /// linked ledger row
    Advance { monitoring: MonitoringStatus },
}

pub fn plan_transition(current: PaymentStatus, observed: PaymentStatus) -> TransitionPlan {
    match evaluate_transition(current, observed) {
        TransitionDecision::Unchanged => {
            if current == PaymentStatus::Finished {
                TransitionPlan::RedriveFinished
            } else {
                TransitionPlan::NoOp
            }
        }
        TransitionDecision::Rejected => TransitionPlan::Ignore,
        TransitionDecision::Advance => {
            // `completed` is only written by deposit finalization, once the
            // credit has actually landed; a crash between the CAS and
            // allocation leaves the row rehydratable
            let monitoring = if observed.is_terminal() && observed != PaymentStatus::Finished {
                MonitoringStatus::Completed
            } else {
                MonitoringStatus::Pending
            };
            TransitionPlan::Advance { monitoring }
        }
    }
}

/// What to do after one more transient fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientAction {
    /// Keep the entry queued, gated by backoff for this retry number
    Retry(u32),
    /// Ceiling reached: park as monitoring_failed without asserting a
    /// financial status
    Park,
}

/// Retry ceiling rule: a payment gets `ceiling` retries after its first
/// failed fetch; the fetch that finds the counter at the ceiling parks it.
pub fn next_transient_action(current_retry_count: u32, ceiling: u32) -> TransientAction {
    if current_retry_count >= ceiling {
        TransientAction::Park
    } else {
        TransientAction::Retry(current_retry_count + 1)
    }
}

/// Polls the external settlement provider and drives payment state
/// transitions. Webhook deliveries land in `handle_provider_event`, which
/// shares the exact transition path with the poll loop, so push and pull
/// cannot diverge.
pub struct PaymentMonitor {
    queue: Arc<PendingPaymentQueue>,
    failures: Arc<FailureRegistry>,
    allocator: Arc<CreditAllocator>,
    provider: Arc<dyn SettlementProvider>,
    payments: Arc<PaymentRepository>,
    ledger: Arc<LedgerRepository>,
    renewal: Arc<RenewalSweep>,
    pub metrics: Arc<MonitorMetrics>,
    batch_size: usize,
    retry_ceiling: u32,
    backoff_base: Duration,
    running: AtomicBool,
    ticks: AtomicU64,
}

/// Queue entries pruned by their TTL while the ledger row is still
/// unresolved come back on this cadence instead of waiting for a restart
const REHYDRATE_EVERY_TICKS: u64 = 60;

impl PaymentMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PendingPaymentQueue>,
        failures: Arc<FailureRegistry>,
        allocator: Arc<CreditAllocator>,
        provider: Arc<dyn SettlementProvider>,
        payments: Arc<PaymentRepository>,
        ledger: Arc<LedgerRepository>,
        renewal: Arc<RenewalSweep>,
        metrics: Arc<MonitorMetrics>,
        batch_size: usize,
        retry_ceiling: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            queue,
            failures,
            allocator,
            provider,
            payments,
            ledger,
            renewal,
            metrics,
            batch_size,
            retry_ceiling,
            backoff_base,
            running: AtomicBool::new(true),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("payment monitoring started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("payment monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> &FailureRegistry {
        &self.failures
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Rebuild the pending queue from ledger rows whose monitoring never
    /// reached a terminal state, so a restart drops no payment
    pub async fn rehydrate(&self) -> AppResult<usize> {
        let unresolved = self.ledger.unresolved_payments().await?;
        let count = unresolved.len();
        for (payment_id, retry_count) in unresolved {
            self.queue
                .push_with_retry(payment_id, retry_count.max(0) as u32)
                .await;
        }
        if count > 0 {
            info!(count, "pending payment queue rehydrated from ledger");
        }
        Ok(count)
    }

    /// One monitoring tick: process a bounded batch of due queue entries
    pub async fn tick(&self) -> AppResult<usize> {
        if !self.is_running() {
            return Ok(0);
        }

        let tick_no = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick_no % REHYDRATE_EVERY_TICKS == 0 {
            self.rehydrate().await?;
        }

        let batch = self.queue.due_batch(self.batch_size).await;
        let processed = batch.len();

        for entry in batch {
            if let Err(e) = self.process_one(entry.payment_id).await {
                warn!(payment_id = %entry.payment_id, error = ?e, "monitoring entry failed");
            }
        }

        Ok(processed)
    }

    async fn process_one(&self, payment_id: Uuid) -> AppResult<()> {
        self.metrics.payments_checked.fetch_add(1, Ordering::Relaxed);

        let Some(payment) = self.payments.find(payment_id).await? else {
            warn!(payment_id = %payment_id, "queued payment no longer exists, dropping");
            self.queue.remove(payment_id).await;
            return Ok(());
        };

        match self.provider.get_status(&payment.provider_payment_id).await {
            Ok(status) => {
                self.apply_observed(&payment, status.status, status.amount_received)
                    .await
            }
            Err(e) => self.handle_transient(&payment, &e.to_string()).await,
        }
    }

    /// Shared transition path for both the poll loop and webhooks
    pub async fn apply_observed(
        &self,
        payment: &Payment,
        observed: PaymentStatus,
        amount_received: Option<Decimal>,
    ) -> AppResult<()> {
        match plan_transition(payment.status, observed) {
            TransitionPlan::NoOp => Ok(()),
            TransitionPlan::RedriveFinished => self.on_finished(payment, amount_received).await,
            TransitionPlan::Ignore => {
                self.metrics
                    .regressions_ignored
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    payment_id = %payment.id,
                    current = %payment.status,
                    observed = %observed,
                    "stale or out-of-order provider status ignored"
                );
                Ok(())
            }
            TransitionPlan::Advance { monitoring } => {
                let swapped = self
                    .payments
                    .transition(payment.id, payment.status, observed)
                    .await?;
                if !swapped {
                    // Another instance applied a transition first; its path
                    // also ran the side effects
                    warn!(payment_id = %payment.id, "concurrent transition detected, skipping");
                    return Ok(());
                }
                self.metrics
                    .transitions_applied
                    .fetch_add(1, Ordering::Relaxed);

                let retry_count =
                    self.queue.retry_count(payment.id).await.unwrap_or(0) as i32;
                self.ledger
                    .update_payment_tracking(payment.id, observed, monitoring, retry_count)
                    .await?;

                if observed == PaymentStatus::Finished {
                    self.on_finished(payment, amount_received).await?;
                } else if observed.is_terminal() {
                    self.on_terminal_failure(payment, observed).await;
                }
                Ok(())
            }
        }
    }

    async fn on_finished(
        &self,
        payment: &Payment,
        amount_received: Option<Decimal>,
    ) -> AppResult<()> {
        // Allocation applies only to payments backed by a pending deposit
        // row; renewal charges settle into the subscription instead
        if self.ledger.find_by_payment_id(payment.id).await?.is_some() {
            match self.allocator.allocate(payment.id, amount_received).await? {
                AllocationOutcome::Allocated => {
                    self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
                }
                AllocationOutcome::AlreadyAllocated => {
                    self.metrics
                        .duplicate_allocations
                        .fetch_add(1, Ordering::Relaxed);
                }
                AllocationOutcome::Rejected => {
                    warn!(payment_id = %payment.id, "allocation rejected for finished payment");
                }
            }
        }

        if payment.purpose == PaymentPurpose::SubscriptionRenewal {
            let mut settled = payment.clone();
            settled.status = PaymentStatus::Finished;
            self.renewal.reconcile_finished_charge(&settled).await?;
        }

        self.queue.remove(payment.id).await;
        self.failures.resolve(payment.id).await;
        Ok(())
    }

    async fn on_terminal_failure(&self, payment: &Payment, observed: PaymentStatus) {
        if let Some(category) = FailureCategory::from_terminal_status(observed) {
            self.failures
                .record(
                    payment.id,
                    category,
                    &format!("provider declared {}", observed),
                )
                .await;
            self.metrics
                .terminal_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        self.queue.remove(payment.id).await;
    }

    async fn handle_transient(&self, payment: &Payment, message: &str) -> AppResult<()> {
        self.metrics.transient_errors.fetch_add(1, Ordering::Relaxed);
        let current = self.queue.retry_count(payment.id).await.unwrap_or(0);

        match next_transient_action(current, self.retry_ceiling) {
            TransientAction::Retry(next) => {
                let delay = backoff_delay(self.backoff_base, current);
                self.queue.mark_retry(payment.id, delay).await;
                self.failures
                    .record(payment.id, FailureCategory::Network, message)
                    .await;
                self.ledger
                    .update_payment_tracking(
                        payment.id,
                        payment.status,
                        MonitoringStatus::Retrying,
                        next as i32,
                    )
                    .await?;
                Ok(())
            }
            TransientAction::Park => {
                self.metrics
                    .retry_ceiling_hits
                    .fetch_add(1, Ordering::Relaxed);
                self.queue.remove(payment.id).await;
                self.failures
                    .record(
                        payment.id,
                        FailureCategory::MonitoringFailed,
                        &format!("retry ceiling exceeded after {} retries", current),
                    )
                    .await;
                // The payment's financial status stays as last observed:
                // monitoring gave up, the provider never declared an outcome
                self.ledger
                    .update_payment_tracking(
                        payment.id,
                        payment.status,
                        MonitoringStatus::Failed,
                        current as i32,
                    )
                    .await?;
                warn!(
                    payment_id = %payment.id,
                    retries = current,
                    "payment parked as monitoring_failed"
                );
                Ok(())
            }
        }
    }

    /// Webhook entry point. Providers identify payments by their own id;
    /// unknown ids are an error so the provider retries delivery.
    pub async fn handle_provider_event(
        &self,
        provider: &str,
        provider_payment_id: &str,
        observed: PaymentStatus,
        amount_received: Option<Decimal>,
    ) -> AppResult<()> {
        let payment = self
            .payments
            .find_by_provider_payment_id(provider, provider_payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(provider_payment_id.to_string()))?;

        self.apply_observed(&payment, observed, amount_received).await
    }

    /// Administrative re-drive of a specific payment. Resets the retry
    /// counter; every downstream idempotency guard stays in force.
    pub async fn retry_payment(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.payments.get(payment_id).await?;
        if payment.status.is_terminal() {
            return Err(PaymentError::InvalidState {
                current: payment.status.to_string(),
                expected: "a non-terminal status".to_string(),
            }
            .into());
        }

        self.queue.remove(payment_id).await;
        self.queue.push(payment_id).await;
        self.failures.resolve(payment_id).await;
        self.ledger
            .update_payment_tracking(payment_id, payment.status, MonitoringStatus::Pending, 0)
            .await?;
        info!(payment_id = %payment_id, "payment re-queued for monitoring");
        Ok(())
    }

    /// Create a crypto invoice: provider-side invoice, payment intent,
    /// pending ledger deposit, and a queue entry so detection does not
    /// wait for the next rehydration.
    pub async fn create_invoice(
        &self,
        user_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> AppResult<(Payment, ProviderInvoice)> {
        let reference = Uuid::new_v4();
        let invoice = self
            .provider
            .create_invoice(amount, currency, &reference.to_string())
            .await?;

        let expires_at = invoice
            .expires_at
            .or_else(|| Some(Utc::now() + ChronoDuration::hours(24)));

        let payment = self
            .payments
            .create(NewPayment {
                user_id,
                provider: self.provider.name(),
                provider_payment_id: &invoice.provider_payment_id,
                purpose: PaymentPurpose::CreditPurchase,
                amount,
                currency,
                order_id: None,
                subscription_id: None,
                credit_transaction_id: None,
                expires_at,
                metadata: serde_json::json!({ "reference": reference }),
            })
            .await?;

        let deposit = self
            .ledger
            .insert_pending_deposit(
                user_id,
                payment.id,
                self.provider.name(),
                amount,
                &format!("Credit purchase via {}", self.provider.name()),
            )
            .await?;
        let payment = self
            .payments
            .link_credit_transaction(payment.id, deposit.id)
            .await?;

        self.queue.push(payment.id).await;
        info!(payment_id = %payment.id, amount = %amount, "crypto invoice created and queued");
        Ok((payment, invoice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::provider::mock::MockSettlementProvider;
    use rust_decimal_macros::dec;

    #[test]
    fn test_advance_to_finished_stays_rehydratable() {
        // Monitoring is only marked completed by deposit finalization; a
        // crash between the status write and allocation must leave the
        // ledger row visible to rehydration
        assert_eq!(
            plan_transition(PaymentStatus::Confirming, PaymentStatus::Finished),
            TransitionPlan::Advance {
                monitoring: MonitoringStatus::Pending
            }
        );
        assert_eq!(
            plan_transition(PaymentStatus::Pending, PaymentStatus::Waiting),
            TransitionPlan::Advance {
                monitoring: MonitoringStatus::Pending
            }
        );
    }

    #[test]
    fn test_declared_failure_completes_monitoring() {
        assert_eq!(
            plan_transition(PaymentStatus::Pending, PaymentStatus::Failed),
            TransitionPlan::Advance {
                monitoring: MonitoringStatus::Completed
            }
        );
        assert_eq!(
            plan_transition(PaymentStatus::Waiting, PaymentStatus::Expired),
            TransitionPlan::Advance {
                monitoring: MonitoringStatus::Completed
            }
        );
    }

    #[test]
    fn test_finished_is_redriven_until_side_effects_land() {
        assert_eq!(
            plan_transition(PaymentStatus::Finished, PaymentStatus::Finished),
            TransitionPlan::RedriveFinished
        );
        // Repeats of non-finished statuses stay no-ops
        assert_eq!(
            plan_transition(PaymentStatus::Waiting, PaymentStatus::Waiting),
            TransitionPlan::NoOp
        );
    }

    #[test]
    fn test_regressions_planned_as_ignored() {
        assert_eq!(
            plan_transition(PaymentStatus::Finished, PaymentStatus::Pending),
            TransitionPlan::Ignore
        );
        assert_eq!(
            plan_transition(PaymentStatus::Confirmed, PaymentStatus::Waiting),
            TransitionPlan::Ignore
        );
    }

    /// Scripted provider: ceiling+1 consecutive transient errors park the
    /// payment as monitoring_failed with exactly ceiling retries and no
    /// queue entry left behind
    #[tokio::test]
    async fn test_transient_errors_park_payment_after_ceiling() {
        let ceiling = 3u32;
        let provider = MockSettlementProvider::new(
            (0..=ceiling)
                .map(|_| MockSettlementProvider::network_err())
                .collect(),
        );
        let queue = PendingPaymentQueue::new(Duration::from_secs(3600));
        let failures = FailureRegistry::new(Duration::from_secs(3600));
        let id = Uuid::new_v4();
        queue.push(id).await;

        loop {
            let err = provider.get_status("inv-1").await.unwrap_err();
            match next_transient_action(queue.retry_count(id).await.unwrap_or(0), ceiling) {
                TransientAction::Retry(_) => {
                    queue.mark_retry(id, Duration::ZERO).await;
                    failures
                        .record(id, FailureCategory::Network, &err.to_string())
                        .await;
                }
                TransientAction::Park => {
                    queue.remove(id).await;
                    failures
                        .record(id, FailureCategory::MonitoringFailed, "retry ceiling exceeded")
                        .await;
                    break;
                }
            }
        }

        assert!(!queue.contains(id).await);
        let record = failures.get(id).await.unwrap();
        assert_eq!(record.category, FailureCategory::MonitoringFailed);
        assert_eq!(record.attempts, ceiling + 1);
        assert_eq!(
            provider.status_calls.load(Ordering::SeqCst),
            ceiling + 1
        );
    }

    /// A payment that first records a network failure and later settles
    /// leaves no active failure record and no queue entry
    #[tokio::test]
    async fn test_failure_record_cleared_when_payment_settles() {
        let provider = MockSettlementProvider::new(vec![
            MockSettlementProvider::network_err(),
            MockSettlementProvider::ok(PaymentStatus::Finished, Some(dec!(50))),
        ]);
        let queue = PendingPaymentQueue::new(Duration::from_secs(3600));
        let failures = FailureRegistry::new(Duration::from_secs(3600));
        let id = Uuid::new_v4();
        queue.push(id).await;

        let err = provider.get_status("inv-2").await.unwrap_err();
        failures
            .record(id, FailureCategory::Network, &err.to_string())
            .await;
        queue.mark_retry(id, Duration::ZERO).await;

        let status = provider.get_status("inv-2").await.unwrap();
        assert_eq!(status.amount_received, Some(dec!(50)));
        assert_eq!(
            plan_transition(PaymentStatus::Confirming, status.status),
            TransitionPlan::Advance {
                monitoring: MonitoringStatus::Pending
            }
        );

        queue.remove(id).await;
        failures.resolve(id).await;

        assert!(!queue.contains(id).await);
        assert!(failures.get(id).await.is_none());
        assert!(failures.list_active(None).await.is_empty());
    }

    /// A payment failing ceiling+1 consecutive fetches records exactly
    /// `ceiling` retries and then parks, with no further attempts
    #[test]
    fn test_retry_ceiling_counts() {
        let ceiling = 5;
        let mut retry_count = 0u32;
        let mut parked = false;

        for _attempt in 0..(ceiling + 1) {
            match next_transient_action(retry_count, ceiling) {
                TransientAction::Retry(next) => retry_count = next,
                TransientAction::Park => {
                    parked = true;
                    break;
                }
            }
        }

        assert!(parked);
        assert_eq!(retry_count, ceiling);
    }

    #[test]
    fn test_zero_ceiling_parks_immediately() {
        assert_eq!(next_transient_action(0, 0), TransientAction::Park);
    }
}
