use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::admin_tasks::{AdminTaskCategory, AdminTaskRepository};
use super::models::*;
use super::repository::{OrderRepository, SubscriptionRepository};
use crate::error::AppResult;
use crate::ledger::models::SpendOutcome;
use crate::ledger::repository::LedgerRepository;
use crate::payments::models::{Payment, PaymentPurpose};
use crate::payments::provider::CardProcessor;
use crate::payments::repository::{NewPayment, PaymentRepository};

pub const REASON_AUTO_RENEWED_CREDITS: &str = "auto_renewed_credits";
pub const REASON_AUTO_RENEWED_CARD: &str = "auto_renewed_card";
pub const REASON_RENEWAL_PAYMENT_PENDING: &str = "renewal_payment_pending";

#[derive(Debug, Default, Serialize)]
pub struct SweepStats {
    pub candidates: usize,
    pub renewed: usize,
    pub charges_created: usize,
    pub escalated: usize,
    pub errors: usize,
}

/// Selects due subscriptions and executes the correct renewal path,
/// escalating to the admin task queue whenever required data is missing.
pub struct RenewalSweep {
    subscriptions: Arc<SubscriptionRepository>,
    orders: Arc<OrderRepository>,
    admin_tasks: Arc<AdminTaskRepository>,
    ledger: Arc<LedgerRepository>,
    payments: Arc<PaymentRepository>,
    card: Arc<dyn CardProcessor>,
    lookahead: Duration,
    retry_interval: Duration,
    batch_limit: i64,
}

impl RenewalSweep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<SubscriptionRepository>,
        orders: Arc<OrderRepository>,
        admin_tasks: Arc<AdminTaskRepository>,
        ledger: Arc<LedgerRepository>,
        payments: Arc<PaymentRepository>,
        card: Arc<dyn CardProcessor>,
        lookahead: Duration,
        retry_interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            subscriptions,
            orders,
            admin_tasks,
            ledger,
            payments,
            card,
            lookahead,
            retry_interval,
            batch_limit,
        }
    }

    pub fn card_provider(&self) -> &'static str {
        self.card.name()
    }

    /// One sweep tick. Each subscription is handled independently: a
    /// failure on one candidate never blocks the rest of the batch.
    pub async fn run(&self) -> AppResult<SweepStats> {
        let candidates = self
            .subscriptions
            .due_candidates(self.lookahead, self.batch_limit)
            .await?;

        let mut stats = SweepStats {
            candidates: candidates.len(),
            ..Default::default()
        };

        for sub in candidates {
            match self.sweep_one(&sub, &mut stats).await {
                Ok(()) => {}
                Err(e) => {
                    stats.errors += 1;
                    error!(subscription_id = %sub.id, error = ?e, "renewal sweep candidate failed");
                }
            }
        }

        if stats.candidates > 0 {
            info!(
                candidates = stats.candidates,
                renewed = stats.renewed,
                charges = stats.charges_created,
                escalated = stats.escalated,
                "renewal sweep completed"
            );
        }
        Ok(stats)
    }

    async fn sweep_one(&self, sub: &Subscription, stats: &mut SweepStats) -> AppResult<()> {
        let order = match sub.order_id {
            Some(order_id) => self.orders.find(order_id).await?,
            None => None,
        };
        let item = match &order {
            Some(order) => self.orders.first_item(order.id).await?,
            None => None,
        };

        let resolved = resolve_renewal(sub, order.as_ref(), item.as_ref());
        match plan_renewal(&resolved) {
            RenewalAction::EscalateMissingMethod => {
                self.escalate(
                    sub,
                    AdminTaskCategory::RenewalMissingMethod,
                    "renewal method could not be resolved",
                    None,
                    stats,
                )
                .await
            }
            RenewalAction::EscalateMissingPrice => {
                self.escalate(
                    sub,
                    AdminTaskCategory::RenewalMissingPrice,
                    "renewal price could not be resolved",
                    None,
                    stats,
                )
                .await
            }
            RenewalAction::DebitBalance {
                price_cents,
                duration_months,
            } => {
                self.renew_from_balance(sub, price_cents, duration_months, stats)
                    .await
            }
            RenewalAction::ChargeCard {
                price_cents,
                currency,
                duration_months,
            } => {
                self.renew_via_charge(sub, price_cents, &currency, duration_months, stats)
                    .await
            }
            RenewalAction::ManualReview { method } => {
                self.escalate(
                    sub,
                    AdminTaskCategory::RenewalManualReview,
                    &format!("unrecognized renewal method: {}", method),
                    None,
                    stats,
                )
                .await
            }
        }
    }

    async fn escalate(
        &self,
        sub: &Subscription,
        category: AdminTaskCategory,
        note: &str,
        status_reason: Option<&str>,
        stats: &mut SweepStats,
    ) -> AppResult<()> {
        self.admin_tasks
            .open_for_subscription(category, sub.id, sub.user_id, note)
            .await?;
        self.subscriptions
            .push_next_billing(sub.id, self.retry_interval, status_reason)
            .await?;
        stats.escalated += 1;
        Ok(())
    }

    async fn renew_from_balance(
        &self,
        sub: &Subscription,
        price_cents: i64,
        duration_months: i32,
        stats: &mut SweepStats,
    ) -> AppResult<()> {
        let amount = cents_to_decimal(price_cents);
        let description = format!("Subscription renewal {}", sub.id);

        match self.ledger.spend(sub.user_id, amount, &description).await? {
            SpendOutcome::Ok(_) => {
                self.subscriptions
                    .apply_renewal_success(sub.id, duration_months, REASON_AUTO_RENEWED_CREDITS)
                    .await?;
                stats.renewed += 1;
                info!(subscription_id = %sub.id, amount = %amount, "renewed from balance");
                Ok(())
            }
            SpendOutcome::InsufficientBalance { available } => {
                self.escalate(
                    sub,
                    AdminTaskCategory::RenewalCreditFailed,
                    &format!(
                        "balance debit failed: required {}, available {}",
                        amount, available
                    ),
                    None,
                    stats,
                )
                .await
            }
        }
    }

    async fn renew_via_charge(
        &self,
        sub: &Subscription,
        price_cents: i64,
        currency: &str,
        duration_months: i32,
        stats: &mut SweepStats,
    ) -> AppResult<()> {
        // Never issue a second charge while one is still in flight
        if self.payments.has_pending_renewal_charge(sub.id).await? {
            return self
                .escalate(
                    sub,
                    AdminTaskCategory::RenewalPaymentPending,
                    "renewal charge already pending",
                    Some(REASON_RENEWAL_PAYMENT_PENDING),
                    stats,
                )
                .await;
        }

        let amount = cents_to_decimal(price_cents);
        let metadata = serde_json::json!({
            "subscription_id": sub.id,
            "duration_months": duration_months,
        });

        let provider_payment_id = match self
            .card
            .create_charge(amount, currency, metadata.clone())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(subscription_id = %sub.id, error = ?e, "renewal charge creation failed");
                return self
                    .escalate(
                        sub,
                        AdminTaskCategory::RenewalPaymentFailed,
                        &format!("charge creation failed: {}", e),
                        None,
                        stats,
                    )
                    .await;
            }
        };

        self.payments
            .create(NewPayment {
                user_id: sub.user_id,
                provider: self.card.name(),
                provider_payment_id: &provider_payment_id,
                purpose: PaymentPurpose::SubscriptionRenewal,
                amount,
                currency,
                order_id: sub.order_id,
                subscription_id: Some(sub.id),
                credit_transaction_id: None,
                expires_at: None,
                metadata,
            })
            .await?;
        stats.charges_created += 1;

        // The charge confirms asynchronously; park a pending task and defer
        self.escalate(
            sub,
            AdminTaskCategory::RenewalPaymentPending,
            "renewal charge created, awaiting confirmation",
            Some(REASON_RENEWAL_PAYMENT_PENDING),
            stats,
        )
        .await
    }

    /// Reconciliation path, driven by the monitoring loop: when a renewal
    /// charge reaches `finished`, advance the period and auto-close the
    /// pending escalation. The monitor may re-drive this after a partial
    /// earlier attempt; completing the open task doubles as the idempotency
    /// marker, so the period advances at most once per settled charge.
    pub async fn reconcile_finished_charge(&self, payment: &Payment) -> AppResult<()> {
        if payment.purpose != PaymentPurpose::SubscriptionRenewal {
            return Ok(());
        }
        let Some(subscription_id) = payment.subscription_id else {
            return Ok(());
        };

        let claimed = self
            .admin_tasks
            .complete_open(AdminTaskCategory::RenewalPaymentPending, subscription_id)
            .await?;
        if !claimed {
            return Ok(());
        }

        match self.advance_settled_period(payment, subscription_id).await {
            Ok(()) => {
                info!(
                    subscription_id = %subscription_id,
                    payment_id = %payment.id,
                    "renewal charge settled, period advanced"
                );
                Ok(())
            }
            Err(e) => {
                // Give the claim back so a later re-drive retries the advance
                self.admin_tasks
                    .open_for_subscription(
                        AdminTaskCategory::RenewalPaymentPending,
                        subscription_id,
                        payment.user_id,
                        "renewal charge settled, period advance pending retry",
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn advance_settled_period(
        &self,
        payment: &Payment,
        subscription_id: Uuid,
    ) -> AppResult<()> {
        let sub = self.subscriptions.get(subscription_id).await?;
        let order = match sub.order_id {
            Some(order_id) => self.orders.find(order_id).await?,
            None => None,
        };
        let item = match &order {
            Some(order) => self.orders.first_item(order.id).await?,
            None => None,
        };
        let duration_months = payment
            .metadata
            .get("duration_months")
            .and_then(|v| v.as_i64())
            .map(|m| m as i32)
            .unwrap_or_else(|| {
                resolve_renewal(&sub, order.as_ref(), item.as_ref()).duration_months
            });

        self.subscriptions
            .apply_renewal_success(subscription_id, duration_months, REASON_AUTO_RENEWED_CARD)
            .await?;
        Ok(())
    }
}
