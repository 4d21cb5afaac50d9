use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Expired,
}

/// Subscription entity. Once `auto_renew` is true, the billing/date fields
/// are owned by the renewal sweep.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SubscriptionStatus,
    pub auto_renew: bool,
    pub renewal_method: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub duration_months: Option<i32>,
    pub order_id: Option<Uuid>,
    pub next_billing_at: Option<DateTime<Utc>>,
    pub renewal_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order linked from a subscription, second hop in the fallback chain
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub renewal_method: Option<String>,
    pub total_cents: Option<i64>,
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Order line item, third hop in the fallback chain
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub duration_months: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// The mechanism by which a subscription is kept active past its period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalMethod {
    /// Debit the user's credit balance
    Credits,
    /// Create a new provider-side charge
    Card,
}

impl RenewalMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credits" | "balance" => Some(RenewalMethod::Credits),
            "card" | "charge" => Some(RenewalMethod::Card),
            _ => None,
        }
    }
}

/// Renewal inputs after walking the fallback chain
/// subscription -> order -> order item -> inferred from date span
#[derive(Debug, Clone)]
pub struct ResolvedRenewal {
    pub method_raw: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: String,
    pub duration_months: i32,
}

pub fn resolve_renewal(
    sub: &Subscription,
    order: Option<&Order>,
    item: Option<&OrderItem>,
) -> ResolvedRenewal {
    let method_raw = sub
        .renewal_method
        .clone()
        .or_else(|| order.and_then(|o| o.renewal_method.clone()));

    let price_cents = sub
        .price_cents
        .or_else(|| item.and_then(|i| i.price_cents))
        .or_else(|| order.and_then(|o| o.total_cents));

    let currency = sub
        .currency
        .clone()
        .or_else(|| item.and_then(|i| i.currency.clone()))
        .or_else(|| order.and_then(|o| o.currency.clone()))
        .unwrap_or_else(|| "USD".to_string());

    let duration_months = sub
        .duration_months
        .or_else(|| item.and_then(|i| i.duration_months))
        .or_else(|| {
            let start = sub.renewal_date.unwrap_or(sub.created_at);
            sub.end_date.and_then(|end| infer_duration_months(start, end))
        })
        .unwrap_or(1);

    ResolvedRenewal {
        method_raw,
        price_cents,
        currency,
        duration_months,
    }
}

/// Last resort for the duration: round the current period span to whole
/// months
pub fn infer_duration_months(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<i32> {
    let days = (end - start).num_days();
    if days <= 0 {
        return None;
    }
    let months = ((days as f64) / 30.44).round() as i32;
    Some(months.max(1))
}

/// What the sweep decided to do with one due subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalAction {
    /// No renewal method anywhere in the chain
    EscalateMissingMethod,
    /// No price anywhere in the chain
    EscalateMissingPrice,
    /// Debit the ledger and advance the period
    DebitBalance {
        price_cents: i64,
        duration_months: i32,
    },
    /// Create a new one-time charge
    ChargeCard {
        price_cents: i64,
        currency: String,
        duration_months: i32,
    },
    /// Renewal method present but unrecognized
    ManualReview { method: String },
}

/// The renewal decision table. Pending-charge deduplication for the card
/// path happens at execution time, where the payments table is visible.
pub fn plan_renewal(resolved: &ResolvedRenewal) -> RenewalAction {
    let Some(method_raw) = resolved.method_raw.as_deref() else {
        return RenewalAction::EscalateMissingMethod;
    };
    let Some(price_cents) = resolved.price_cents else {
        return RenewalAction::EscalateMissingPrice;
    };

    match RenewalMethod::parse(method_raw) {
        Some(RenewalMethod::Credits) => RenewalAction::DebitBalance {
            price_cents,
            duration_months: resolved.duration_months,
        },
        Some(RenewalMethod::Card) => RenewalAction::ChargeCard {
            price_cents,
            currency: resolved.currency.clone(),
            duration_months: resolved.duration_months,
        },
        None => RenewalAction::ManualReview {
            method: method_raw.to_string(),
        },
    }
}

/// Cents to fixed-point ledger currency
pub fn cents_to_decimal(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn subscription() -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: SubscriptionStatus::Active,
            auto_renew: true,
            renewal_method: None,
            price_cents: None,
            currency: None,
            duration_months: None,
            order_id: None,
            next_billing_at: Some(now - Duration::hours(1)),
            renewal_date: None,
            end_date: Some(now + Duration::days(2)),
            status_reason: None,
            created_at: now - Duration::days(30),
            updated_at: now,
        }
    }

    #[test]
    fn test_missing_method_escalates() {
        let sub = subscription();
        let resolved = resolve_renewal(&sub, None, None);
        assert_eq!(plan_renewal(&resolved), RenewalAction::EscalateMissingMethod);
    }

    #[test]
    fn test_missing_price_escalates_after_method() {
        let mut sub = subscription();
        sub.renewal_method = Some("credits".to_string());
        let resolved = resolve_renewal(&sub, None, None);
        assert_eq!(plan_renewal(&resolved), RenewalAction::EscalateMissingPrice);
    }

    #[test]
    fn test_credits_method_debits_balance() {
        let mut sub = subscription();
        sub.renewal_method = Some("credits".to_string());
        sub.price_cents = Some(999);
        sub.duration_months = Some(1);
        let resolved = resolve_renewal(&sub, None, None);
        assert_eq!(
            plan_renewal(&resolved),
            RenewalAction::DebitBalance {
                price_cents: 999,
                duration_months: 1,
            }
        );
        assert_eq!(cents_to_decimal(999), dec!(9.99));
    }

    #[test]
    fn test_unrecognized_method_goes_to_manual_review() {
        let mut sub = subscription();
        sub.renewal_method = Some("paypal".to_string());
        sub.price_cents = Some(999);
        let resolved = resolve_renewal(&sub, None, None);
        assert_eq!(
            plan_renewal(&resolved),
            RenewalAction::ManualReview {
                method: "paypal".to_string()
            }
        );
    }

    #[test]
    fn test_fallback_chain_order() {
        let mut sub = subscription();
        sub.order_id = Some(Uuid::new_v4());

        let order = Order {
            id: sub.order_id.unwrap(),
            user_id: sub.user_id,
            renewal_method: Some("card".to_string()),
            total_cents: Some(2999),
            currency: Some("EUR".to_string()),
            created_at: sub.created_at,
        };
        let item = OrderItem {
            id: Uuid::new_v4(),
            order_id: order.id,
            price_cents: Some(1499),
            currency: None,
            duration_months: Some(3),
            created_at: sub.created_at,
        };

        // Item price wins over order total; method falls back to the order
        let resolved = resolve_renewal(&sub, Some(&order), Some(&item));
        assert_eq!(resolved.method_raw.as_deref(), Some("card"));
        assert_eq!(resolved.price_cents, Some(1499));
        assert_eq!(resolved.currency, "EUR");
        assert_eq!(resolved.duration_months, 3);

        // Subscription-level fields shadow everything
        sub.price_cents = Some(500);
        sub.currency = Some("USD".to_string());
        let resolved = resolve_renewal(&sub, Some(&order), Some(&item));
        assert_eq!(resolved.price_cents, Some(500));
        assert_eq!(resolved.currency, "USD");
    }

    #[test]
    fn test_duration_inferred_from_date_span() {
        let start = Utc::now();
        assert_eq!(infer_duration_months(start, start + Duration::days(31)), Some(1));
        assert_eq!(infer_duration_months(start, start + Duration::days(365)), Some(12));
        assert_eq!(infer_duration_months(start, start - Duration::days(1)), None);

        // A sub with no explicit duration but a month-long period infers 1
        let mut sub = subscription();
        sub.renewal_date = Some(start - Duration::days(30));
        sub.end_date = Some(start);
        let resolved = resolve_renewal(&sub, None, None);
        assert_eq!(resolved.duration_months, 1);
    }
}
