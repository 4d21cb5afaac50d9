use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::payments::models::PaymentStatus;

/// Why a payment is sitting in the failure registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Provider declared the payment expired
    Expired,
    /// Provider declared the payment failed
    Failed,
    /// Provider refunded the payment
    Refunded,
    /// Transient fetch error talking to the provider
    Network,
    /// Retry ceiling exceeded without a provider-declared outcome
    MonitoringFailed,
}

impl FailureCategory {
    /// Category for a provider-declared terminal status. `finished` has no
    /// failure category.
    pub fn from_terminal_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Failed => Some(FailureCategory::Failed),
            PaymentStatus::Expired => Some(FailureCategory::Expired),
            PaymentStatus::Refunded => Some(FailureCategory::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Expired => "expired",
            FailureCategory::Failed => "failed",
            FailureCategory::Refunded => "refunded",
            FailureCategory::Network => "network",
            FailureCategory::MonitoringFailed => "monitoring_failed",
        }
    }
}

/// Ephemeral, TTL'd record of a payment failure
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub payment_id: Uuid,
    pub category: FailureCategory,
    pub message: String,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Categorized registry of non-terminal and terminal payment failures.
/// Entries self-expire after `ttl`; `resolve` drops a record when the same
/// payment later reaches `finished`.
pub struct FailureRegistry {
    records: RwLock<HashMap<Uuid, FailureRecord>>,
    ttl: ChronoDuration,
}

impl FailureRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(7)),
        }
    }

    /// Record or refresh a failure. A category change (e.g. network ->
    /// monitoring_failed) replaces the category but keeps the attempt tally.
    pub async fn record(&self, payment_id: Uuid, category: FailureCategory, message: &str) {
        let now = Utc::now();
        let mut records = self.records.write().await;
        records
            .entry(payment_id)
            .and_modify(|r| {
                r.category = category;
                r.message = message.to_string();
                r.attempts += 1;
                r.last_seen = now;
            })
            .or_insert_with(|| FailureRecord {
                payment_id,
                category,
                message: message.to_string(),
                attempts: 1,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Clear the failure history of a payment that ultimately succeeded
    pub async fn resolve(&self, payment_id: Uuid) {
        if self.records.write().await.remove(&payment_id).is_some() {
            info!(payment_id = %payment_id, "failure record resolved after success");
        }
    }

    pub async fn get(&self, payment_id: Uuid) -> Option<FailureRecord> {
        let now = Utc::now();
        self.records
            .read()
            .await
            .get(&payment_id)
            .filter(|r| now - r.last_seen <= self.ttl)
            .cloned()
    }

    /// Active (unexpired) records, optionally filtered by category.
    /// Expired records are pruned on the way.
    pub async fn list_active(&self, category: Option<FailureCategory>) -> Vec<FailureRecord> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        records.retain(|_, r| now - r.last_seen <= self.ttl);

        let mut active: Vec<FailureRecord> = records
            .values()
            .filter(|r| category.map_or(true, |c| r.category == c))
            .cloned()
            .collect();
        active.sort_by_key(|r| r.last_seen);
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_resolve() {
        let registry = FailureRegistry::new(Duration::from_secs(3600));
        let id = Uuid::new_v4();

        registry
            .record(id, FailureCategory::Network, "timeout")
            .await;
        registry
            .record(id, FailureCategory::Network, "timeout")
            .await;

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.category, FailureCategory::Network);

        // A payment that later succeeds leaves no active record
        registry.resolve(id).await;
        assert!(registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_category_reclassification_keeps_history() {
        let registry = FailureRegistry::new(Duration::from_secs(3600));
        let id = Uuid::new_v4();

        registry.record(id, FailureCategory::Network, "reset").await;
        registry
            .record(id, FailureCategory::MonitoringFailed, "retry ceiling exceeded")
            .await;

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.category, FailureCategory::MonitoringFailed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_list_active_filters_and_expires() {
        let registry = FailureRegistry::new(Duration::from_secs(0));
        registry
            .record(Uuid::new_v4(), FailureCategory::Expired, "invoice lapsed")
            .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.list_active(None).await.is_empty());

        let registry = FailureRegistry::new(Duration::from_secs(3600));
        registry
            .record(Uuid::new_v4(), FailureCategory::Expired, "invoice lapsed")
            .await;
        registry
            .record(Uuid::new_v4(), FailureCategory::Failed, "declined")
            .await;

        assert_eq!(registry.list_active(None).await.len(), 2);
        assert_eq!(
            registry
                .list_active(Some(FailureCategory::Failed))
                .await
                .len(),
            1
        );
    }

    #[test]
    fn test_terminal_status_mapping() {
        assert_eq!(
            FailureCategory::from_terminal_status(PaymentStatus::Expired),
            Some(FailureCategory::Expired)
        );
        assert_eq!(
            FailureCategory::from_terminal_status(PaymentStatus::Finished),
            None
        );
        assert_eq!(
            FailureCategory::from_terminal_status(PaymentStatus::Confirming),
            None
        );
    }
}
