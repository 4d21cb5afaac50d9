use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// A payment awaiting status resolution
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub payment_id: Uuid,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

/// Exponential backoff with a little jitter so concurrent instances do not
/// hammer the provider in lockstep
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let exp = base.as_secs().saturating_mul(1u64 << retry_count.min(10));
    let jitter = rand::thread_rng().gen_range(0..=exp / 4 + 1);
    Duration::from_secs(exp + jitter)
}

/// Shared work list of payment ids awaiting resolution.
///
/// This is a cache, never a system of record: it is rebuilt at process
/// start from ledger rows whose monitoring status is non-terminal, and
/// entries self-expire after `entry_ttl`.
pub struct PendingPaymentQueue {
    entries: RwLock<HashMap<Uuid, QueueEntry>>,
    entry_ttl: ChronoDuration,
}

impl PendingPaymentQueue {
    pub fn new(entry_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            entry_ttl: ChronoDuration::from_std(entry_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }

    /// Enqueue a payment for monitoring. Re-pushing an already queued
    /// payment keeps the existing entry (no duplicate work units).
    pub async fn push(&self, payment_id: Uuid) {
        self.push_with_retry(payment_id, 0).await;
    }

    /// Used by rehydration, which restores the persisted retry count
    pub async fn push_with_retry(&self, payment_id: Uuid, retry_count: u32) {
        let mut entries = self.entries.write().await;
        entries.entry(payment_id).or_insert_with(|| {
            let now = Utc::now();
            QueueEntry {
                payment_id,
                retry_count,
                next_attempt_at: now,
                enqueued_at: now,
            }
        });
    }

    pub async fn remove(&self, payment_id: Uuid) {
        self.entries.write().await.remove(&payment_id);
    }

    pub async fn contains(&self, payment_id: Uuid) -> bool {
        self.entries.read().await.contains_key(&payment_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Entries whose backoff gate has passed, oldest first, bounded by
    /// `limit`. Expired entries are pruned on the way.
    pub async fn due_batch(&self, limit: usize) -> Vec<QueueEntry> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        let expired: Vec<Uuid> = entries
            .values()
            .filter(|e| now - e.enqueued_at > self.entry_ttl)
            .map(|e| e.payment_id)
            .collect();
        for id in expired {
            warn!(payment_id = %id, "pending queue entry expired without resolution");
            entries.remove(&id);
        }

        let mut due: Vec<QueueEntry> = entries
            .values()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.enqueued_at);
        due.truncate(limit);
        due
    }

    /// Keep the entry queued after a transient failure, gated by backoff
    pub async fn mark_retry(&self, payment_id: Uuid, delay: Duration) -> u32 {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&payment_id) {
            Some(entry) => {
                entry.retry_count += 1;
                entry.next_attempt_at =
                    Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                entry.retry_count
            }
            None => 0,
        }
    }

    pub async fn retry_count(&self, payment_id: Uuid) -> Option<u32> {
        self.entries
            .read()
            .await
            .get(&payment_id)
            .map(|e| e.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let queue = PendingPaymentQueue::new(Duration::from_secs(3600));
        let id = Uuid::new_v4();

        queue.push(id).await;
        queue.push_with_retry(id, 3).await;

        assert_eq!(queue.len().await, 1);
        // The original entry survives the second push
        assert_eq!(queue.retry_count(id).await, Some(0));
    }

    #[tokio::test]
    async fn test_due_batch_is_bounded_and_gated() {
        let queue = PendingPaymentQueue::new(Duration::from_secs(3600));
        for _ in 0..5 {
            queue.push(Uuid::new_v4()).await;
        }
        let gated = Uuid::new_v4();
        queue.push(gated).await;
        queue.mark_retry(gated, Duration::from_secs(600)).await;

        let batch = queue.due_batch(3).await;
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|e| e.payment_id != gated));

        let full = queue.due_batch(100).await;
        assert_eq!(full.len(), 5);
    }

    #[tokio::test]
    async fn test_expired_entries_pruned() {
        let queue = PendingPaymentQueue::new(Duration::from_secs(0));
        queue.push(Uuid::new_v4()).await;

        // TTL of zero: entry expires immediately
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.due_batch(10).await.is_empty());
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_pruned_entry_can_be_rehydrated() {
        let queue = PendingPaymentQueue::new(Duration::from_secs(0));
        let id = Uuid::new_v4();
        queue.push(id).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.due_batch(10).await.is_empty());
        assert!(!queue.contains(id).await);

        // The periodic rehydration pass restores it, retry count intact
        queue.push_with_retry(id, 2).await;
        assert!(queue.contains(id).await);
        assert_eq!(queue.retry_count(id).await, Some(2));
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let base = Duration::from_secs(30);
        let d0 = backoff_delay(base, 0);
        let d3 = backoff_delay(base, 3);
        assert!(d0 >= Duration::from_secs(30));
        assert!(d3 >= Duration::from_secs(240));
        // Jitter is bounded by a quarter of the exponential term
        assert!(d3 <= Duration::from_secs(240 + 61));
    }
}
