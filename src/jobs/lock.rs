use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppResult;

/// Proof of lock ownership. Release requires the token, so a holder whose
/// lease expired and was taken over cannot release the new holder's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: Uuid,
}

/// Leased mutual exclusion across process instances. A lease that is never
/// released becomes reclaimable once its TTL passes, so a crashed holder
/// cannot wedge a job forever.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Try to take the lease. `None` means another live holder has it.
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<LockToken>>;

    /// Give the lease back. Returns false when the lease was no longer
    /// ours (expired and reclaimed).
    async fn release(&self, token: &LockToken) -> AppResult<bool>;
}

/// Lock coordinator backed by a `job_locks` table. Acquisition is a single
/// upsert that only steals rows whose lease has lapsed, so it is atomic
/// under concurrent acquirers.
pub struct PgLockCoordinator {
    pool: PgPool,
    holder: String,
}

impl PgLockCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            holder: format!("subpay-{}", Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl LockCoordinator for PgLockCoordinator {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<LockToken>> {
        let token = Uuid::new_v4();

        let row: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO job_locks (key, token, holder, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token,
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE job_locks.expires_at < NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(&self.holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|key| {
            debug!(key = %key, holder = %self.holder, "job lock acquired");
            LockToken { key, token }
        }))
    }

    async fn release(&self, token: &LockToken) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_locks WHERE key = $1 AND token = $2
            "#,
        )
        .bind(&token.key)
        .bind(token.token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Single-process coordinator for tests and local runs
pub struct InMemoryLockCoordinator {
    leases: parking_lot::Mutex<std::collections::HashMap<String, (Uuid, std::time::Instant)>>,
}

impl InMemoryLockCoordinator {
    pub fn new() -> Self {
        Self {
            leases: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryLockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockCoordinator for InMemoryLockCoordinator {
    async fn acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<LockToken>> {
        let mut leases = self.leases.lock();
        let now = std::time::Instant::now();

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4();
        leases.insert(key.to_string(), (token, now + ttl));
        Ok(Some(LockToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> AppResult<bool> {
        let mut leases = self.leases.lock();
        match leases.get(&token.key) {
            Some((held, _)) if *held == token.token => {
                leases.remove(&token.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_blocked_until_release() {
        let locks = InMemoryLockCoordinator::new();
        let ttl = Duration::from_secs(60);

        let first = locks.acquire("job:sweep", ttl).await.unwrap().unwrap();
        assert!(locks.acquire("job:sweep", ttl).await.unwrap().is_none());

        assert!(locks.release(&first).await.unwrap());
        assert!(locks.acquire("job:sweep", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let locks = InMemoryLockCoordinator::new();

        let stale = locks
            .acquire("job:monitor", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();

        let fresh = locks
            .acquire("job:monitor", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // The old holder can no longer release the reclaimed lease
        assert!(!locks.release(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_contend() {
        let locks = InMemoryLockCoordinator::new();
        let ttl = Duration::from_secs(60);

        assert!(locks.acquire("job:a", ttl).await.unwrap().is_some());
        assert!(locks.acquire("job:b", ttl).await.unwrap().is_some());
    }
}
