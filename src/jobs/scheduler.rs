use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lock::LockCoordinator;
use crate::error::AppResult;

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

struct JobSpec {
    name: &'static str,
    interval: Duration,
    initial_delay: Duration,
    run: JobFn,
}

/// Runs registered jobs on fixed intervals, each tick guarded by a
/// distributed lease so at most one instance executes a given job at a
/// time. Lock errors skip the tick rather than running unguarded.
pub struct JobScheduler {
    locks: Arc<dyn LockCoordinator>,
    lock_ttl: Duration,
    jobs: Vec<JobSpec>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(locks: Arc<dyn LockCoordinator>, lock_ttl: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            locks,
            lock_ttl,
            jobs: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn register<F>(&mut self, name: &'static str, interval: Duration, initial_delay: Duration, run: F)
    where
        F: Fn() -> BoxFuture<'static, AppResult<()>> + Send + Sync + 'static,
    {
        self.jobs.push(JobSpec {
            name,
            interval,
            initial_delay,
            run: Arc::new(run),
        });
    }

    /// Spawn one task per registered job. Handles run until `shutdown`.
    pub fn spawn_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.jobs.len());

        for job in self.jobs.drain(..) {
            let locks = Arc::clone(&self.locks);
            let lock_ttl = self.lock_ttl;
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                info!(job = job.name, interval_secs = job.interval.as_secs(), "job registered");

                tokio::select! {
                    _ = tokio::time::sleep(job.initial_delay) => {}
                    _ = shutdown_rx.changed() => return,
                }

                let mut ticker = tokio::time::interval(job.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_guarded(&*locks, lock_ttl, job.name, &job.run).await;
                        }
                        _ = shutdown_rx.changed() => {
                            info!(job = job.name, "job shutting down");
                            return;
                        }
                    }
                }
            }));
        }

        handles
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_guarded(
    locks: &dyn LockCoordinator,
    lock_ttl: Duration,
    name: &'static str,
    run: &JobFn,
) {
    let key = format!("job:{}", name);

    let token = match locks.acquire(&key, lock_ttl).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!(job = name, "tick skipped, lock held elsewhere");
            return;
        }
        Err(e) => {
            // Fail closed: no lock, no work
            warn!(job = name, error = ?e, "lock acquisition failed, tick skipped");
            return;
        }
    };

    if let Err(e) = run().await {
        error!(job = name, error = ?e, "job tick failed");
    }

    if let Err(e) = locks.release(&token).await {
        warn!(job = name, error = ?e, "lock release failed, lease will expire");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::jobs::lock::{InMemoryLockCoordinator, LockToken};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct BrokenLocks;

    #[async_trait]
    impl LockCoordinator for BrokenLocks {
        async fn acquire(&self, _key: &str, _ttl: Duration) -> AppResult<Option<LockToken>> {
            Err(AppError::Internal("lock store unavailable".to_string()))
        }

        async fn release(&self, _token: &LockToken) -> AppResult<bool> {
            Err(AppError::Internal("lock store unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_jobs_tick_until_shutdown() {
        let mut scheduler = JobScheduler::new(
            Arc::new(InMemoryLockCoordinator::new()),
            Duration::from_secs(5),
        );

        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler.register("counter", Duration::from_millis(10), Duration::ZERO, move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let handles = scheduler.spawn_all();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_lock_failure_skips_tick() {
        let mut scheduler = JobScheduler::new(Arc::new(BrokenLocks), Duration::from_secs(5));

        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler.register("guarded", Duration::from_millis(10), Duration::ZERO, move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let handles = scheduler.spawn_all();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_job_error_does_not_kill_schedule() {
        let mut scheduler = JobScheduler::new(
            Arc::new(InMemoryLockCoordinator::new()),
            Duration::from_secs(5),
        );

        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        scheduler.register("flaky", Duration::from_millis(10), Duration::ZERO, move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(AppError::Internal("first tick blows up".to_string()))
                } else {
                    Ok(())
                }
            })
        });

        let handles = scheduler.spawn_all();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        // Ticks after the failure still ran
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
