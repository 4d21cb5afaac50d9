use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    jobs::{JobScheduler, PgLockCoordinator},
    ledger::repository::LedgerRepository,
    monitoring::{
        CreditAllocator, FailureRegistry, MonitorMetrics, PaymentMonitor, PendingPaymentQueue,
    },
    payments::{
        provider::{HttpCardProcessor, HttpSettlementProvider},
        repository::PaymentRepository,
    },
    renewal::{AdminTaskRepository, OrderRepository, RenewalSweep, SubscriptionRepository},
};

/// Queue entries and allocation markers self-expire after a day; a payment
/// still unresolved by then comes back via rehydration at next restart
const QUEUE_ENTRY_TTL: Duration = Duration::from_secs(24 * 3600);
const ALLOCATION_MARKER_TTL: Duration = Duration::from_secs(24 * 3600);
const FAILURE_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const RENEWAL_BATCH_LIMIT: i64 = 100;

pub async fn initialize_app_state(config: &Config) -> AppResult<(AppState, JobScheduler)> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    // Repositories
    let ledger = Arc::new(LedgerRepository::new(pool.clone()));
    let payments = Arc::new(PaymentRepository::new(pool.clone()));
    let subscriptions = Arc::new(SubscriptionRepository::new(pool.clone()));
    let orders = Arc::new(OrderRepository::new(pool.clone()));
    let admin_tasks = Arc::new(AdminTaskRepository::new(pool.clone()));

    // External providers
    let settlement = Arc::new(HttpSettlementProvider::new(
        config.settlement_api_url.clone(),
        config.settlement_api_key.clone(),
    ));
    let card = Arc::new(HttpCardProcessor::new(
        config.card_api_url.clone(),
        config.card_api_key.clone(),
    ));

    // Monitoring components
    let queue = Arc::new(PendingPaymentQueue::new(QUEUE_ENTRY_TTL));
    let failures = Arc::new(FailureRegistry::new(FAILURE_RECORD_TTL));
    let metrics = Arc::new(MonitorMetrics::default());
    let allocator = Arc::new(CreditAllocator::new(
        ledger.clone(),
        payments.clone(),
        ALLOCATION_MARKER_TTL,
    ));

    let sweep = Arc::new(RenewalSweep::new(
        subscriptions.clone(),
        orders.clone(),
        admin_tasks.clone(),
        ledger.clone(),
        payments.clone(),
        card,
        config.renewal_lookahead,
        config.renewal_retry_interval,
        RENEWAL_BATCH_LIMIT,
    ));

    let monitor = Arc::new(PaymentMonitor::new(
        queue.clone(),
        failures.clone(),
        allocator,
        settlement,
        payments.clone(),
        ledger.clone(),
        sweep.clone(),
        metrics,
        config.monitor_batch_size,
        config.monitor_retry_ceiling,
        config.monitor_backoff_base,
    ));

    // Restore in-flight payments dropped by the last shutdown
    let rehydrated = monitor.rehydrate().await?;
    info!(rehydrated, "payment monitor initialized");

    // Background jobs, each tick guarded by a distributed lease
    let locks = Arc::new(PgLockCoordinator::new(pool.clone()));
    let mut scheduler = JobScheduler::new(locks, config.job_lock_ttl);

    {
        let monitor = monitor.clone();
        scheduler.register(
            "payment_monitor",
            config.monitor_interval,
            Duration::from_secs(5),
            move || {
                let monitor = monitor.clone();
                Box::pin(async move {
                    monitor.tick().await?;
                    Ok(())
                })
            },
        );
    }
    {
        let sweep = sweep.clone();
        scheduler.register(
            "renewal_sweep",
            config.renewal_interval,
            Duration::from_secs(15),
            move || {
                let sweep = sweep.clone();
                Box::pin(async move {
                    sweep.run().await?;
                    Ok(())
                })
            },
        );
    }

    let state = AppState {
        ledger,
        payments,
        admin_tasks,
        queue,
        monitor,
        sweep,
    };

    Ok((state, scheduler))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database pool configured, migrations applied");

    Ok(pool)
}
