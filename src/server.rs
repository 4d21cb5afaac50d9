use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::{
    handler::{
        create_invoice, get_balance, get_metrics, get_payment, health_check, list_admin_tasks,
        list_failures, list_transactions, monitoring_state, reset_metrics, retry_payment,
        run_renewal_sweep, spend_credits, start_monitoring, stop_monitoring, AppState,
    },
    webhooks::{card_webhook, settlement_webhook},
};

pub fn create_app(state: AppState) -> Router {
    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route("/invoices", post(create_invoice))
                .route("/credits/spend", post(spend_credits))
                .route("/credits/:user_id/balance", get(get_balance))
                .route("/credits/:user_id/transactions", get(list_transactions))
                .route("/payments/:id", get(get_payment)),
        )
        .nest(
            "/webhooks",
            Router::new()
                .route("/settlement", post(settlement_webhook))
                .route("/card", post(card_webhook)),
        )
        .nest(
            "/admin",
            Router::new()
                .route("/monitoring", get(monitoring_state))
                .route("/monitoring/start", post(start_monitoring))
                .route("/monitoring/stop", post(stop_monitoring))
                .route("/monitoring/metrics", get(get_metrics))
                .route("/monitoring/metrics/reset", post(reset_metrics))
                .route("/failures", get(list_failures))
                .route("/payments/:id/retry", post(retry_payment))
                .route("/tasks", get(list_admin_tasks))
                .route("/renewals/run", post(run_renewal_sweep)),
        )
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
