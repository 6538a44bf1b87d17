use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            create_permit, get_balances, get_permit, get_reimbursement, health_check,
            list_user_permits, validate_signature, AppState,
        },
        models::CreatePermitRequest,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, validate_json, RateLimitLayer},
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let rate_limit = RateLimitLayer::new(config.rate_limit_requests, config.rate_limit_window_secs);

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Permit intake and status
                .route(
                    "/permits",
                    post(create_permit)
                        .route_layer(middleware::from_fn(validate_json::<CreatePermitRequest>)),
                )
                .route(
                    "/permits/validate-signature",
                    post(validate_signature)
                        .route_layer(middleware::from_fn(validate_json::<CreatePermitRequest>)),
                )
                .route("/permits/:permit_id", get(get_permit))
                .route("/permits/user/:user_address", get(list_user_permits))
                // Settlement
                .route("/reimbursements/:original_signature", get(get_reimbursement))
                // Admin
                .route("/admin/balances", get(get_balances))
                .layer(middleware::from_fn_with_state(rate_limit, rate_limit_middleware)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .layer(create_cors_layer(&config.cors_allowed_origins))
                .layer(CompressionLayer::new()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
