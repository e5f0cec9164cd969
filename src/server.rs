use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handlers::{
    award_onboarding, create_adjustment, create_bot, delete_bot, get_bot, get_bot_stats,
    get_settings, get_transaction, get_treasury_status, get_wallet, health_check, list_bots,
    run_now, seed_treasury, sweep_now, toggle_bot, update_bot, update_settings, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Wallet / transaction lookups
                .route("/wallet/:user_id", get(get_wallet))
                .route("/transactions/:id", get(get_transaction))
                // Reward endpoints
                .route("/rewards/onboarding", post(award_onboarding))
                // Admin endpoints
                .route("/admin/adjustments", post(create_adjustment))
                .route("/admin/treasury", get(get_treasury_status))
                .route("/admin/treasury/seed", post(seed_treasury))
                .route("/admin/settings", get(get_settings))
                .route("/admin/settings", put(update_settings))
                .route("/admin/bots", post(create_bot).get(list_bots))
                .route("/admin/bots/stats", get(get_bot_stats))
                .route(
                    "/admin/bots/:id",
                    get(get_bot).put(update_bot).delete(delete_bot),
                )
                .route("/admin/bots/:id/toggle", post(toggle_bot))
                .route("/admin/run-now", post(run_now))
                .route("/admin/sweep-now", post(sweep_now)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
