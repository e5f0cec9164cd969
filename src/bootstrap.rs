use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handlers::AppState,
    config::Config,
    engine::{
        orchestrator::{EngagementOrchestrator, OrchestratorConfig},
        refunds::RefundProcessor,
        scheduler::{EngineScheduler, ScheduleConfig},
        transactions::CoinTransactionService,
        treasury::TreasuryService,
    },
    error::AppResult,
    ledger::{pg::PgLedgerStore, LedgerStore},
    notify::TracingNotifier,
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    // Core components
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool));
    let transactions = Arc::new(CoinTransactionService::new(
        store.clone(),
        Arc::new(TracingNotifier),
    ));
    let treasury = Arc::new(TreasuryService::new(store.clone()));
    info!("✅ Ledger and treasury services initialized");

    let orchestrator = Arc::new(EngagementOrchestrator::new(
        store.clone(),
        transactions.clone(),
        treasury.clone(),
        OrchestratorConfig {
            scan_lookback: chrono::Duration::minutes(config.scan_lookback_minutes),
            ..OrchestratorConfig::default()
        },
    ));
    let refunds = Arc::new(RefundProcessor::new(
        store.clone(),
        transactions.clone(),
        treasury.clone(),
    ));
    info!("✅ Engagement orchestrator and refund processor initialized");

    let scheduler = Arc::new(EngineScheduler::new(
        ScheduleConfig {
            cycle_minutes: config.cycle_minutes,
            active_start_hour: config.active_start_hour,
            active_end_hour: config.active_end_hour,
            sweep_hour: config.sweep_hour,
        },
        orchestrator,
        refunds,
        treasury.clone(),
    ));
    scheduler.clone().start();
    info!(
        "✅ Scheduler started: {}-minute cycles between {:02}:00 and {:02}:00 UTC, sweep at {:02}:00 UTC",
        config.cycle_minutes, config.active_start_hour, config.active_end_hour, config.sweep_hour
    );

    Ok(AppState {
        store,
        transactions,
        treasury,
        scheduler,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("✓ Database pool configured and migrations applied");

    Ok(pool)
}
