use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::engine::orchestrator::CycleReport;
use crate::engine::refunds::SweepReport;
use crate::engine::scheduler::EngineScheduler;
use crate::engine::transactions::{CoinTransactionService, TransactionOutcome, TransactionRequest};
use crate::engine::treasury::{TreasuryService, TreasuryStatus};
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub transactions: Arc<CoinTransactionService>,
    pub treasury: Arc<TreasuryService>,
    pub scheduler: Arc<EngineScheduler>,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Award a one-time onboarding reward
/// POST /rewards/onboarding
pub async fn award_onboarding(
    State(state): State<AppState>,
    Json(request): Json<OnboardingRewardRequest>,
) -> AppResult<Json<TransactionOutcome>> {
    let task = request.task;
    let outcome = state
        .transactions
        .execute_transaction(TransactionRequest {
            user_id: request.user_id,
            amount: task.reward(),
            trigger: task.trigger(),
            channel: TransactionChannel::Onboarding,
            description: format!("Onboarding reward: {}", task.as_str()),
            metadata: serde_json::json!({ "task": task.as_str() }),
            idempotency_key: task.idempotency_key(request.user_id),
        })
        .await;
    Ok(Json(outcome))
}

/// Manual balance correction by an operator
/// POST /admin/adjustments
pub async fn create_adjustment(
    State(state): State<AppState>,
    Json(request): Json<AdjustmentRequest>,
) -> AppResult<Json<TransactionOutcome>> {
    info!(
        user_id = %request.user_id,
        amount = request.amount,
        reason = %request.reason,
        "manual adjustment requested"
    );
    let outcome = state
        .transactions
        .execute_transaction(TransactionRequest {
            user_id: request.user_id,
            amount: request.amount,
            trigger: TransactionTrigger::AdminAdjustment,
            channel: TransactionChannel::System,
            description: request.reason.clone(),
            metadata: serde_json::json!({ "reason": request.reason }),
            idempotency_key: request.idempotency_key,
        })
        .await;
    Ok(Json(outcome))
}

/// GET /wallet/:user_id
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<WalletResponse>> {
    let account = state.store.get_or_create_user_account(user_id).await?;
    Ok(Json(WalletResponse::from_account(user_id, &account)))
}

/// Transaction with its journal entries
/// GET /transactions/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let transaction = state
        .store
        .get_transaction(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("transaction {}", id)))?;
    let entries = state.store.get_journal_entries(id).await?;
    Ok(Json(serde_json::json!({
        "transaction": transaction,
        "entries": entries,
    })))
}

/// GET /admin/treasury
pub async fn get_treasury_status(
    State(state): State<AppState>,
) -> AppResult<Json<TreasuryStatus>> {
    Ok(Json(state.treasury.status().await?))
}

/// Seed or top up the treasury float
/// POST /admin/treasury/seed
pub async fn seed_treasury(
    State(state): State<AppState>,
    Json(request): Json<SeedTreasuryRequest>,
) -> AppResult<Json<TransactionOutcome>> {
    let outcome = state
        .transactions
        .mint_to_treasury(
            request.amount,
            request.idempotency_key,
            "Treasury seeding".to_string(),
        )
        .await;
    Ok(Json(outcome))
}

/// GET /admin/settings
pub async fn get_settings(State(state): State<AppState>) -> AppResult<Json<EngineSettings>> {
    Ok(Json(state.treasury.settings().await?))
}

/// PUT /admin/settings
pub async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<UpdateSettingsRequest>,
) -> AppResult<Json<EngineSettings>> {
    let mut settings = state.treasury.settings().await?;
    if let Some(bots_enabled) = request.bots_enabled {
        settings.bots_enabled = bots_enabled;
    }
    if let Some(limit) = request.treasury_daily_limit {
        if limit < 0 {
            return Err(AppError::BadRequest(
                "treasury_daily_limit must be non-negative".to_string(),
            ));
        }
        settings.treasury_daily_limit = limit;
    }
    if let Some(hours) = request.refund_delay_hours {
        if hours < 0 {
            return Err(AppError::BadRequest(
                "refund_delay_hours must be non-negative".to_string(),
            ));
        }
        settings.refund_delay_hours = hours;
    }
    Ok(Json(state.treasury.update_settings(settings).await?))
}

/// POST /admin/bots
pub async fn create_bot(
    State(state): State<AppState>,
    Json(request): Json<CreateBotRequest>,
) -> AppResult<(StatusCode, Json<Bot>)> {
    if request.display_name.trim().is_empty() {
        return Err(AppError::BadRequest("display_name is required".to_string()));
    }
    let bot = state.store.create_bot(request.into_bot()).await?;
    info!(bot_id = %bot.id, display_name = %bot.display_name, "bot created");
    Ok((StatusCode::CREATED, Json(bot)))
}

/// GET /admin/bots
pub async fn list_bots(State(state): State<AppState>) -> AppResult<Json<Vec<Bot>>> {
    Ok(Json(state.store.list_bots().await?))
}

/// GET /admin/bots/:id
pub async fn get_bot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Bot>> {
    let bot = state
        .store
        .get_bot(id)
        .await?
        .ok_or(crate::error::BotError::NotFound(id))?;
    Ok(Json(bot))
}

/// PUT /admin/bots/:id
pub async fn update_bot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateBotRequest>,
) -> AppResult<Json<Bot>> {
    let bot = state
        .store
        .get_bot(id)
        .await?
        .ok_or(crate::error::BotError::NotFound(id))?;
    let updated = state.store.update_bot(request.apply_to(bot)).await?;
    Ok(Json(updated))
}

/// POST /admin/bots/:id/toggle
pub async fn toggle_bot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ToggleBotRequest>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.set_bot_active(id, request.active).await?;
    info!(bot_id = %id, active = request.active, "bot toggled");
    Ok(Json(serde_json::json!({ "id": id, "active": request.active })))
}

/// DELETE /admin/bots/:id
pub async fn delete_bot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.store.delete_bot(id).await?;
    info!(bot_id = %id, "bot deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Per-bot dashboard counters
/// GET /admin/bots/stats
pub async fn get_bot_stats(State(state): State<AppState>) -> AppResult<Json<Vec<BotStats>>> {
    Ok(Json(state.store.bot_stats().await?))
}

/// Run an engagement cycle immediately
/// POST /admin/run-now
pub async fn run_now(State(state): State<AppState>) -> AppResult<Json<CycleReport>> {
    Ok(Json(state.scheduler.run_now().await?))
}

/// Run the refund sweep immediately
/// POST /admin/sweep-now
pub async fn sweep_now(State(state): State<AppState>) -> AppResult<Json<Option<SweepReport>>> {
    Ok(Json(state.scheduler.run_daily_sweep().await?))
}
