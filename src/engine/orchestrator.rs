use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::transactions::{CoinTransactionService, TransactionRequest};
use crate::engine::treasury::TreasuryService;
use crate::error::{AppError, AppResult, BotError, TreasuryError};
use crate::ledger::models::*;
use crate::ledger::store::{LedgerStore, NewBotAction, NewPendingRefund};

/// Tunables for one engagement cycle
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How far back the content/listing scans look
    pub scan_lookback: Duration,
    /// Per-item engagement probabilities
    pub like_chance: f64,
    pub follow_chance: f64,
    pub unlock_chance: f64,
    pub purchase_chance: f64,
    /// Minimum trust level before a bot may move coins
    pub min_trust_for_spending: i16,
    /// Flat price a bot pays the author to unlock gated content
    pub content_unlock_price: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scan_lookback: Duration::minutes(30),
            like_chance: 0.35,
            follow_chance: 0.15,
            unlock_chance: 0.10,
            purchase_chance: 0.25,
            min_trust_for_spending: 2,
            content_unlock_price: 5,
        }
    }
}

/// What one cycle did, for logs and the run-now endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub bots_considered: usize,
    pub content_scanned: usize,
    pub eas_scanned: usize,
    pub likes: u32,
    pub follows: u32,
    pub unlocks: u32,
    pub purchases: u32,
    pub coins_spent: i64,
    /// Set once the treasury declines; later monetary attempts are skipped
    pub spending_stopped: bool,
    pub skipped_disabled: bool,
    pub errors: u32,
}

enum MonetaryOutcome {
    Done,
    Skipped,
    StopSpending,
}

/// Drives simulated engagement
///
/// Each cycle scans recent forum content and marketplace listings, then
/// lets every awake, active bot roll for an action on each new target.
/// All coin movement goes through the transaction service; the orchestrator
/// itself only decides and records.
pub struct EngagementOrchestrator {
    store: Arc<dyn LedgerStore>,
    transactions: Arc<CoinTransactionService>,
    treasury: Arc<TreasuryService>,
    config: OrchestratorConfig,
}

/// Probability roll in a sync helper so the thread-local generator never
/// lives across an await point
fn roll(chance: f64) -> bool {
    if chance <= 0.0 {
        return false;
    }
    if chance >= 1.0 {
        return true;
    }
    rand::rng().random_bool(chance)
}

impl EngagementOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        transactions: Arc<CoinTransactionService>,
        treasury: Arc<TreasuryService>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            transactions,
            treasury,
            config,
        }
    }

    /// Content items published inside the lookback window
    pub async fn scan_for_new_content(&self, now: DateTime<Utc>) -> AppResult<Vec<ContentItem>> {
        self.store.recent_content(now - self.config.scan_lookback).await
    }

    /// Marketplace listings published inside the lookback window
    pub async fn scan_for_new_eas(&self, now: DateTime<Utc>) -> AppResult<Vec<EaListing>> {
        self.store.recent_eas(now - self.config.scan_lookback).await
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> AppResult<CycleReport> {
        let mut report = CycleReport::default();

        let settings = self.store.get_bot_settings().await?;
        if !settings.bots_enabled {
            debug!("engagement cycle skipped, bots disabled");
            report.skipped_disabled = true;
            return Ok(report);
        }

        let content = self.scan_for_new_content(now).await?;
        let eas = self.scan_for_new_eas(now).await?;
        let bots = self.store.list_active_bots().await?;
        report.content_scanned = content.len();
        report.eas_scanned = eas.len();

        for bot in &bots {
            if !bot.persona.is_awake(now) {
                continue;
            }
            report.bots_considered += 1;

            for item in &content {
                self.engage_content(bot, item, now, &settings, &mut report).await;
            }
            for listing in &eas {
                self.engage_listing(bot, listing, now, &settings, &mut report).await;
            }
        }

        info!(
            bots = report.bots_considered,
            likes = report.likes,
            follows = report.follows,
            unlocks = report.unlocks,
            purchases = report.purchases,
            coins_spent = report.coins_spent,
            spending_stopped = report.spending_stopped,
            errors = report.errors,
            "engagement cycle finished"
        );
        Ok(report)
    }

    async fn engage_content(
        &self,
        bot: &Bot,
        item: &ContentItem,
        now: DateTime<Utc>,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        match self.store.has_bot_acted(bot.id, item.id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(bot_id = %bot.id, target_id = %item.id, error = %e, "target lookup failed");
                report.errors += 1;
                return;
            }
        }

        // A paid unlock subsumes any further engagement with the item; a
        // like may still be paired with a follow of the author
        if !report.spending_stopped
            && bot.trust_level >= self.config.min_trust_for_spending
            && roll(self.config.unlock_chance)
        {
            match self
                .monetary_action(
                    bot,
                    BotActionKind::Unlock,
                    item.id,
                    item.author_id,
                    self.config.content_unlock_price,
                    false,
                    TransactionTrigger::BotUnlock,
                    format!("Content unlock: {}", item.title),
                    now,
                    settings,
                    report,
                )
                .await
            {
                MonetaryOutcome::Done => {
                    report.unlocks += 1;
                    return;
                }
                MonetaryOutcome::StopSpending => report.spending_stopped = true,
                MonetaryOutcome::Skipped => {}
            }
        }

        if roll(self.config.like_chance)
            && self.free_action(bot, BotActionKind::Like, item.id, report).await
        {
            report.likes += 1;
        }

        if roll(self.config.follow_chance) {
            // Follow targets the author, so the dedup key is the author id
            match self.store.has_bot_acted(bot.id, item.author_id).await {
                Ok(false) => {
                    if self
                        .free_action(bot, BotActionKind::Follow, item.author_id, report)
                        .await
                    {
                        report.follows += 1;
                    }
                }
                Ok(true) => {}
                Err(e) => {
                    warn!(bot_id = %bot.id, error = %e, "author lookup failed");
                    report.errors += 1;
                }
            }
        }
    }

    async fn engage_listing(
        &self,
        bot: &Bot,
        listing: &EaListing,
        now: DateTime<Utc>,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        if report.spending_stopped || bot.trust_level < self.config.min_trust_for_spending {
            return;
        }
        match self.store.has_bot_acted(bot.id, listing.id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(bot_id = %bot.id, target_id = %listing.id, error = %e, "target lookup failed");
                report.errors += 1;
                return;
            }
        }
        if !roll(self.config.purchase_chance) {
            return;
        }

        match self
            .monetary_action(
                bot,
                BotActionKind::Purchase,
                listing.id,
                listing.seller_id,
                listing.price,
                true,
                TransactionTrigger::BotPurchase,
                format!("EA purchase: {}", listing.name),
                now,
                settings,
                report,
            )
            .await
        {
            MonetaryOutcome::Done => {
                report.purchases += 1;
                report.coins_spent += listing.price;
            }
            MonetaryOutcome::StopSpending => report.spending_stopped = true,
            MonetaryOutcome::Skipped => {}
        }
    }

    /// Record a non-monetary action; cap exhaustion is a quiet skip
    async fn free_action(
        &self,
        bot: &Bot,
        kind: BotActionKind,
        target_id: Uuid,
        report: &mut CycleReport,
    ) -> bool {
        let result = self
            .store
            .record_bot_action(NewBotAction {
                bot_id: bot.id,
                kind,
                target_id,
                amount: 0,
                refundable: false,
                cap: bot.caps.for_kind(kind),
            })
            .await;

        match result {
            Ok(_) => true,
            Err(AppError::Bot(BotError::CapExhausted { .. })) => {
                debug!(bot_id = %bot.id, kind = kind.as_str(), "daily cap reached");
                false
            }
            Err(e) => {
                warn!(bot_id = %bot.id, kind = kind.as_str(), error = %e, "action failed");
                report.errors += 1;
                false
            }
        }
    }

    /// Cap reservation, treasury authorization, then the funding transaction,
    /// with compensation on every downstream failure so a declined spend
    /// leaves no cap slot or counter consumed
    #[allow(clippy::too_many_arguments)]
    async fn monetary_action(
        &self,
        bot: &Bot,
        kind: BotActionKind,
        target_id: Uuid,
        payee_id: Uuid,
        amount: i64,
        refundable: bool,
        trigger: TransactionTrigger,
        description: String,
        now: DateTime<Utc>,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) -> MonetaryOutcome {
        let action = match self
            .store
            .record_bot_action(NewBotAction {
                bot_id: bot.id,
                kind,
                target_id,
                amount,
                refundable,
                cap: bot.caps.for_kind(kind),
            })
            .await
        {
            Ok(action) => action,
            Err(AppError::Bot(BotError::CapExhausted { .. })) => {
                debug!(bot_id = %bot.id, kind = kind.as_str(), "daily cap reached");
                return MonetaryOutcome::Skipped;
            }
            Err(e) => {
                warn!(bot_id = %bot.id, kind = kind.as_str(), error = %e, "action failed");
                report.errors += 1;
                return MonetaryOutcome::Skipped;
            }
        };

        let reservation = match self.treasury.reserve_spend(amount).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.undo_action(action.id).await;
                return match e {
                    AppError::Treasury(
                        TreasuryError::Exhausted { .. }
                        | TreasuryError::DailyLimitExceeded { .. }
                        | TreasuryError::Disabled,
                    ) => {
                        info!(bot_id = %bot.id, amount, error = %e, "treasury declined, stopping spending this cycle");
                        MonetaryOutcome::StopSpending
                    }
                    other => {
                        warn!(bot_id = %bot.id, error = %other, "treasury reservation failed");
                        report.errors += 1;
                        MonetaryOutcome::Skipped
                    }
                };
            }
        };

        let outcome = self
            .transactions
            .execute_transaction(TransactionRequest {
                user_id: payee_id,
                amount,
                trigger,
                channel: TransactionChannel::Bot,
                description,
                metadata: serde_json::json!({
                    "bot_id": bot.id,
                    "action_id": action.id,
                    "target_id": target_id,
                }),
                idempotency_key: format!("bot-{}-{}", kind.as_str(), action.id),
            })
            .await;

        if !outcome.success {
            self.treasury.release(reservation).await;
            self.undo_action(action.id).await;
            if outcome.is_treasury_exhausted() {
                return MonetaryOutcome::StopSpending;
            }
            warn!(
                bot_id = %bot.id,
                kind = kind.as_str(),
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "funding transaction failed"
            );
            report.errors += 1;
            return MonetaryOutcome::Skipped;
        }

        if refundable {
            let refund = NewPendingRefund {
                action_id: action.id,
                bot_id: bot.id,
                seller_id: payee_id,
                refund_amount: amount,
                original_treasury_amount: amount,
                due_at: now + Duration::hours(settings.refund_delay_hours),
            };
            if let Err(e) = self.store.create_pending_refund(refund).await {
                // The purchase stands; the reversal just has to be queued
                // by an operator
                warn!(action_id = %action.id, error = %e, "could not schedule refund");
                report.errors += 1;
            }
        }

        MonetaryOutcome::Done
    }

    async fn undo_action(&self, action_id: Uuid) {
        if let Err(e) = self.store.remove_bot_action(action_id).await {
            warn!(%action_id, error = %e, "could not roll back bot action");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::notify::NoopNotifier;

    fn test_config() -> OrchestratorConfig {
        // Deterministic: everything always fires
        OrchestratorConfig {
            like_chance: 1.0,
            follow_chance: 1.0,
            unlock_chance: 0.0,
            purchase_chance: 1.0,
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        store: Arc<MemoryLedgerStore>,
        config: OrchestratorConfig,
    ) -> EngagementOrchestrator {
        let transactions = Arc::new(CoinTransactionService::new(
            store.clone(),
            Arc::new(NoopNotifier),
        ));
        let treasury = Arc::new(TreasuryService::new(store.clone()));
        EngagementOrchestrator::new(store, transactions, treasury, config)
    }

    fn awake_bot(trust_level: i16) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            display_name: "TraderJane".into(),
            purpose: "engagement".into(),
            trust_level,
            persona: BotPersona {
                active_from_hour: 0,
                active_until_hour: 24,
                ..BotPersona::default()
            },
            caps: BotCaps::default(),
            active: true,
            spent_today: 0,
            created_at: Utc::now(),
        }
    }

    fn content(author_id: Uuid) -> ContentItem {
        ContentItem {
            id: Uuid::new_v4(),
            author_id,
            title: "Gold breakout setups".into(),
            created_at: Utc::now(),
        }
    }

    fn listing(seller_id: Uuid, price: i64) -> EaListing {
        EaListing {
            id: Uuid::new_v4(),
            seller_id,
            name: "TrendRider".into(),
            price,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cycle_likes_and_follows_new_content() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let bot = awake_bot(0);
        store.create_bot(bot.clone()).await.unwrap();
        let author = Uuid::new_v4();
        store.add_content(content(author));

        let orch = orchestrator(store.clone(), test_config());
        let report = orch.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.likes, 1);
        assert_eq!(report.follows, 1);
        assert_eq!(report.purchases, 0);

        // A second cycle sees nothing new to do
        let report = orch.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.likes, 0);
        assert_eq!(report.follows, 0);
    }

    #[tokio::test]
    async fn test_purchase_pays_seller_and_schedules_refund() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let bot = awake_bot(3);
        store.create_bot(bot.clone()).await.unwrap();
        let seller = Uuid::new_v4();
        store.add_ea(listing(seller, 40));

        let orch = orchestrator(store.clone(), test_config());
        let report = orch.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.purchases, 1);
        assert_eq!(report.coins_spent, 40);

        let wallet = store.get_or_create_user_account(seller).await.unwrap();
        let treasury = store.get_treasury_account().await.unwrap();
        assert_eq!(wallet.balance, 40);
        assert_eq!(treasury.balance, 960);

        let refunds = store
            .get_pending_refunds(Utc::now() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].refund_amount, 40);
        assert!(refunds[0].due_at > Utc::now());

        let updated = store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(updated.spent_today, 40);
    }

    #[tokio::test]
    async fn test_low_trust_bot_never_spends() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        store.create_bot(awake_bot(0)).await.unwrap();
        store.add_ea(listing(Uuid::new_v4(), 40));

        let orch = orchestrator(store.clone(), test_config());
        let report = orch.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(report.purchases, 0);
        assert_eq!(store.get_treasury_account().await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn test_daily_cap_limits_likes() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let mut bot = awake_bot(0);
        bot.caps.daily_likes = 1;
        store.create_bot(bot).await.unwrap();
        store.add_content(content(Uuid::new_v4()));
        store.add_content(content(Uuid::new_v4()));

        let config = OrchestratorConfig {
            follow_chance: 0.0,
            ..test_config()
        };
        let report = orchestrator(store.clone(), config)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.likes, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_treasury_decline_stops_spending_but_not_likes() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        store.create_bot(awake_bot(3)).await.unwrap();
        let seller = Uuid::new_v4();
        // Daily limit is 500; the second listing cannot be funded
        store.add_ea(listing(seller, 400));
        store.add_ea(listing(seller, 400));
        store.add_content(content(Uuid::new_v4()));

        let config = OrchestratorConfig {
            follow_chance: 0.0,
            ..test_config()
        };
        let report = orchestrator(store.clone(), config)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.purchases, 1);
        assert!(report.spending_stopped);
        assert_eq!(report.likes, 1);

        // The declined attempt consumed neither cap slot nor counter
        let spend = store
            .get_daily_spend(Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(spend.amount_spent, 400);
    }

    #[tokio::test]
    async fn test_sleeping_bot_is_skipped() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let mut bot = awake_bot(0);
        // Awake only during an empty window
        bot.persona.active_from_hour = 0;
        bot.persona.active_until_hour = 0;
        store.create_bot(bot).await.unwrap();
        store.add_content(content(Uuid::new_v4()));

        let report = orchestrator(store.clone(), test_config())
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.bots_considered, 0);
        assert_eq!(report.likes, 0);
    }

    #[tokio::test]
    async fn test_disabled_engine_skips_cycle() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        store.create_bot(awake_bot(0)).await.unwrap();
        store.add_content(content(Uuid::new_v4()));
        store
            .update_bot_settings(EngineSettings {
                bots_enabled: false,
                ..EngineSettings::default()
            })
            .await
            .unwrap();

        let report = orchestrator(store.clone(), test_config())
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert!(report.skipped_disabled);
        assert_eq!(report.likes, 0);
    }

    #[tokio::test]
    async fn test_unlock_pays_author_flat_price() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        store.create_bot(awake_bot(3)).await.unwrap();
        let author = Uuid::new_v4();
        store.add_content(content(author));

        let config = OrchestratorConfig {
            like_chance: 0.0,
            follow_chance: 0.0,
            unlock_chance: 1.0,
            ..test_config()
        };
        let report = orchestrator(store.clone(), config)
            .run_cycle(Utc::now())
            .await
            .unwrap();
        assert_eq!(report.unlocks, 1);

        let wallet = store.get_or_create_user_account(author).await.unwrap();
        assert_eq!(wallet.balance, 5);

        // Unlocks are not refundable
        let refunds = store
            .get_pending_refunds(Utc::now() + Duration::days(2))
            .await
            .unwrap();
        assert!(refunds.is_empty());
    }

    #[tokio::test]
    async fn test_scan_honours_lookback_window() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let fresh = content(Uuid::new_v4());
        let mut stale = content(Uuid::new_v4());
        stale.created_at = Utc::now() - Duration::hours(2);
        store.add_content(fresh.clone());
        store.add_content(stale);

        let orch = orchestrator(store.clone(), test_config());
        let found = orch.scan_for_new_content(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, fresh.id);
    }
}
