use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Input for a transaction row not yet persisted
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub trigger: TransactionTrigger,
    pub channel: TransactionChannel,
    pub description: String,
    pub metadata: serde_json::Value,
    pub idempotency_key: String,
}

/// Input for one journal leg
#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub account_type: AccountType,
    pub account_id: Option<Uuid>,
    pub side: EntrySide,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub description: String,
}

impl NewJournalEntry {
    pub fn signed_amount(&self) -> i64 {
        match self.side {
            EntrySide::Credit => self.amount,
            EntrySide::Debit => -self.amount,
        }
    }
}

/// Version-checked balance mutation for one account
///
/// The store must reject the whole unit of work with
/// `LedgerError::VersionConflict` if the account's current version differs
/// from `expected_version` at write time.
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub account_id: Uuid,
    pub available_delta: i64,
    pub pending_delta: i64,
    pub expected_version: i64,
}

impl BalanceUpdate {
    pub fn balance_delta(&self) -> i64 {
        self.available_delta + self.pending_delta
    }
}

/// Input for a bot action; `cap` is the bot's per-day limit for this kind
/// and must be enforced atomically with the insert.
#[derive(Debug, Clone)]
pub struct NewBotAction {
    pub bot_id: Uuid,
    pub kind: BotActionKind,
    pub target_id: Uuid,
    pub amount: i64,
    pub refundable: bool,
    pub cap: i32,
}

/// Input for a scheduled refund
#[derive(Debug, Clone)]
pub struct NewPendingRefund {
    pub action_id: Uuid,
    pub bot_id: Uuid,
    pub seller_id: Uuid,
    pub refund_amount: i64,
    pub original_treasury_amount: i64,
    pub due_at: DateTime<Utc>,
}

/// Storage interface the core consumes
///
/// Every balance mutation goes through `apply_transaction`, which is
/// all-or-nothing: the transaction row, its journal entries and the
/// version-checked balance updates commit together or not at all.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- accounts ----

    /// Fetch the wallet for a user, creating an empty one if absent
    async fn get_or_create_user_account(&self, user_id: Uuid) -> AppResult<Account>;

    /// The treasury singleton
    async fn get_treasury_account(&self) -> AppResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>>;

    // ---- transactions ----

    async fn find_transaction_by_key(&self, key: &str) -> AppResult<Option<CoinTransaction>>;

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<CoinTransaction>>;

    /// Atomic unit of work: insert the transaction as `completed`, post its
    /// journal entries, apply the balance updates. Fails with
    /// `LedgerError::DuplicateKey` if the idempotency key is taken and with
    /// `LedgerError::VersionConflict` on a stale version.
    async fn apply_transaction(
        &self,
        tx: NewTransaction,
        entries: Vec<NewJournalEntry>,
        updates: Vec<BalanceUpdate>,
    ) -> AppResult<CoinTransaction>;

    /// Persist a `failed` transaction row for audit; no journal, no
    /// balances. Callers pass a derived audit key here, never the live
    /// idempotency key of the unit of work, so a failure leaves that key
    /// free for a later retry.
    async fn record_failed_transaction(
        &self,
        tx: NewTransaction,
        error: &str,
    ) -> AppResult<CoinTransaction>;

    async fn get_journal_entries(&self, transaction_id: Uuid) -> AppResult<Vec<JournalEntry>>;

    // ---- engine settings ----

    async fn get_bot_settings(&self) -> AppResult<EngineSettings>;

    async fn update_bot_settings(&self, settings: EngineSettings) -> AppResult<()>;

    // ---- treasury daily spend ----

    async fn get_daily_spend(&self, date: NaiveDate) -> AppResult<TreasuryDailySpend>;

    /// Atomically add `amount` to the day's counter unless that would push
    /// it past `limit`; fails with `TreasuryError::DailyLimitExceeded`.
    async fn try_reserve_daily_spend(
        &self,
        date: NaiveDate,
        amount: i64,
        limit: i64,
    ) -> AppResult<()>;

    /// Give back a reservation whose downstream spend failed
    async fn release_daily_spend(&self, date: NaiveDate, amount: i64) -> AppResult<()>;

    /// Direct treasury credit used by refund reconciliation for the portion
    /// not covered by the seller claw-back transaction
    async fn refill_treasury(&self, amount: i64) -> AppResult<()>;

    /// Zero today's treasury counter and every bot's `spent_today`
    async fn reset_daily_spend(&self) -> AppResult<()>;

    // ---- bots ----

    async fn create_bot(&self, bot: Bot) -> AppResult<Bot>;

    async fn get_bot(&self, bot_id: Uuid) -> AppResult<Option<Bot>>;

    async fn list_bots(&self) -> AppResult<Vec<Bot>>;

    async fn list_active_bots(&self) -> AppResult<Vec<Bot>>;

    async fn update_bot(&self, bot: Bot) -> AppResult<Bot>;

    async fn set_bot_active(&self, bot_id: Uuid, active: bool) -> AppResult<()>;

    /// Deletes the bot and cascades its action history
    async fn delete_bot(&self, bot_id: Uuid) -> AppResult<()>;

    // ---- bot actions ----

    /// Atomic cap check + insert: counts the bot's actions of this kind for
    /// the current calendar day and inserts only while count < cap, in one
    /// critical section. Fails with `BotError::CapExhausted`. Monetary
    /// actions also bump the bot's `spent_today`.
    async fn record_bot_action(&self, action: NewBotAction) -> AppResult<BotAction>;

    /// Compensation for a monetary action whose funding failed
    async fn remove_bot_action(&self, action_id: Uuid) -> AppResult<()>;

    /// Permanent; a refunded action is never refunded again
    async fn mark_action_refunded(&self, action_id: Uuid) -> AppResult<()>;

    async fn get_bot_action(&self, action_id: Uuid) -> AppResult<Option<BotAction>>;

    async fn count_actions_today(&self, bot_id: Uuid, kind: BotActionKind) -> AppResult<i64>;

    async fn has_bot_acted(&self, bot_id: Uuid, target_id: Uuid) -> AppResult<bool>;

    async fn bot_stats(&self) -> AppResult<Vec<BotStats>>;

    // ---- content feeds (written by the forum app, read-only here) ----

    async fn recent_content(&self, since: DateTime<Utc>) -> AppResult<Vec<ContentItem>>;

    async fn recent_eas(&self, since: DateTime<Utc>) -> AppResult<Vec<EaListing>>;

    // ---- pending refunds ----

    async fn create_pending_refund(&self, refund: NewPendingRefund) -> AppResult<PendingRefund>;

    /// Unprocessed refunds whose due time is at or before `before`
    async fn get_pending_refunds(&self, before: DateTime<Utc>) -> AppResult<Vec<PendingRefund>>;

    /// `error = None` marks the refund processed; `Some` records the error
    /// and leaves it unprocessed so the next sweep retries it
    async fn mark_refund_processed(
        &self,
        refund_id: Uuid,
        error: Option<String>,
    ) -> AppResult<()>;
}
