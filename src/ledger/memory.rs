use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppResult, BotError, LedgerError, TreasuryError};

/// In-memory ledger store
///
/// Backs the test suite and local development. Every trait method takes the
/// single table lock for its whole duration, which gives the same atomicity
/// the Postgres store gets from a sql transaction.
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

struct Inner {
    accounts: HashMap<Uuid, Account>,
    treasury_id: Uuid,
    transactions: HashMap<Uuid, CoinTransaction>,
    keys: HashMap<String, Uuid>,
    journal: Vec<JournalEntry>,
    settings: EngineSettings,
    daily_spend: HashMap<NaiveDate, TreasuryDailySpend>,
    bots: HashMap<Uuid, Bot>,
    actions: HashMap<Uuid, BotAction>,
    content: Vec<ContentItem>,
    eas: Vec<EaListing>,
    refunds: HashMap<Uuid, PendingRefund>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        let treasury_id = Uuid::new_v4();
        let mut accounts = HashMap::new();
        accounts.insert(
            treasury_id,
            Account {
                id: treasury_id,
                account_type: AccountType::Treasury,
                owner_id: None,
                balance: 0,
                available_balance: 0,
                pending_balance: 0,
                version: 0,
                updated_at: Utc::now(),
            },
        );

        Self {
            inner: Mutex::new(Inner {
                accounts,
                treasury_id,
                transactions: HashMap::new(),
                keys: HashMap::new(),
                journal: Vec::new(),
                settings: EngineSettings::default(),
                daily_spend: HashMap::new(),
                bots: HashMap::new(),
                actions: HashMap::new(),
                content: Vec::new(),
                eas: Vec::new(),
                refunds: HashMap::new(),
            }),
        }
    }

    /// Convenience for tests: a store whose treasury already holds coins
    pub fn with_treasury(balance: i64) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock();
            let treasury_id = inner.treasury_id;
            let treasury = inner.accounts.get_mut(&treasury_id).unwrap();
            treasury.balance = balance;
            treasury.available_balance = balance;
        }
        store
    }

    /// Seed a content item (normally written by the forum app)
    pub fn add_content(&self, item: ContentItem) {
        self.inner.lock().content.push(item);
    }

    /// Seed a marketplace listing (normally written by the forum app)
    pub fn add_ea(&self, listing: EaListing) {
        self.inner.lock().eas.push(listing);
    }

    /// All journal entries, for invariant assertions in tests
    pub fn all_journal_entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().journal.clone()
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn user_account_mut(&mut self, user_id: Uuid) -> &mut Account {
        let existing = self
            .accounts
            .values()
            .find(|a| a.owner_id == Some(user_id))
            .map(|a| a.id);

        let id = existing.unwrap_or_else(|| {
            let id = Uuid::new_v4();
            self.accounts.insert(
                id,
                Account {
                    id,
                    account_type: AccountType::User,
                    owner_id: Some(user_id),
                    balance: 0,
                    available_balance: 0,
                    pending_balance: 0,
                    version: 0,
                    updated_at: Utc::now(),
                },
            );
            id
        });

        self.accounts.get_mut(&id).unwrap()
    }

    fn actions_today(&self, bot_id: Uuid, kind: BotActionKind, today: NaiveDate) -> i64 {
        self.actions
            .values()
            .filter(|a| a.bot_id == bot_id && a.kind == kind && a.created_at.date_naive() == today)
            .count() as i64
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_or_create_user_account(&self, user_id: Uuid) -> AppResult<Account> {
        let mut inner = self.inner.lock();
        Ok(inner.user_account_mut(user_id).clone())
    }

    async fn get_treasury_account(&self) -> AppResult<Account> {
        let inner = self.inner.lock();
        Ok(inner.accounts[&inner.treasury_id].clone())
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        Ok(self.inner.lock().accounts.get(&account_id).cloned())
    }

    async fn find_transaction_by_key(&self, key: &str) -> AppResult<Option<CoinTransaction>> {
        let inner = self.inner.lock();
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<CoinTransaction>> {
        Ok(self.inner.lock().transactions.get(&id).cloned())
    }

    async fn apply_transaction(
        &self,
        tx: NewTransaction,
        entries: Vec<NewJournalEntry>,
        updates: Vec<BalanceUpdate>,
    ) -> AppResult<CoinTransaction> {
        let mut inner = self.inner.lock();

        if inner.keys.contains_key(&tx.idempotency_key) {
            return Err(LedgerError::DuplicateKey(tx.idempotency_key).into());
        }

        // Validate every version before touching anything, so a conflict
        // leaves no partial state behind
        for update in &updates {
            let account = inner
                .accounts
                .get(&update.account_id)
                .ok_or(LedgerError::AccountNotFound(update.account_id))?;
            if account.version != update.expected_version {
                return Err(LedgerError::VersionConflict {
                    account_id: update.account_id,
                    expected: update.expected_version,
                }
                .into());
            }
        }

        let transaction_id = Uuid::new_v4();
        let now = Utc::now();

        for update in &updates {
            let account = inner.accounts.get_mut(&update.account_id).unwrap();
            account.available_balance += update.available_delta;
            account.pending_balance += update.pending_delta;
            account.balance += update.balance_delta();
            account.version += 1;
            account.updated_at = now;
        }

        for entry in entries {
            let journal_entry = JournalEntry {
                id: Uuid::new_v4(),
                transaction_id,
                account_type: entry.account_type,
                account_id: entry.account_id,
                side: entry.side,
                amount: entry.amount,
                balance_before: entry.balance_before,
                balance_after: entry.balance_after,
                description: entry.description,
                created_at: now,
            };
            inner.journal.push(journal_entry);
        }

        let transaction = CoinTransaction {
            id: transaction_id,
            user_id: tx.user_id,
            amount: tx.amount,
            trigger: tx.trigger,
            channel: tx.channel,
            description: tx.description,
            metadata: tx.metadata,
            idempotency_key: tx.idempotency_key.clone(),
            status: TransactionStatus::Completed,
            created_at: now,
        };
        inner.keys.insert(tx.idempotency_key, transaction_id);
        inner.transactions.insert(transaction_id, transaction.clone());

        Ok(transaction)
    }

    async fn record_failed_transaction(
        &self,
        tx: NewTransaction,
        error: &str,
    ) -> AppResult<CoinTransaction> {
        let mut inner = self.inner.lock();

        if inner.keys.contains_key(&tx.idempotency_key) {
            return Err(LedgerError::DuplicateKey(tx.idempotency_key).into());
        }

        let mut metadata = tx.metadata;
        if let Some(map) = metadata.as_object_mut() {
            map.insert("error".to_string(), serde_json::json!(error));
        }

        let transaction = CoinTransaction {
            id: Uuid::new_v4(),
            user_id: tx.user_id,
            amount: tx.amount,
            trigger: tx.trigger,
            channel: tx.channel,
            description: tx.description,
            metadata,
            idempotency_key: tx.idempotency_key.clone(),
            status: TransactionStatus::Failed,
            created_at: Utc::now(),
        };
        inner.keys.insert(tx.idempotency_key, transaction.id);
        inner.transactions.insert(transaction.id, transaction.clone());

        Ok(transaction)
    }

    async fn get_journal_entries(&self, transaction_id: Uuid) -> AppResult<Vec<JournalEntry>> {
        Ok(self
            .inner
            .lock()
            .journal
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn get_bot_settings(&self) -> AppResult<EngineSettings> {
        Ok(self.inner.lock().settings.clone())
    }

    async fn update_bot_settings(&self, settings: EngineSettings) -> AppResult<()> {
        self.inner.lock().settings = settings;
        Ok(())
    }

    async fn get_daily_spend(&self, date: NaiveDate) -> AppResult<TreasuryDailySpend> {
        let inner = self.inner.lock();
        Ok(inner
            .daily_spend
            .get(&date)
            .cloned()
            .unwrap_or(TreasuryDailySpend {
                date,
                amount_spent: 0,
                action_count: 0,
            }))
    }

    async fn try_reserve_daily_spend(
        &self,
        date: NaiveDate,
        amount: i64,
        limit: i64,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.daily_spend.entry(date).or_insert(TreasuryDailySpend {
            date,
            amount_spent: 0,
            action_count: 0,
        });

        if entry.amount_spent + amount > limit {
            return Err(TreasuryError::DailyLimitExceeded {
                spent: entry.amount_spent,
                attempted: amount,
                limit,
            }
            .into());
        }

        entry.amount_spent += amount;
        entry.action_count += 1;
        Ok(())
    }

    async fn release_daily_spend(&self, date: NaiveDate, amount: i64) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.daily_spend.get_mut(&date) {
            entry.amount_spent = (entry.amount_spent - amount).max(0);
            entry.action_count = (entry.action_count - 1).max(0);
        }
        Ok(())
    }

    async fn refill_treasury(&self, amount: i64) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let treasury_id = inner.treasury_id;
        let treasury = inner.accounts.get_mut(&treasury_id).unwrap();
        treasury.balance += amount;
        treasury.available_balance += amount;
        treasury.version += 1;
        treasury.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_daily_spend(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let today = Utc::now().date_naive();
        inner.daily_spend.remove(&today);
        for bot in inner.bots.values_mut() {
            bot.spent_today = 0;
        }
        Ok(())
    }

    async fn create_bot(&self, bot: Bot) -> AppResult<Bot> {
        let mut inner = self.inner.lock();
        inner.bots.insert(bot.id, bot.clone());
        Ok(bot)
    }

    async fn get_bot(&self, bot_id: Uuid) -> AppResult<Option<Bot>> {
        Ok(self.inner.lock().bots.get(&bot_id).cloned())
    }

    async fn list_bots(&self) -> AppResult<Vec<Bot>> {
        let mut bots: Vec<Bot> = self.inner.lock().bots.values().cloned().collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn list_active_bots(&self) -> AppResult<Vec<Bot>> {
        let mut bots: Vec<Bot> = self
            .inner
            .lock()
            .bots
            .values()
            .filter(|b| b.active)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn update_bot(&self, bot: Bot) -> AppResult<Bot> {
        let mut inner = self.inner.lock();
        if !inner.bots.contains_key(&bot.id) {
            return Err(BotError::NotFound(bot.id).into());
        }
        inner.bots.insert(bot.id, bot.clone());
        Ok(bot)
    }

    async fn set_bot_active(&self, bot_id: Uuid, active: bool) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let bot = inner
            .bots
            .get_mut(&bot_id)
            .ok_or(BotError::NotFound(bot_id))?;
        bot.active = active;
        Ok(())
    }

    async fn delete_bot(&self, bot_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.bots.remove(&bot_id).is_none() {
            return Err(BotError::NotFound(bot_id).into());
        }
        inner.actions.retain(|_, a| a.bot_id != bot_id);
        inner.refunds.retain(|_, r| r.bot_id != bot_id);
        Ok(())
    }

    async fn record_bot_action(&self, action: NewBotAction) -> AppResult<BotAction> {
        let mut inner = self.inner.lock();
        let today = Utc::now().date_naive();

        if !inner.bots.contains_key(&action.bot_id) {
            return Err(BotError::NotFound(action.bot_id).into());
        }

        // Count + insert under the same lock: two concurrent scans cannot
        // both see the last free slot
        let taken = inner.actions_today(action.bot_id, action.kind, today);
        if taken >= action.cap as i64 {
            return Err(BotError::CapExhausted {
                kind: action.kind.as_str().to_string(),
                cap: action.cap,
            }
            .into());
        }

        let record = BotAction {
            id: Uuid::new_v4(),
            bot_id: action.bot_id,
            kind: action.kind,
            target_id: action.target_id,
            amount: action.amount,
            refundable: action.refundable,
            refunded: false,
            created_at: Utc::now(),
        };
        inner.actions.insert(record.id, record.clone());

        if action.kind.is_monetary() {
            if let Some(bot) = inner.bots.get_mut(&action.bot_id) {
                bot.spent_today += action.amount;
            }
        }

        Ok(record)
    }

    async fn remove_bot_action(&self, action_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if let Some(action) = inner.actions.remove(&action_id) {
            if action.kind.is_monetary() {
                if let Some(bot) = inner.bots.get_mut(&action.bot_id) {
                    bot.spent_today = (bot.spent_today - action.amount).max(0);
                }
            }
        }
        Ok(())
    }

    async fn mark_action_refunded(&self, action_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let action = inner
            .actions
            .get_mut(&action_id)
            .ok_or(BotError::ActionNotFound(action_id))?;
        action.refunded = true;
        Ok(())
    }

    async fn get_bot_action(&self, action_id: Uuid) -> AppResult<Option<BotAction>> {
        Ok(self.inner.lock().actions.get(&action_id).cloned())
    }

    async fn count_actions_today(&self, bot_id: Uuid, kind: BotActionKind) -> AppResult<i64> {
        let inner = self.inner.lock();
        Ok(inner.actions_today(bot_id, kind, Utc::now().date_naive()))
    }

    async fn has_bot_acted(&self, bot_id: Uuid, target_id: Uuid) -> AppResult<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .actions
            .values()
            .any(|a| a.bot_id == bot_id && a.target_id == target_id))
    }

    async fn bot_stats(&self) -> AppResult<Vec<BotStats>> {
        let inner = self.inner.lock();
        let today = Utc::now().date_naive();
        let mut stats: Vec<BotStats> = inner
            .bots
            .values()
            .map(|bot| BotStats {
                bot_id: bot.id,
                display_name: bot.display_name.clone(),
                active: bot.active,
                likes_today: inner.actions_today(bot.id, BotActionKind::Like, today),
                follows_today: inner.actions_today(bot.id, BotActionKind::Follow, today),
                purchases_today: inner.actions_today(bot.id, BotActionKind::Purchase, today),
                unlocks_today: inner.actions_today(bot.id, BotActionKind::Unlock, today),
                spent_today: bot.spent_today,
            })
            .collect();
        stats.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(stats)
    }

    async fn recent_content(&self, since: DateTime<Utc>) -> AppResult<Vec<ContentItem>> {
        Ok(self
            .inner
            .lock()
            .content
            .iter()
            .filter(|c| c.created_at >= since)
            .cloned()
            .collect())
    }

    async fn recent_eas(&self, since: DateTime<Utc>) -> AppResult<Vec<EaListing>> {
        Ok(self
            .inner
            .lock()
            .eas
            .iter()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect())
    }

    async fn create_pending_refund(&self, refund: NewPendingRefund) -> AppResult<PendingRefund> {
        let mut inner = self.inner.lock();
        let record = PendingRefund {
            id: Uuid::new_v4(),
            action_id: refund.action_id,
            bot_id: refund.bot_id,
            seller_id: refund.seller_id,
            refund_amount: refund.refund_amount,
            original_treasury_amount: refund.original_treasury_amount,
            due_at: refund.due_at,
            processed: false,
            processing_error: None,
            created_at: Utc::now(),
        };
        inner.refunds.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_pending_refunds(&self, before: DateTime<Utc>) -> AppResult<Vec<PendingRefund>> {
        let inner = self.inner.lock();
        let mut due: Vec<PendingRefund> = inner
            .refunds
            .values()
            .filter(|r| !r.processed && r.due_at <= before)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.due_at);
        Ok(due)
    }

    async fn mark_refund_processed(
        &self,
        refund_id: Uuid,
        error: Option<String>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let refund = inner
            .refunds
            .get_mut(&refund_id)
            .ok_or(BotError::RefundNotFound(refund_id))?;
        match error {
            None => {
                refund.processed = true;
                refund.processing_error = None;
            }
            Some(message) => {
                refund.processed = false;
                refund.processing_error = Some(message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn user_update(account: &Account, delta: i64) -> BalanceUpdate {
        BalanceUpdate {
            account_id: account.id,
            available_delta: delta,
            pending_delta: 0,
            expected_version: account.version,
        }
    }

    #[tokio::test]
    async fn test_apply_transaction_rejects_stale_version() {
        let store = MemoryLedgerStore::with_treasury(100);
        let user_id = Uuid::new_v4();
        let account = store.get_or_create_user_account(user_id).await.unwrap();

        let tx = NewTransaction {
            user_id,
            amount: 10,
            trigger: TransactionTrigger::AdminAdjustment,
            channel: TransactionChannel::System,
            description: "test".into(),
            metadata: serde_json::json!({}),
            idempotency_key: "k1".into(),
        };

        let stale = BalanceUpdate {
            expected_version: account.version + 1,
            ..user_update(&account, 10)
        };
        let err = store
            .apply_transaction(tx.clone(), vec![], vec![stale])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::VersionConflict { .. })
        ));

        // Nothing applied
        let account = store.get_or_create_user_account(user_id).await.unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.version, 0);
    }

    #[tokio::test]
    async fn test_apply_transaction_enforces_unique_keys() {
        let store = MemoryLedgerStore::new();
        let user_id = Uuid::new_v4();
        let account = store.get_or_create_user_account(user_id).await.unwrap();

        let tx = NewTransaction {
            user_id,
            amount: 5,
            trigger: TransactionTrigger::AdminAdjustment,
            channel: TransactionChannel::System,
            description: "test".into(),
            metadata: serde_json::json!({}),
            idempotency_key: "dup".into(),
        };

        store
            .apply_transaction(tx.clone(), vec![], vec![user_update(&account, 5)])
            .await
            .unwrap();

        let err = store
            .apply_transaction(tx, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::DuplicateKey(_))
        ));
    }

    #[tokio::test]
    async fn test_record_bot_action_enforces_cap() {
        let store = MemoryLedgerStore::new();
        let bot = Bot {
            id: Uuid::new_v4(),
            display_name: "b".into(),
            purpose: "engagement".into(),
            trust_level: 1,
            persona: BotPersona::default(),
            caps: BotCaps::default(),
            active: true,
            spent_today: 0,
            created_at: Utc::now(),
        };
        store.create_bot(bot.clone()).await.unwrap();

        for _ in 0..2 {
            store
                .record_bot_action(NewBotAction {
                    bot_id: bot.id,
                    kind: BotActionKind::Purchase,
                    target_id: Uuid::new_v4(),
                    amount: 5,
                    refundable: true,
                    cap: 2,
                })
                .await
                .unwrap();
        }

        let err = store
            .record_bot_action(NewBotAction {
                bot_id: bot.id,
                kind: BotActionKind::Purchase,
                target_id: Uuid::new_v4(),
                amount: 5,
                refundable: true,
                cap: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Bot(BotError::CapExhausted { .. })
        ));

        // Other action kinds keep their own counter
        store
            .record_bot_action(NewBotAction {
                bot_id: bot.id,
                kind: BotActionKind::Like,
                target_id: Uuid::new_v4(),
                amount: 0,
                refundable: false,
                cap: 2,
            })
            .await
            .unwrap();

        let bot = store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(bot.spent_today, 10);
    }

    #[tokio::test]
    async fn test_concurrent_actions_never_exceed_cap() {
        let store = std::sync::Arc::new(MemoryLedgerStore::new());
        let bot = Bot {
            id: Uuid::new_v4(),
            display_name: "b".into(),
            purpose: "engagement".into(),
            trust_level: 1,
            persona: BotPersona::default(),
            caps: BotCaps::default(),
            active: true,
            spent_today: 0,
            created_at: Utc::now(),
        };
        store.create_bot(bot.clone()).await.unwrap();

        // Eight racing reservations against a cap of three: the count and
        // insert happen in one critical section, so exactly three win
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let bot_id = bot.id;
            handles.push(tokio::spawn(async move {
                store
                    .record_bot_action(NewBotAction {
                        bot_id,
                        kind: BotActionKind::Purchase,
                        target_id: Uuid::new_v4(),
                        amount: 5,
                        refundable: true,
                        cap: 3,
                    })
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(err) => assert!(matches!(
                    err,
                    AppError::Bot(BotError::CapExhausted { .. })
                )),
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(
            store
                .count_actions_today(bot.id, BotActionKind::Purchase)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_daily_spend_reservation_limit() {
        let store = MemoryLedgerStore::new();
        let today = Utc::now().date_naive();

        store.try_reserve_daily_spend(today, 60, 100).await.unwrap();
        let err = store
            .try_reserve_daily_spend(today, 50, 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Treasury(TreasuryError::DailyLimitExceeded { .. })
        ));

        store.release_daily_spend(today, 60).await.unwrap();
        store.try_reserve_daily_spend(today, 50, 100).await.unwrap();

        let spend = store.get_daily_spend(today).await.unwrap();
        assert_eq!(spend.amount_spent, 50);
    }

    #[tokio::test]
    async fn test_delete_bot_cascades_actions() {
        let store = MemoryLedgerStore::new();
        let bot = Bot {
            id: Uuid::new_v4(),
            display_name: "b".into(),
            purpose: "engagement".into(),
            trust_level: 1,
            persona: BotPersona::default(),
            caps: BotCaps::default(),
            active: true,
            spent_today: 0,
            created_at: Utc::now(),
        };
        store.create_bot(bot.clone()).await.unwrap();
        let action = store
            .record_bot_action(NewBotAction {
                bot_id: bot.id,
                kind: BotActionKind::Like,
                target_id: Uuid::new_v4(),
                amount: 0,
                refundable: false,
                cap: 10,
            })
            .await
            .unwrap();

        store.delete_bot(bot.id).await.unwrap();
        assert!(store.get_bot(bot.id).await.unwrap().is_none());
        assert!(store.get_bot_action(action.id).await.unwrap().is_none());
    }
}
