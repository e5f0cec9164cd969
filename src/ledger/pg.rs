use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult, BotError, LedgerError, TreasuryError};

/// Postgres-backed ledger store - the source of truth in production
///
/// Every unit of work that touches more than one row runs inside a single
/// sql transaction; balance writes carry a `WHERE version = $n` guard so a
/// stale read can never clobber a concurrent mutation.
pub struct PgLedgerStore {
    pub pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn account_from_row(row: &PgRow) -> AppResult<Account> {
        Ok(Account {
            id: row.try_get("id")?,
            account_type: row.try_get("account_type")?,
            owner_id: row.try_get("owner_id")?,
            balance: row.try_get("balance")?,
            available_balance: row.try_get("available_balance")?,
            pending_balance: row.try_get("pending_balance")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn transaction_from_row(row: &PgRow) -> AppResult<CoinTransaction> {
        Ok(CoinTransaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            trigger: row.try_get("trigger")?,
            channel: row.try_get("channel")?,
            description: row.try_get("description")?,
            metadata: row.try_get("metadata")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn bot_from_row(row: &PgRow) -> AppResult<Bot> {
        let persona: serde_json::Value = row.try_get("persona")?;
        let caps: serde_json::Value = row.try_get("caps")?;
        Ok(Bot {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            purpose: row.try_get("purpose")?,
            trust_level: row.try_get("trust_level")?,
            persona: serde_json::from_value(persona)?,
            caps: serde_json::from_value(caps)?,
            active: row.try_get("active")?,
            spent_today: row.try_get("spent_today")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn action_from_row(row: &PgRow) -> AppResult<BotAction> {
        Ok(BotAction {
            id: row.try_get("id")?,
            bot_id: row.try_get("bot_id")?,
            kind: row.try_get("kind")?,
            target_id: row.try_get("target_id")?,
            amount: row.try_get("amount")?,
            refundable: row.try_get("refundable")?,
            refunded: row.try_get("refunded")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn refund_from_row(row: &PgRow) -> AppResult<PendingRefund> {
        Ok(PendingRefund {
            id: row.try_get("id")?,
            action_id: row.try_get("action_id")?,
            bot_id: row.try_get("bot_id")?,
            seller_id: row.try_get("seller_id")?,
            refund_amount: row.try_get("refund_amount")?,
            original_treasury_amount: row.try_get("original_treasury_amount")?,
            due_at: row.try_get("due_at")?,
            processed: row.try_get("processed")?,
            processing_error: row.try_get("processing_error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn is_unique_violation(error: &sqlx::Error) -> bool {
        error
            .as_database_error()
            .map(|d| d.is_unique_violation())
            .unwrap_or(false)
    }

    async fn insert_transaction_row(
        executor: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tx: &NewTransaction,
        status: TransactionStatus,
        metadata: &serde_json::Value,
    ) -> AppResult<CoinTransaction> {
        let row = sqlx::query(
            r#"
            INSERT INTO coin_transactions
                (id, user_id, amount, trigger, channel, description, metadata, idempotency_key, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, user_id, amount, trigger, channel, description, metadata,
                      idempotency_key, status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tx.user_id)
        .bind(tx.amount)
        .bind(tx.trigger)
        .bind(tx.channel)
        .bind(&tx.description)
        .bind(metadata)
        .bind(&tx.idempotency_key)
        .bind(status)
        .fetch_one(&mut **executor)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                AppError::Ledger(LedgerError::DuplicateKey(tx.idempotency_key.clone()))
            } else {
                e.into()
            }
        })?;

        Self::transaction_from_row(&row)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_or_create_user_account(&self, user_id: Uuid) -> AppResult<Account> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, account_type, owner_id)
            VALUES ($1, 'user', $2)
            ON CONFLICT (owner_id) DO UPDATE SET owner_id = EXCLUDED.owner_id
            RETURNING id, account_type, owner_id, balance, available_balance,
                      pending_balance, version, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Self::account_from_row(&row)
    }

    async fn get_treasury_account(&self) -> AppResult<Account> {
        let row = sqlx::query(
            r#"
            SELECT id, account_type, owner_id, balance, available_balance,
                   pending_balance, version, updated_at
            FROM accounts
            WHERE account_type = 'treasury'
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Treasury account not provisioned".into()))?;

        Self::account_from_row(&row)
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_type, owner_id, balance, available_balance,
                   pending_balance, version, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::account_from_row(&r)).transpose()
    }

    async fn find_transaction_by_key(&self, key: &str) -> AppResult<Option<CoinTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, amount, trigger, channel, description, metadata,
                   idempotency_key, status, created_at
            FROM coin_transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::transaction_from_row(&r)).transpose()
    }

    async fn get_transaction(&self, id: Uuid) -> AppResult<Option<CoinTransaction>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, amount, trigger, channel, description, metadata,
                   idempotency_key, status, created_at
            FROM coin_transactions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::transaction_from_row(&r)).transpose()
    }

    async fn apply_transaction(
        &self,
        tx: NewTransaction,
        entries: Vec<NewJournalEntry>,
        updates: Vec<BalanceUpdate>,
    ) -> AppResult<CoinTransaction> {
        let mut db_tx = self.pool.begin().await?;

        let metadata = tx.metadata.clone();
        let transaction =
            Self::insert_transaction_row(&mut db_tx, &tx, TransactionStatus::Completed, &metadata)
                .await?;

        for entry in &entries {
            sqlx::query(
                r#"
                INSERT INTO journal_entries
                    (id, transaction_id, account_type, account_id, side, amount,
                     balance_before, balance_after, description)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(transaction.id)
            .bind(entry.account_type)
            .bind(entry.account_id)
            .bind(entry.side)
            .bind(entry.amount)
            .bind(entry.balance_before)
            .bind(entry.balance_after)
            .bind(&entry.description)
            .execute(&mut *db_tx)
            .await?;
        }

        for update in &updates {
            let result = sqlx::query(
                r#"
                UPDATE accounts
                SET available_balance = available_balance + $2,
                    pending_balance = pending_balance + $3,
                    balance = balance + $4,
                    version = version + 1,
                    updated_at = NOW()
                WHERE id = $1 AND version = $5
                "#,
            )
            .bind(update.account_id)
            .bind(update.available_delta)
            .bind(update.pending_delta)
            .bind(update.balance_delta())
            .bind(update.expected_version)
            .execute(&mut *db_tx)
            .await?;

            if result.rows_affected() == 0 {
                // Rolls back the transaction row and any entries written so far
                db_tx.rollback().await?;
                return Err(LedgerError::VersionConflict {
                    account_id: update.account_id,
                    expected: update.expected_version,
                }
                .into());
            }
        }

        db_tx.commit().await?;
        Ok(transaction)
    }

    async fn record_failed_transaction(
        &self,
        tx: NewTransaction,
        error: &str,
    ) -> AppResult<CoinTransaction> {
        let mut metadata = tx.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("error".to_string(), serde_json::json!(error));
        }

        let mut db_tx = self.pool.begin().await?;
        let transaction =
            Self::insert_transaction_row(&mut db_tx, &tx, TransactionStatus::Failed, &metadata)
                .await?;
        db_tx.commit().await?;
        Ok(transaction)
    }

    async fn get_journal_entries(&self, transaction_id: Uuid) -> AppResult<Vec<JournalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, account_type, account_id, side, amount,
                   balance_before, balance_after, description, created_at
            FROM journal_entries
            WHERE transaction_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JournalEntry {
                    id: row.try_get("id")?,
                    transaction_id: row.try_get("transaction_id")?,
                    account_type: row.try_get("account_type")?,
                    account_id: row.try_get("account_id")?,
                    side: row.try_get("side")?,
                    amount: row.try_get("amount")?,
                    balance_before: row.try_get("balance_before")?,
                    balance_after: row.try_get("balance_after")?,
                    description: row.try_get("description")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_bot_settings(&self) -> AppResult<EngineSettings> {
        let row = sqlx::query(
            r#"
            SELECT bots_enabled, treasury_daily_limit, refund_delay_hours
            FROM engine_settings
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(EngineSettings {
                bots_enabled: row.try_get("bots_enabled")?,
                treasury_daily_limit: row.try_get("treasury_daily_limit")?,
                refund_delay_hours: row.try_get("refund_delay_hours")?,
            }),
            None => Ok(EngineSettings::default()),
        }
    }

    async fn update_bot_settings(&self, settings: EngineSettings) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_settings (singleton, bots_enabled, treasury_daily_limit, refund_delay_hours)
            VALUES (TRUE, $1, $2, $3)
            ON CONFLICT (singleton) DO UPDATE SET
                bots_enabled = EXCLUDED.bots_enabled,
                treasury_daily_limit = EXCLUDED.treasury_daily_limit,
                refund_delay_hours = EXCLUDED.refund_delay_hours
            "#,
        )
        .bind(settings.bots_enabled)
        .bind(settings.treasury_daily_limit)
        .bind(settings.refund_delay_hours)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_daily_spend(&self, date: NaiveDate) -> AppResult<TreasuryDailySpend> {
        let row = sqlx::query(
            r#"
            SELECT date, amount_spent, action_count
            FROM treasury_daily_spend
            WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TreasuryDailySpend {
                date: row.try_get("date")?,
                amount_spent: row.try_get("amount_spent")?,
                action_count: row.try_get("action_count")?,
            }),
            None => Ok(TreasuryDailySpend {
                date,
                amount_spent: 0,
                action_count: 0,
            }),
        }
    }

    async fn try_reserve_daily_spend(
        &self,
        date: NaiveDate,
        amount: i64,
        limit: i64,
    ) -> AppResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO treasury_daily_spend (date, amount_spent, action_count)
            VALUES ($1, 0, 0)
            ON CONFLICT (date) DO NOTHING
            "#,
        )
        .bind(date)
        .execute(&mut *db_tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE treasury_daily_spend
            SET amount_spent = amount_spent + $2,
                action_count = action_count + 1
            WHERE date = $1 AND amount_spent + $2 <= $3
            "#,
        )
        .bind(date)
        .bind(amount)
        .bind(limit)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            let spent = sqlx::query_scalar::<_, i64>(
                "SELECT amount_spent FROM treasury_daily_spend WHERE date = $1",
            )
            .bind(date)
            .fetch_one(&mut *db_tx)
            .await?;
            db_tx.rollback().await?;
            return Err(TreasuryError::DailyLimitExceeded {
                spent,
                attempted: amount,
                limit,
            }
            .into());
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn release_daily_spend(&self, date: NaiveDate, amount: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE treasury_daily_spend
            SET amount_spent = GREATEST(amount_spent - $2, 0),
                action_count = GREATEST(action_count - 1, 0)
            WHERE date = $1
            "#,
        )
        .bind(date)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn refill_treasury(&self, amount: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $1,
                available_balance = available_balance + $1,
                version = version + 1,
                updated_at = NOW()
            WHERE account_type = 'treasury'
            "#,
        )
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_daily_spend(&self) -> AppResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM treasury_daily_spend WHERE date = CURRENT_DATE")
            .execute(&mut *db_tx)
            .await?;
        sqlx::query("UPDATE bots SET spent_today = 0")
            .execute(&mut *db_tx)
            .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn create_bot(&self, bot: Bot) -> AppResult<Bot> {
        sqlx::query(
            r#"
            INSERT INTO bots
                (id, display_name, purpose, trust_level, persona, caps, active, spent_today, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(bot.id)
        .bind(&bot.display_name)
        .bind(&bot.purpose)
        .bind(bot.trust_level)
        .bind(serde_json::to_value(&bot.persona)?)
        .bind(serde_json::to_value(&bot.caps)?)
        .bind(bot.active)
        .bind(bot.spent_today)
        .bind(bot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(bot)
    }

    async fn get_bot(&self, bot_id: Uuid) -> AppResult<Option<Bot>> {
        let row = sqlx::query("SELECT * FROM bots WHERE id = $1")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::bot_from_row(&r)).transpose()
    }

    async fn list_bots(&self) -> AppResult<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::bot_from_row).collect()
    }

    async fn list_active_bots(&self) -> AppResult<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots WHERE active = TRUE ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::bot_from_row).collect()
    }

    async fn update_bot(&self, bot: Bot) -> AppResult<Bot> {
        let result = sqlx::query(
            r#"
            UPDATE bots
            SET display_name = $2, purpose = $3, trust_level = $4,
                persona = $5, caps = $6, active = $7
            WHERE id = $1
            "#,
        )
        .bind(bot.id)
        .bind(&bot.display_name)
        .bind(&bot.purpose)
        .bind(bot.trust_level)
        .bind(serde_json::to_value(&bot.persona)?)
        .bind(serde_json::to_value(&bot.caps)?)
        .bind(bot.active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::NotFound(bot.id).into());
        }
        Ok(bot)
    }

    async fn set_bot_active(&self, bot_id: Uuid, active: bool) -> AppResult<()> {
        let result = sqlx::query("UPDATE bots SET active = $2 WHERE id = $1")
            .bind(bot_id)
            .bind(active)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::NotFound(bot_id).into());
        }
        Ok(())
    }

    async fn delete_bot(&self, bot_id: Uuid) -> AppResult<()> {
        // bot_actions and pending_refunds cascade via foreign keys
        let result = sqlx::query("DELETE FROM bots WHERE id = $1")
            .bind(bot_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::NotFound(bot_id).into());
        }
        Ok(())
    }

    async fn record_bot_action(&self, action: NewBotAction) -> AppResult<BotAction> {
        let mut db_tx = self.pool.begin().await?;

        // Lock the bot row so concurrent scans serialize on the cap check
        let locked = sqlx::query("SELECT id FROM bots WHERE id = $1 FOR UPDATE")
            .bind(action.bot_id)
            .fetch_optional(&mut *db_tx)
            .await?;
        if locked.is_none() {
            db_tx.rollback().await?;
            return Err(BotError::NotFound(action.bot_id).into());
        }

        let taken = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM bot_actions
            WHERE bot_id = $1 AND kind = $2 AND created_at::date = CURRENT_DATE
            "#,
        )
        .bind(action.bot_id)
        .bind(action.kind)
        .fetch_one(&mut *db_tx)
        .await?;

        if taken >= action.cap as i64 {
            db_tx.rollback().await?;
            return Err(BotError::CapExhausted {
                kind: action.kind.as_str().to_string(),
                cap: action.cap,
            }
            .into());
        }

        let row = sqlx::query(
            r#"
            INSERT INTO bot_actions (id, bot_id, kind, target_id, amount, refundable, refunded)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            RETURNING id, bot_id, kind, target_id, amount, refundable, refunded, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action.bot_id)
        .bind(action.kind)
        .bind(action.target_id)
        .bind(action.amount)
        .bind(action.refundable)
        .fetch_one(&mut *db_tx)
        .await?;

        if action.kind.is_monetary() {
            sqlx::query("UPDATE bots SET spent_today = spent_today + $2 WHERE id = $1")
                .bind(action.bot_id)
                .bind(action.amount)
                .execute(&mut *db_tx)
                .await?;
        }

        db_tx.commit().await?;
        Self::action_from_row(&row)
    }

    async fn remove_bot_action(&self, action_id: Uuid) -> AppResult<()> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            DELETE FROM bot_actions WHERE id = $1
            RETURNING bot_id, kind, amount
            "#,
        )
        .bind(action_id)
        .fetch_optional(&mut *db_tx)
        .await?;

        if let Some(row) = row {
            let kind: BotActionKind = row.try_get("kind")?;
            if kind.is_monetary() {
                let bot_id: Uuid = row.try_get("bot_id")?;
                let amount: i64 = row.try_get("amount")?;
                sqlx::query(
                    "UPDATE bots SET spent_today = GREATEST(spent_today - $2, 0) WHERE id = $1",
                )
                .bind(bot_id)
                .bind(amount)
                .execute(&mut *db_tx)
                .await?;
            }
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn mark_action_refunded(&self, action_id: Uuid) -> AppResult<()> {
        let result = sqlx::query("UPDATE bot_actions SET refunded = TRUE WHERE id = $1")
            .bind(action_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::ActionNotFound(action_id).into());
        }
        Ok(())
    }

    async fn get_bot_action(&self, action_id: Uuid) -> AppResult<Option<BotAction>> {
        let row = sqlx::query("SELECT * FROM bot_actions WHERE id = $1")
            .bind(action_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::action_from_row(&r)).transpose()
    }

    async fn count_actions_today(&self, bot_id: Uuid, kind: BotActionKind) -> AppResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM bot_actions
            WHERE bot_id = $1 AND kind = $2 AND created_at::date = CURRENT_DATE
            "#,
        )
        .bind(bot_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn has_bot_acted(&self, bot_id: Uuid, target_id: Uuid) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM bot_actions WHERE bot_id = $1 AND target_id = $2)",
        )
        .bind(bot_id)
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn bot_stats(&self) -> AppResult<Vec<BotStats>> {
        let rows = sqlx::query(
            r#"
            SELECT b.id, b.display_name, b.active, b.spent_today,
                COUNT(*) FILTER (WHERE a.kind = 'like' AND a.created_at::date = CURRENT_DATE) AS likes_today,
                COUNT(*) FILTER (WHERE a.kind = 'follow' AND a.created_at::date = CURRENT_DATE) AS follows_today,
                COUNT(*) FILTER (WHERE a.kind = 'purchase' AND a.created_at::date = CURRENT_DATE) AS purchases_today,
                COUNT(*) FILTER (WHERE a.kind = 'unlock' AND a.created_at::date = CURRENT_DATE) AS unlocks_today
            FROM bots b
            LEFT JOIN bot_actions a ON a.bot_id = b.id
            GROUP BY b.id
            ORDER BY b.display_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BotStats {
                    bot_id: row.try_get("id")?,
                    display_name: row.try_get("display_name")?,
                    active: row.try_get("active")?,
                    likes_today: row.try_get("likes_today")?,
                    follows_today: row.try_get("follows_today")?,
                    purchases_today: row.try_get("purchases_today")?,
                    unlocks_today: row.try_get("unlocks_today")?,
                    spent_today: row.try_get("spent_today")?,
                })
            })
            .collect()
    }

    async fn recent_content(&self, since: DateTime<Utc>) -> AppResult<Vec<ContentItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, author_id, title, created_at
            FROM content_items
            WHERE created_at >= $1
            ORDER BY created_at
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ContentItem {
                    id: row.try_get("id")?,
                    author_id: row.try_get("author_id")?,
                    title: row.try_get("title")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn recent_eas(&self, since: DateTime<Utc>) -> AppResult<Vec<EaListing>> {
        let rows = sqlx::query(
            r#"
            SELECT id, seller_id, name, price, created_at
            FROM ea_listings
            WHERE created_at >= $1
            ORDER BY created_at
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EaListing {
                    id: row.try_get("id")?,
                    seller_id: row.try_get("seller_id")?,
                    name: row.try_get("name")?,
                    price: row.try_get("price")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn create_pending_refund(&self, refund: NewPendingRefund) -> AppResult<PendingRefund> {
        let row = sqlx::query(
            r#"
            INSERT INTO pending_refunds
                (id, action_id, bot_id, seller_id, refund_amount, original_treasury_amount, due_at, processed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
            RETURNING id, action_id, bot_id, seller_id, refund_amount,
                      original_treasury_amount, due_at, processed, processing_error, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(refund.action_id)
        .bind(refund.bot_id)
        .bind(refund.seller_id)
        .bind(refund.refund_amount)
        .bind(refund.original_treasury_amount)
        .bind(refund.due_at)
        .fetch_one(&self.pool)
        .await?;

        Self::refund_from_row(&row)
    }

    async fn get_pending_refunds(&self, before: DateTime<Utc>) -> AppResult<Vec<PendingRefund>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action_id, bot_id, seller_id, refund_amount,
                   original_treasury_amount, due_at, processed, processing_error, created_at
            FROM pending_refunds
            WHERE processed = FALSE AND due_at <= $1
            ORDER BY due_at
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::refund_from_row).collect()
    }

    async fn mark_refund_processed(
        &self,
        refund_id: Uuid,
        error: Option<String>,
    ) -> AppResult<()> {
        let result = match error {
            None => {
                sqlx::query(
                    r#"
                    UPDATE pending_refunds
                    SET processed = TRUE, processing_error = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(refund_id)
                .execute(&self.pool)
                .await?
            }
            Some(message) => {
                sqlx::query(
                    r#"
                    UPDATE pending_refunds
                    SET processed = FALSE, processing_error = $2
                    WHERE id = $1
                    "#,
                )
                .bind(refund_id)
                .bind(message)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(BotError::RefundNotFound(refund_id).into());
        }
        Ok(())
    }
}
