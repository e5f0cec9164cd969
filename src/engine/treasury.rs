use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppResult, TreasuryError};
use crate::ledger::models::EngineSettings;
use crate::ledger::store::LedgerStore;

/// A daily-cap reservation that must be released if the downstream
/// transaction never happens
#[derive(Debug, Clone, Copy)]
pub struct SpendReservation {
    pub date: NaiveDate,
    pub amount: i64,
}

/// Snapshot for the admin dashboard
#[derive(Debug, Clone, Serialize)]
pub struct TreasuryStatus {
    pub balance: i64,
    pub available_balance: i64,
    pub spent_today: i64,
    pub actions_today: i32,
    pub daily_limit: i64,
    pub bots_enabled: bool,
}

/// Guards the coin float: every bot spend must clear the enable flag, the
/// per-day cap and the available balance before any transaction runs.
pub struct TreasuryService {
    store: Arc<dyn LedgerStore>,
}

impl TreasuryService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Authorize a spend of `amount` against today's cap.
    ///
    /// The cap counter is bumped atomically, so concurrent cycles cannot
    /// jointly overshoot the limit. The caller must `release` the
    /// reservation if the funding transaction fails afterwards.
    pub async fn reserve_spend(&self, amount: i64) -> AppResult<SpendReservation> {
        let settings = self.store.get_bot_settings().await?;
        if !settings.bots_enabled {
            return Err(TreasuryError::Disabled.into());
        }

        let date = Utc::now().date_naive();
        self.store
            .try_reserve_daily_spend(date, amount, settings.treasury_daily_limit)
            .await?;

        // Fail fast on an empty treasury rather than burning a transaction
        // attempt; the transaction itself re-checks under its own lock
        let treasury = match self.store.get_treasury_account().await {
            Ok(account) => account,
            Err(e) => {
                self.release(SpendReservation { date, amount }).await;
                return Err(e);
            }
        };
        if !treasury.has_available(amount) {
            let available = treasury.available_balance;
            self.release(SpendReservation { date, amount }).await;
            return Err(TreasuryError::Exhausted {
                required: amount,
                available,
            }
            .into());
        }

        Ok(SpendReservation { date, amount })
    }

    /// Give back a reservation whose spend did not happen
    pub async fn release(&self, reservation: SpendReservation) {
        if let Err(e) = self
            .store
            .release_daily_spend(reservation.date, reservation.amount)
            .await
        {
            // The counter stays conservatively high until the daily reset
            warn!(
                error = %e,
                amount = reservation.amount,
                "could not release daily spend reservation"
            );
        }
    }

    /// Uncapped treasury credit, used by refund reconciliation
    pub async fn refill(&self, amount: i64) -> AppResult<()> {
        self.store.refill_treasury(amount).await?;
        info!(amount, "treasury refilled");
        Ok(())
    }

    /// Zero today's counters; runs exactly once per day from the sweep
    pub async fn reset_daily(&self) -> AppResult<()> {
        self.store.reset_daily_spend().await?;
        info!("daily treasury spend counters reset");
        Ok(())
    }

    pub async fn settings(&self) -> AppResult<EngineSettings> {
        self.store.get_bot_settings().await
    }

    pub async fn update_settings(&self, settings: EngineSettings) -> AppResult<EngineSettings> {
        self.store.update_bot_settings(settings.clone()).await?;
        info!(
            bots_enabled = settings.bots_enabled,
            treasury_daily_limit = settings.treasury_daily_limit,
            "engine settings updated"
        );
        Ok(settings)
    }

    pub async fn status(&self) -> AppResult<TreasuryStatus> {
        let settings = self.store.get_bot_settings().await?;
        let treasury = self.store.get_treasury_account().await?;
        let spend = self.store.get_daily_spend(Utc::now().date_naive()).await?;
        Ok(TreasuryStatus {
            balance: treasury.balance,
            available_balance: treasury.available_balance,
            spent_today: spend.amount_spent,
            actions_today: spend.action_count,
            daily_limit: settings.treasury_daily_limit,
            bots_enabled: settings.bots_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::ledger::memory::MemoryLedgerStore;

    #[tokio::test]
    async fn test_reserve_within_limit() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let treasury = TreasuryService::new(store.clone());

        let reservation = treasury.reserve_spend(100).await.unwrap();
        assert_eq!(reservation.amount, 100);

        let status = treasury.status().await.unwrap();
        assert_eq!(status.spent_today, 100);
    }

    #[tokio::test]
    async fn test_daily_limit_is_enforced() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(10_000));
        let treasury = TreasuryService::new(store.clone());

        // Default limit is 500
        treasury.reserve_spend(450).await.unwrap();
        let err = treasury.reserve_spend(100).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Treasury(TreasuryError::DailyLimitExceeded { .. })
        ));

        // Still room for a smaller spend
        treasury.reserve_spend(50).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_treasury_releases_the_reservation() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(10));
        let treasury = TreasuryService::new(store.clone());

        let err = treasury.reserve_spend(50).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Treasury(TreasuryError::Exhausted { .. })
        ));

        // The failed attempt must not consume daily cap
        let status = treasury.status().await.unwrap();
        assert_eq!(status.spent_today, 0);
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_spending() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let treasury = TreasuryService::new(store.clone());

        let mut settings = treasury.settings().await.unwrap();
        settings.bots_enabled = false;
        treasury.update_settings(settings).await.unwrap();

        let err = treasury.reserve_spend(10).await.unwrap_err();
        assert!(matches!(err, AppError::Treasury(TreasuryError::Disabled)));
    }

    #[tokio::test]
    async fn test_release_returns_cap_headroom() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let treasury = TreasuryService::new(store.clone());

        let reservation = treasury.reserve_spend(500).await.unwrap();
        assert!(treasury.reserve_spend(1).await.is_err());

        treasury.release(reservation).await;
        treasury.reserve_spend(500).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_clears_counter() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let treasury = TreasuryService::new(store.clone());

        treasury.reserve_spend(500).await.unwrap();
        treasury.reset_daily().await.unwrap();

        let status = treasury.status().await.unwrap();
        assert_eq!(status.spent_today, 0);
        treasury.reserve_spend(500).await.unwrap();
    }
}
