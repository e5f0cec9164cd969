use chrono::{DateTime, TimeZone, Timelike, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::engine::orchestrator::{CycleReport, EngagementOrchestrator};
use crate::engine::refunds::{RefundProcessor, SweepReport};
use crate::engine::treasury::TreasuryService;
use crate::error::AppResult;

/// Engine schedule configuration
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Minutes between engagement cycles
    pub cycle_minutes: u64,
    /// UTC hours inside which engagement cycles fire (inclusive start,
    /// exclusive end; may wrap midnight)
    pub active_start_hour: u32,
    pub active_end_hour: u32,
    /// UTC hour for the daily refund sweep (0-23, off-peak)
    pub sweep_hour: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: 10,
            active_start_hour: 6,
            active_end_hour: 23,
            sweep_hour: 2,
        }
    }
}

/// Engine scheduler - drives engagement cycles and the daily refund sweep
///
/// Each job holds a run-lock for its whole execution; a tick that finds the
/// lock still held logs and skips rather than stacking a second run on top.
pub struct EngineScheduler {
    config: ScheduleConfig,
    orchestrator: Arc<EngagementOrchestrator>,
    refunds: Arc<RefundProcessor>,
    treasury: Arc<TreasuryService>,
    cycle_lock: Mutex<()>,
    sweep_lock: Mutex<()>,
}

impl EngineScheduler {
    pub fn new(
        config: ScheduleConfig,
        orchestrator: Arc<EngagementOrchestrator>,
        refunds: Arc<RefundProcessor>,
        treasury: Arc<TreasuryService>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            refunds,
            treasury,
            cycle_lock: Mutex::new(()),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Start both background loops
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            Self::spawn_engagement_loop(self.clone()),
            Self::spawn_daily_loop(self),
        ]
    }

    fn spawn_engagement_loop(scheduler: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(scheduler.config.cycle_minutes * 60));
            // The first tick fires immediately; skip it so startup is quiet
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let now = Utc::now();
                if !in_active_window(
                    now.hour(),
                    scheduler.config.active_start_hour,
                    scheduler.config.active_end_hour,
                ) {
                    continue;
                }

                if let Err(e) = scheduler.tick_engagement(now).await {
                    error!("engagement cycle failed: {:?}", e);
                }
            }
        })
    }

    fn spawn_daily_loop(scheduler: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = calculate_next_daily_execution(now, scheduler.config.sweep_hour);
                let wait = next.signed_duration_since(now);

                if wait.num_seconds() > 0 {
                    info!(
                        "⏰ Next refund sweep scheduled for: {} UTC",
                        next.format("%H:%M:%S")
                    );
                    tokio::time::sleep(Duration::from_secs(wait.num_seconds() as u64)).await;
                }

                if let Err(e) = scheduler.run_daily_sweep().await {
                    error!("refund sweep failed: {:?}", e);
                }
            }
        })
    }

    /// One engagement tick; returns None when the previous run still holds
    /// the lock
    pub async fn tick_engagement(&self, now: DateTime<Utc>) -> AppResult<Option<CycleReport>> {
        let guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("previous engagement cycle still running, skipping tick");
                return Ok(None);
            }
        };

        info!("🔄 Starting engagement cycle");
        let report = self.orchestrator.run_cycle(now).await?;
        drop(guard);
        Ok(Some(report))
    }

    /// Manual trigger from the admin API; queues behind a running cycle
    /// instead of skipping
    pub async fn run_now(&self) -> AppResult<CycleReport> {
        let _guard = self.cycle_lock.lock().await;
        info!("🔄 Starting engagement cycle (manual trigger)");
        self.orchestrator.run_cycle(Utc::now()).await
    }

    /// Refund reconciliation followed by the once-a-day counter reset
    pub async fn run_daily_sweep(&self) -> AppResult<Option<SweepReport>> {
        let guard = match self.sweep_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("previous refund sweep still running, skipping");
                return Ok(None);
            }
        };

        info!("🔄 Starting daily refund sweep");
        let report = self.refunds.process_due(Utc::now()).await?;
        self.treasury.reset_daily().await?;
        info!("✓ Daily sweep completed");
        drop(guard);
        Ok(Some(report))
    }
}

/// Whether `hour` falls inside the engagement window
fn in_active_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        // Window wraps midnight
        hour >= start || hour < end
    }
}

/// Calculate next daily execution time
fn calculate_next_daily_execution(now: DateTime<Utc>, execution_hour: u32) -> DateTime<Utc> {
    let next = now
        .date_naive()
        .and_hms_opt(execution_hour, 0, 0)
        .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).unwrap());
    let next_dt = Utc.from_utc_datetime(&next);

    // If execution time has passed today, schedule for tomorrow
    if next_dt <= now {
        let tomorrow = (now.date_naive() + chrono::Duration::days(1))
            .and_hms_opt(execution_hour, 0, 0)
            .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).unwrap());
        Utc.from_utc_datetime(&tomorrow)
    } else {
        next_dt
    }
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;

    use super::*;
    use crate::engine::orchestrator::OrchestratorConfig;
    use crate::engine::transactions::CoinTransactionService;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::ledger::LedgerStore;
    use crate::notify::NoopNotifier;

    #[test]
    fn test_calculate_next_daily_execution() {
        // Current time: 2024-01-01 10:00:00 UTC
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        // Execution hour: 14:00 (today)
        let next = calculate_next_daily_execution(now, 14);
        assert_eq!(next.hour(), 14);
        assert_eq!(next.day(), 1);

        // Execution hour: 09:00 (already passed, so tomorrow)
        let next = calculate_next_daily_execution(now, 9);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.day(), 2);
    }

    #[test]
    fn test_active_window() {
        assert!(in_active_window(10, 6, 23));
        assert!(!in_active_window(3, 6, 23));
        assert!(!in_active_window(23, 6, 23));

        // Wrapping window (evening to morning)
        assert!(in_active_window(23, 22, 4));
        assert!(in_active_window(1, 22, 4));
        assert!(!in_active_window(12, 22, 4));
    }

    fn scheduler(store: Arc<MemoryLedgerStore>) -> EngineScheduler {
        let transactions = Arc::new(CoinTransactionService::new(
            store.clone(),
            Arc::new(NoopNotifier),
        ));
        let treasury = Arc::new(TreasuryService::new(store.clone()));
        let orchestrator = Arc::new(EngagementOrchestrator::new(
            store.clone(),
            transactions.clone(),
            treasury.clone(),
            OrchestratorConfig::default(),
        ));
        let refunds = Arc::new(RefundProcessor::new(store, transactions, treasury.clone()));
        EngineScheduler::new(ScheduleConfig::default(), orchestrator, refunds, treasury)
    }

    #[tokio::test]
    async fn test_tick_skips_while_cycle_running() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let scheduler = scheduler(store);

        let _held = scheduler.cycle_lock.lock().await;
        let result = scheduler.tick_engagement(Utc::now()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_daily_sweep_resets_counters_once() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let scheduler = scheduler(store.clone());

        let today = Utc::now().date_naive();
        store.try_reserve_daily_spend(today, 100, 500).await.unwrap();

        let report = scheduler.run_daily_sweep().await.unwrap();
        assert!(report.is_some());

        let spend = store.get_daily_spend(today).await.unwrap();
        assert_eq!(spend.amount_spent, 0);

        // A sweep already in flight is not doubled
        let _held = scheduler.sweep_lock.lock().await;
        let skipped = scheduler.run_daily_sweep().await.unwrap();
        assert!(skipped.is_none());
    }
}
