use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::transactions::{CoinTransactionService, TransactionRequest};
use crate::engine::treasury::TreasuryService;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{PendingRefund, TransactionChannel, TransactionTrigger};
use crate::ledger::store::LedgerStore;

/// Sweep summary, logged and returned by the manual trigger
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub processed: u32,
    pub failed: u32,
    pub coins_clawed_back: i64,
    pub coins_refilled: i64,
}

/// Reverses simulated bot purchases once their delay elapses
///
/// Each refund is processed independently: the seller claw-back runs through
/// the transaction service under a key derived from the bot action id, so a
/// sweep that dies halfway and re-runs can never debit a seller twice. A
/// failed item gets its error recorded on the row and is retried by the next
/// sweep.
pub struct RefundProcessor {
    store: Arc<dyn LedgerStore>,
    transactions: Arc<CoinTransactionService>,
    treasury: Arc<TreasuryService>,
}

impl RefundProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        transactions: Arc<CoinTransactionService>,
        treasury: Arc<TreasuryService>,
    ) -> Self {
        Self {
            store,
            transactions,
            treasury,
        }
    }

    pub async fn process_due(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let due = self.store.get_pending_refunds(now).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for refund in due {
            match self.process_one(&refund).await {
                Ok(refilled) => {
                    if let Err(e) = self.store.mark_refund_processed(refund.id, None).await {
                        warn!(refund_id = %refund.id, error = %e, "could not mark refund processed");
                        report.failed += 1;
                        continue;
                    }
                    report.processed += 1;
                    report.coins_clawed_back += refund.refund_amount;
                    report.coins_refilled += refilled;
                }
                Err(e) => {
                    warn!(refund_id = %refund.id, error = %e, "refund failed, will retry next sweep");
                    if let Err(mark_err) = self
                        .store
                        .mark_refund_processed(refund.id, Some(e.to_string()))
                        .await
                    {
                        warn!(refund_id = %refund.id, error = %mark_err, "could not record refund error");
                    }
                    report.failed += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                processed = report.processed,
                failed = report.failed,
                clawed_back = report.coins_clawed_back,
                refilled = report.coins_refilled,
                "refund sweep finished"
            );
        }
        Ok(report)
    }

    /// Returns the total amount credited back to the treasury
    async fn process_one(&self, refund: &PendingRefund) -> AppResult<i64> {
        // Deterministic key: a replay of this step returns the original
        // transaction instead of debiting the seller again
        let outcome = self
            .transactions
            .execute_transaction(TransactionRequest {
                user_id: refund.seller_id,
                amount: -refund.refund_amount,
                trigger: TransactionTrigger::BotRefund,
                channel: TransactionChannel::Bot,
                description: "Simulated purchase reversal".to_string(),
                metadata: serde_json::json!({
                    "refund_id": refund.id,
                    "action_id": refund.action_id,
                    "bot_id": refund.bot_id,
                    "original_treasury_amount": refund.original_treasury_amount,
                }),
                idempotency_key: format!("bot-refund-{}", refund.action_id),
            })
            .await;

        if !outcome.success {
            return Err(AppError::Internal(
                outcome
                    .error
                    .unwrap_or_else(|| "refund transaction failed".to_string()),
            ));
        }

        // The claw-back already credits the treasury; only the portion the
        // seller never received (fees retained at purchase time) needs a
        // direct refill. The refill has no idempotency key of its own, so
        // the action's refunded flag doubles as its done-marker: a sweep
        // that replays this refund after a crash must not credit the
        // remainder a second time.
        let remainder = refund.original_treasury_amount - refund.refund_amount;
        let mut refilled = 0;
        if remainder > 0 {
            let already_refunded = self
                .store
                .get_bot_action(refund.action_id)
                .await?
                .map(|action| action.refunded)
                .unwrap_or(false);
            if !already_refunded {
                self.treasury.refill(remainder).await?;
                refilled = remainder;
            }
        }

        self.store.mark_action_refunded(refund.action_id).await?;
        Ok(refund.refund_amount + refilled)
    }
}
