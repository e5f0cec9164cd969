use async_trait::async_trait;
use tracing::info;

use crate::ledger::models::CoinTransaction;

/// Delivery seam the ledger calls after a transaction commits
///
/// Delivery is fire-and-forget: a notifier failure must never affect the
/// already-committed transaction, so implementations don't return errors.
#[async_trait]
pub trait EngagementNotifier: Send + Sync {
    async fn transaction_completed(&self, transaction: &CoinTransaction);
}

/// Logs completed transactions; the default wiring
pub struct TracingNotifier;

#[async_trait]
impl EngagementNotifier for TracingNotifier {
    async fn transaction_completed(&self, transaction: &CoinTransaction) {
        info!(
            transaction_id = %transaction.id,
            user_id = %transaction.user_id,
            amount = transaction.amount,
            trigger = transaction.trigger.as_str(),
            "coin transaction completed"
        );
    }
}

/// Silent notifier for tests
pub struct NoopNotifier;

#[async_trait]
impl EngagementNotifier for NoopNotifier {
    async fn transaction_completed(&self, _transaction: &CoinTransaction) {}
}
