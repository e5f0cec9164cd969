use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::models::*;
use crate::ledger::store::{BalanceUpdate, LedgerStore, NewJournalEntry, NewTransaction};
use crate::notify::EngagementNotifier;

/// How many times a version conflict is retried before giving up
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Stable failure classification surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionErrorCode {
    InsufficientFunds,
    TreasuryExhausted,
    VersionConflict,
    InvalidRequest,
    StorageFailure,
}

/// Result object returned across the orchestrator boundary
///
/// Failures come back as data, never as panics or propagated errors, so one
/// bot's failed action cannot abort a scan of the others.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionOutcome {
    pub success: bool,
    pub transaction_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<TransactionErrorCode>,
}

impl TransactionOutcome {
    fn completed(transaction_id: Uuid) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id),
            error: None,
            error_code: None,
        }
    }

    fn failed(
        transaction_id: Option<Uuid>,
        code: TransactionErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            transaction_id,
            error: Some(message.into()),
            error_code: Some(code),
        }
    }

    pub fn is_treasury_exhausted(&self) -> bool {
        self.error_code == Some(TransactionErrorCode::TreasuryExhausted)
    }
}

/// A single economic event to apply
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub user_id: Uuid,
    /// Signed: positive credits the user from the treasury, negative debits
    /// the user back into the treasury
    pub amount: i64,
    pub trigger: TransactionTrigger,
    pub channel: TransactionChannel,
    pub description: String,
    pub metadata: serde_json::Value,
    /// Must be deterministic for the logical event so retries are safe
    pub idempotency_key: String,
}

/// The only path that mutates balances
///
/// Applies one transaction atomically and idempotently: a duplicate
/// idempotency key returns the original result, a version conflict is
/// retried with fresh snapshots up to `max_retries` times, and any failure
/// inside the unit of work leaves no partially-applied state behind.
///
/// Only success consumes the idempotency key. A failed attempt is recorded
/// for audit under a derived key, so the same logical event can be retried
/// later (a refund re-run after the seller is funded, for example) and still
/// apply exactly once.
pub struct CoinTransactionService {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn EngagementNotifier>,
    max_retries: u32,
}

impl CoinTransactionService {
    pub fn new(store: Arc<dyn LedgerStore>, notifier: Arc<dyn EngagementNotifier>) -> Self {
        Self {
            store,
            notifier,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn execute_transaction(&self, request: TransactionRequest) -> TransactionOutcome {
        if request.amount == 0 {
            return TransactionOutcome::failed(
                None,
                TransactionErrorCode::InvalidRequest,
                LedgerError::ZeroAmount.to_string(),
            );
        }
        if request.idempotency_key.is_empty() {
            return TransactionOutcome::failed(
                None,
                TransactionErrorCode::InvalidRequest,
                LedgerError::MissingIdempotencyKey.to_string(),
            );
        }
        if request.trigger == TransactionTrigger::Mint {
            return TransactionOutcome::failed(
                None,
                TransactionErrorCode::InvalidRequest,
                "mint transactions go through mint_to_treasury",
            );
        }

        for attempt in 0..=self.max_retries {
            // At-most-once: a key that already completed returns the original
            // result unchanged, no matter how often it is replayed. Failed
            // attempts live under derived audit keys and never block a retry.
            match self.store.find_transaction_by_key(&request.idempotency_key).await {
                Ok(Some(existing)) if existing.status == TransactionStatus::Completed => {
                    return TransactionOutcome::completed(existing.id)
                }
                Ok(_) => {}
                Err(e) => {
                    return TransactionOutcome::failed(
                        None,
                        TransactionErrorCode::StorageFailure,
                        e.to_string(),
                    )
                }
            }

            match self.try_apply(&request).await {
                Ok(transaction) => {
                    self.notifier.transaction_completed(&transaction).await;
                    return TransactionOutcome::completed(transaction.id);
                }
                Err(AppError::Ledger(LedgerError::DuplicateKey(_))) => {
                    // A concurrent caller with the same key won; loop back
                    // and return their result
                    continue;
                }
                Err(AppError::Ledger(LedgerError::VersionConflict { account_id, .. })) => {
                    warn!(
                        %account_id,
                        attempt,
                        key = %request.idempotency_key,
                        "version conflict applying transaction, retrying"
                    );
                    continue;
                }
                Err(AppError::Ledger(err @ LedgerError::InsufficientFunds { account_type, .. })) => {
                    let code = match account_type {
                        AccountType::Treasury => TransactionErrorCode::TreasuryExhausted,
                        _ => TransactionErrorCode::InsufficientFunds,
                    };
                    let message = err.to_string();
                    let failed_id = self.record_failure(&request, &message).await;
                    return TransactionOutcome::failed(failed_id, code, message);
                }
                Err(e) => {
                    return TransactionOutcome::failed(
                        None,
                        TransactionErrorCode::StorageFailure,
                        e.to_string(),
                    )
                }
            }
        }

        let err = LedgerError::RetriesExhausted {
            attempts: self.max_retries,
        };
        TransactionOutcome::failed(None, TransactionErrorCode::VersionConflict, err.to_string())
    }

    /// One attempt against fresh account snapshots
    async fn try_apply(&self, request: &TransactionRequest) -> AppResult<CoinTransaction> {
        let user = self.store.get_or_create_user_account(request.user_id).await?;
        let treasury = self.store.get_treasury_account().await?;

        let magnitude = request.amount.abs();
        let (user_delta, treasury_delta) = if request.amount > 0 {
            // Treasury-funded credit to the user
            if !treasury.has_available(magnitude) {
                return Err(LedgerError::InsufficientFunds {
                    account_type: AccountType::Treasury,
                    required: magnitude,
                    available: treasury.available_balance,
                }
                .into());
            }
            (magnitude, -magnitude)
        } else {
            if !user.has_available(magnitude) {
                return Err(LedgerError::InsufficientFunds {
                    account_type: AccountType::User,
                    required: magnitude,
                    available: user.available_balance,
                }
                .into());
            }
            (-magnitude, magnitude)
        };

        let entries = vec![
            NewJournalEntry {
                account_type: AccountType::User,
                account_id: Some(user.id),
                side: if user_delta > 0 { EntrySide::Credit } else { EntrySide::Debit },
                amount: magnitude,
                balance_before: user.balance,
                balance_after: user.balance + user_delta,
                description: request.description.clone(),
            },
            NewJournalEntry {
                account_type: AccountType::Treasury,
                account_id: Some(treasury.id),
                side: if treasury_delta > 0 { EntrySide::Credit } else { EntrySide::Debit },
                amount: magnitude,
                balance_before: treasury.balance,
                balance_after: treasury.balance + treasury_delta,
                description: request.description.clone(),
            },
        ];

        let unbalanced: i64 = entries.iter().map(|e| e.signed_amount()).sum();
        if unbalanced != 0 {
            return Err(LedgerError::UnbalancedEntries(unbalanced).into());
        }

        let updates = vec![
            BalanceUpdate {
                account_id: user.id,
                available_delta: user_delta,
                pending_delta: 0,
                expected_version: user.version,
            },
            BalanceUpdate {
                account_id: treasury.id,
                available_delta: treasury_delta,
                pending_delta: 0,
                expected_version: treasury.version,
            },
        ];

        self.store
            .apply_transaction(
                NewTransaction {
                    user_id: request.user_id,
                    amount: request.amount,
                    trigger: request.trigger,
                    channel: request.channel,
                    description: request.description.clone(),
                    metadata: request.metadata.clone(),
                    idempotency_key: request.idempotency_key.clone(),
                },
                entries,
                updates,
            )
            .await
    }

    /// Coins enter the economy here and nowhere else: credit the treasury
    /// against the virtual mint source, journalled with the audit tag.
    pub async fn mint_to_treasury(
        &self,
        amount: i64,
        idempotency_key: String,
        description: String,
    ) -> TransactionOutcome {
        if amount <= 0 {
            return TransactionOutcome::failed(
                None,
                TransactionErrorCode::InvalidRequest,
                "mint amount must be positive",
            );
        }

        for _ in 0..=self.max_retries {
            match self.store.find_transaction_by_key(&idempotency_key).await {
                Ok(Some(existing)) if existing.status == TransactionStatus::Completed => {
                    return TransactionOutcome::completed(existing.id)
                }
                Ok(_) => {}
                Err(e) => {
                    return TransactionOutcome::failed(
                        None,
                        TransactionErrorCode::StorageFailure,
                        e.to_string(),
                    )
                }
            }

            let treasury = match self.store.get_treasury_account().await {
                Ok(account) => account,
                Err(e) => {
                    return TransactionOutcome::failed(
                        None,
                        TransactionErrorCode::StorageFailure,
                        e.to_string(),
                    )
                }
            };

            let entries = vec![
                NewJournalEntry {
                    account_type: AccountType::Treasury,
                    account_id: Some(treasury.id),
                    side: EntrySide::Credit,
                    amount,
                    balance_before: treasury.balance,
                    balance_after: treasury.balance + amount,
                    description: description.clone(),
                },
                NewJournalEntry {
                    account_type: AccountType::Mint,
                    account_id: None,
                    side: EntrySide::Debit,
                    amount,
                    balance_before: 0,
                    balance_after: 0,
                    description: "mint source".to_string(),
                },
            ];
            let updates = vec![BalanceUpdate {
                account_id: treasury.id,
                available_delta: amount,
                pending_delta: 0,
                expected_version: treasury.version,
            }];

            let result = self
                .store
                .apply_transaction(
                    NewTransaction {
                        // System transactions carry the nil user id
                        user_id: Uuid::nil(),
                        amount,
                        trigger: TransactionTrigger::Mint,
                        channel: TransactionChannel::System,
                        description: description.clone(),
                        metadata: serde_json::json!({}),
                        idempotency_key: idempotency_key.clone(),
                    },
                    entries,
                    updates,
                )
                .await;

            match result {
                Ok(transaction) => {
                    info!(amount, "treasury seeded via mint");
                    self.notifier.transaction_completed(&transaction).await;
                    return TransactionOutcome::completed(transaction.id);
                }
                Err(AppError::Ledger(LedgerError::DuplicateKey(_)))
                | Err(AppError::Ledger(LedgerError::VersionConflict { .. })) => continue,
                Err(e) => {
                    return TransactionOutcome::failed(
                        None,
                        TransactionErrorCode::StorageFailure,
                        e.to_string(),
                    )
                }
            }
        }

        TransactionOutcome::failed(
            None,
            TransactionErrorCode::VersionConflict,
            LedgerError::RetriesExhausted {
                attempts: self.max_retries,
            }
            .to_string(),
        )
    }

    async fn record_failure(&self, request: &TransactionRequest, error: &str) -> Option<Uuid> {
        // The audit row must not claim the caller's key: a later retry of
        // the same logical event has to be able to succeed under it. The
        // requested key is kept in the metadata for traceability.
        let audit_key = format!("{}#failed-{}", request.idempotency_key, Uuid::new_v4());
        let mut metadata = request.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                "requested_key".to_string(),
                serde_json::json!(request.idempotency_key),
            );
        }

        let result = self
            .store
            .record_failed_transaction(
                NewTransaction {
                    user_id: request.user_id,
                    amount: request.amount,
                    trigger: request.trigger,
                    channel: request.channel,
                    description: request.description.clone(),
                    metadata,
                    idempotency_key: audit_key,
                },
                error,
            )
            .await;

        match result {
            Ok(transaction) => Some(transaction.id),
            Err(e) => {
                // Audit row is best-effort; the failure outcome stands
                warn!(error = %e, "could not record failed transaction");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::notify::NoopNotifier;

    fn service(store: Arc<MemoryLedgerStore>) -> CoinTransactionService {
        CoinTransactionService::new(store, Arc::new(NoopNotifier))
    }

    fn reward(user_id: Uuid, key: &str) -> TransactionRequest {
        TransactionRequest {
            user_id,
            amount: 10,
            trigger: TransactionTrigger::OnboardingFirstThread,
            channel: TransactionChannel::Onboarding,
            description: "First thread reward".into(),
            metadata: serde_json::json!({"task": "first_thread"}),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_onboarding_reward_moves_coins_from_treasury() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let svc = service(store.clone());
        let user_id = Uuid::new_v4();

        let outcome = svc.execute_transaction(reward(user_id, "k1")).await;
        assert!(outcome.success);

        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        let treasury = store.get_treasury_account().await.unwrap();
        assert_eq!(wallet.balance, 10);
        assert_eq!(treasury.balance, 90);
        assert!(wallet.is_consistent());
        assert!(treasury.is_consistent());

        // One journal pair summing to zero
        let entries = store
            .get_journal_entries(outcome.transaction_id.unwrap())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.signed_amount()).sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn test_replay_applies_exactly_once() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let svc = service(store.clone());
        let user_id = Uuid::new_v4();

        let first = svc.execute_transaction(reward(user_id, "same-key")).await;
        for _ in 0..5 {
            let replay = svc.execute_transaction(reward(user_id, "same-key")).await;
            assert!(replay.success);
            assert_eq!(replay.transaction_id, first.transaction_id);
        }

        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        assert_eq!(wallet.balance, 10);
        assert_eq!(store.all_journal_entries().len(), 2);
    }

    #[tokio::test]
    async fn test_debit_below_zero_is_rejected() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let svc = service(store.clone());
        let user_id = Uuid::new_v4();

        let outcome = svc
            .execute_transaction(TransactionRequest {
                amount: -5,
                ..reward(user_id, "debit-1")
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_code, Some(TransactionErrorCode::InsufficientFunds));

        // Audit row exists under its own key, balances untouched
        let failed = store
            .get_transaction(outcome.transaction_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert!(store.find_transaction_by_key("debit-1").await.unwrap().is_none());
        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        assert_eq!(wallet.balance, 0);
        assert!(store.all_journal_entries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_attempt_leaves_key_retryable() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let svc = service(store.clone());
        let user_id = Uuid::new_v4();

        // The debit fails while the wallet is empty
        let first = svc
            .execute_transaction(TransactionRequest {
                amount: -5,
                ..reward(user_id, "claw-1")
            })
            .await;
        assert!(!first.success);

        // Fund the wallet, then retry the same key: it must apply
        let funded = svc.execute_transaction(reward(user_id, "fund-1")).await;
        assert!(funded.success);
        let retry = svc
            .execute_transaction(TransactionRequest {
                amount: -5,
                ..reward(user_id, "claw-1")
            })
            .await;
        assert!(retry.success);

        // And once it has succeeded, further replays are no-ops
        let replay = svc
            .execute_transaction(TransactionRequest {
                amount: -5,
                ..reward(user_id, "claw-1")
            })
            .await;
        assert_eq!(replay.transaction_id, retry.transaction_id);

        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        assert_eq!(wallet.balance, 5);
    }

    #[tokio::test]
    async fn test_empty_treasury_surfaces_exhaustion() {
        let store = Arc::new(MemoryLedgerStore::new());
        let svc = service(store.clone());

        let outcome = svc.execute_transaction(reward(Uuid::new_v4(), "k")).await;
        assert!(!outcome.success);
        assert!(outcome.is_treasury_exhausted());
    }

    #[tokio::test]
    async fn test_zero_amount_and_missing_key_rejected() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(100));
        let svc = service(store.clone());
        let user_id = Uuid::new_v4();

        let zero = svc
            .execute_transaction(TransactionRequest {
                amount: 0,
                ..reward(user_id, "z")
            })
            .await;
        assert_eq!(zero.error_code, Some(TransactionErrorCode::InvalidRequest));

        let keyless = svc
            .execute_transaction(TransactionRequest {
                idempotency_key: String::new(),
                ..reward(user_id, "")
            })
            .await;
        assert_eq!(keyless.error_code, Some(TransactionErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_mint_seeds_treasury_idempotently() {
        let store = Arc::new(MemoryLedgerStore::new());
        let svc = service(store.clone());

        let first = svc
            .mint_to_treasury(1000, "seed-1".into(), "initial float".into())
            .await;
        assert!(first.success);
        let replay = svc
            .mint_to_treasury(1000, "seed-1".into(), "initial float".into())
            .await;
        assert_eq!(replay.transaction_id, first.transaction_id);

        let treasury = store.get_treasury_account().await.unwrap();
        assert_eq!(treasury.balance, 1000);

        // The mint pair still sums to zero thanks to the tagged source leg
        let entries = store
            .get_journal_entries(first.transaction_id.unwrap())
            .await
            .unwrap();
        assert_eq!(entries.iter().map(|e| e.signed_amount()).sum::<i64>(), 0);
        assert!(entries.iter().any(|e| e.account_type == AccountType::Mint));
    }

    #[tokio::test]
    async fn test_concurrent_credits_converge() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let svc = Arc::new(service(store.clone()).with_max_retries(16));
        let user_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for i in 0..4 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.execute_transaction(reward(user_id, &format!("conc-{}", i)))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        let treasury = store.get_treasury_account().await.unwrap();
        assert_eq!(wallet.balance, 40);
        assert_eq!(treasury.balance, 960);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_converges_to_one() {
        let store = Arc::new(MemoryLedgerStore::with_treasury(1000));
        let svc = Arc::new(service(store.clone()).with_max_retries(16));
        let user_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.execute_transaction(reward(user_id, "one-key")).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.success);
            ids.push(outcome.transaction_id.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let wallet = store.get_or_create_user_account(user_id).await.unwrap();
        assert_eq!(wallet.balance, 10);
    }
}
