use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

/// Account type - who holds a balance
///
/// `Mint` never owns a real account row; it is the audit tag journal
/// entries carry when coins are created out of nothing (treasury seeding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Treasury,
    Mint,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Treasury => "treasury",
            AccountType::Mint => "mint",
        }
    }
}

/// Balance-holding account (user wallet or the treasury singleton)
///
/// INVARIANT: balance = available_balance + pending_balance at all times.
/// `version` increments on every mutation; writes carry the version they
/// read and are rejected when it no longer matches (optimistic lock).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub account_type: AccountType,
    /// Owning user for wallets; None for the treasury
    pub owner_id: Option<Uuid>,
    pub balance: i64,
    pub available_balance: i64,
    pub pending_balance: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.available_balance + self.pending_balance
    }

    pub fn has_available(&self, required: i64) -> bool {
        self.available_balance >= required
    }
}

/// Transaction status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Enumerated reason a transaction exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionTrigger {
    OnboardingFirstThread,
    OnboardingFirstReply,
    OnboardingProfileCompleted,
    OnboardingFirstEa,
    BotPurchase,
    BotUnlock,
    BotRefund,
    AdminAdjustment,
    Mint,
}

impl TransactionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionTrigger::OnboardingFirstThread => "onboarding_first_thread",
            TransactionTrigger::OnboardingFirstReply => "onboarding_first_reply",
            TransactionTrigger::OnboardingProfileCompleted => "onboarding_profile_completed",
            TransactionTrigger::OnboardingFirstEa => "onboarding_first_ea",
            TransactionTrigger::BotPurchase => "bot_purchase",
            TransactionTrigger::BotUnlock => "bot_unlock",
            TransactionTrigger::BotRefund => "bot_refund",
            TransactionTrigger::AdminAdjustment => "admin_adjustment",
            TransactionTrigger::Mint => "mint",
        }
    }
}

/// Grouping channel for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_channel", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionChannel {
    Onboarding,
    Marketplace,
    Bot,
    System,
}

/// An atomic economic event against one user wallet
///
/// INVARIANT: `idempotency_key` is globally unique. A second transaction
/// carrying a previously-seen key is a no-op returning the original result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: positive credits the user, negative debits
    pub amount: i64,
    pub trigger: TransactionTrigger,
    pub channel: TransactionChannel,
    pub description: String,
    pub metadata: serde_json::Value,
    pub idempotency_key: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Journal entry side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "entry_side", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntrySide {
    Debit,
    Credit,
}

/// One leg of a double-entry posting
///
/// INVARIANT: for every completed transaction the signed amounts of its
/// entries sum to zero (credits positive, debits negative).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub account_type: AccountType,
    /// None for the virtual mint source
    pub account_id: Option<Uuid>,
    pub side: EntrySide,
    /// Always positive; sign comes from `side`
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn signed_amount(&self) -> i64 {
        match self.side {
            EntrySide::Credit => self.amount,
            EntrySide::Debit => -self.amount,
        }
    }
}

/// Persona profile a bot acts under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotPersona {
    /// UTC offset in hours for the simulated timezone
    pub utc_offset_hours: i32,
    /// Local hours the bot is "awake" (inclusive start, exclusive end)
    pub active_from_hour: u32,
    pub active_until_hour: u32,
    /// Free-form interests used for flavour in descriptions
    pub interests: Vec<String>,
}

impl Default for BotPersona {
    fn default() -> Self {
        Self {
            utc_offset_hours: 0,
            active_from_hour: 7,
            active_until_hour: 23,
            interests: Vec::new(),
        }
    }
}

impl BotPersona {
    /// Whether the persona's local clock falls inside its waking hours
    pub fn is_awake(&self, now: DateTime<Utc>) -> bool {
        use chrono::Timelike;
        let local_hour = (now.hour() as i32 + self.utc_offset_hours).rem_euclid(24) as u32;
        if self.active_from_hour <= self.active_until_hour {
            local_hour >= self.active_from_hour && local_hour < self.active_until_hour
        } else {
            // Window wraps midnight
            local_hour >= self.active_from_hour || local_hour < self.active_until_hour
        }
    }
}

/// Per-day activity caps for one bot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BotCaps {
    pub daily_likes: i32,
    pub daily_follows: i32,
    pub daily_purchases: i32,
    pub daily_unlocks: i32,
}

impl Default for BotCaps {
    fn default() -> Self {
        Self {
            daily_likes: 20,
            daily_follows: 10,
            daily_purchases: 2,
            daily_unlocks: 3,
        }
    }
}

impl BotCaps {
    pub fn for_kind(&self, kind: BotActionKind) -> i32 {
        match kind {
            BotActionKind::Like => self.daily_likes,
            BotActionKind::Follow => self.daily_follows,
            BotActionKind::Purchase => self.daily_purchases,
            BotActionKind::Unlock => self.daily_unlocks,
        }
    }
}

/// Simulated actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub display_name: String,
    /// Operator-facing classification (e.g. "engagement", "marketplace")
    pub purpose: String,
    /// Gates which action types are allowed; monetary actions need more trust
    pub trust_level: i16,
    pub persona: BotPersona,
    pub caps: BotCaps,
    pub active: bool,
    pub spent_today: i64,
    pub created_at: DateTime<Utc>,
}

/// Kind of simulated engagement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "bot_action_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BotActionKind {
    Like,
    Follow,
    Purchase,
    Unlock,
}

impl BotActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotActionKind::Like => "like",
            BotActionKind::Follow => "follow",
            BotActionKind::Purchase => "purchase",
            BotActionKind::Unlock => "unlock",
        }
    }

    /// Whether this action moves coins
    pub fn is_monetary(&self) -> bool {
        matches!(self, BotActionKind::Purchase | BotActionKind::Unlock)
    }
}

/// A single simulated engagement event
///
/// Once `refunded` flips to true it never flips back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotAction {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub kind: BotActionKind,
    pub target_id: Uuid,
    /// Coins spent for purchase/unlock; zero otherwise
    pub amount: i64,
    pub refundable: bool,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
}

/// Scheduled reversal of a refundable bot purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRefund {
    pub id: Uuid,
    pub action_id: Uuid,
    pub bot_id: Uuid,
    pub seller_id: Uuid,
    /// What gets clawed back from the seller
    pub refund_amount: i64,
    /// What the treasury originally paid out (>= refund_amount)
    pub original_treasury_amount: i64,
    pub due_at: DateTime<Utc>,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Treasury daily spend counter (one row per calendar day)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryDailySpend {
    pub date: NaiveDate,
    pub amount_spent: i64,
    pub action_count: i32,
}

/// Operator-togglable engine settings, persisted alongside the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Global kill switch for all bot spending
    pub bots_enabled: bool,
    /// Max coins the treasury may pay out per calendar day
    pub treasury_daily_limit: i64,
    /// Hours between a refundable purchase and its reversal becoming due
    pub refund_delay_hours: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bots_enabled: true,
            treasury_daily_limit: 500,
            refund_delay_hours: 24,
        }
    }
}

/// Recently created forum content the orchestrator may engage with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub author_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Recently published marketplace listing (Expert Advisor)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EaListing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub name: String,
    pub price: i64,
    pub created_at: DateTime<Utc>,
}

/// Onboarding tasks that award coins exactly once per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingTask {
    FirstThread,
    FirstReply,
    ProfileCompleted,
    FirstEa,
}

impl OnboardingTask {
    pub fn trigger(&self) -> TransactionTrigger {
        match self {
            OnboardingTask::FirstThread => TransactionTrigger::OnboardingFirstThread,
            OnboardingTask::FirstReply => TransactionTrigger::OnboardingFirstReply,
            OnboardingTask::ProfileCompleted => TransactionTrigger::OnboardingProfileCompleted,
            OnboardingTask::FirstEa => TransactionTrigger::OnboardingFirstEa,
        }
    }

    /// Fixed reward per task
    pub fn reward(&self) -> i64 {
        match self {
            OnboardingTask::FirstThread => 10,
            OnboardingTask::FirstReply => 5,
            OnboardingTask::ProfileCompleted => 15,
            OnboardingTask::FirstEa => 25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardingTask::FirstThread => "first_thread",
            OnboardingTask::FirstReply => "first_reply",
            OnboardingTask::ProfileCompleted => "profile_completed",
            OnboardingTask::FirstEa => "first_ea",
        }
    }

    /// Deterministic per-user key so a retried award can never double-apply
    pub fn idempotency_key(&self, user_id: Uuid) -> String {
        format!("onboarding-{}-{}", user_id, self.as_str())
    }
}

/// Per-bot counters surfaced on the admin dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStats {
    pub bot_id: Uuid,
    pub display_name: String,
    pub active: bool,
    pub likes_today: i64,
    pub follows_today: i64,
    pub purchases_today: i64,
    pub unlocks_today: i64,
    pub spent_today: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_account_consistency() {
        let account = Account {
            id: Uuid::new_v4(),
            account_type: AccountType::User,
            owner_id: Some(Uuid::new_v4()),
            balance: 100,
            available_balance: 70,
            pending_balance: 30,
            version: 1,
            updated_at: Utc::now(),
        };
        assert!(account.is_consistent());
        assert!(account.has_available(70));
        assert!(!account.has_available(71));
    }

    #[test]
    fn test_journal_entry_signing() {
        let mut entry = JournalEntry {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            account_type: AccountType::User,
            account_id: Some(Uuid::new_v4()),
            side: EntrySide::Credit,
            amount: 10,
            balance_before: 0,
            balance_after: 10,
            description: String::new(),
            created_at: Utc::now(),
        };
        assert_eq!(entry.signed_amount(), 10);
        entry.side = EntrySide::Debit;
        assert_eq!(entry.signed_amount(), -10);
    }

    #[test]
    fn test_persona_waking_hours() {
        let persona = BotPersona {
            utc_offset_hours: 0,
            active_from_hour: 9,
            active_until_hour: 17,
            interests: vec![],
        };
        let morning = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        assert!(persona.is_awake(morning));
        assert!(!persona.is_awake(night));

        // Window wrapping midnight
        let owl = BotPersona {
            active_from_hour: 22,
            active_until_hour: 4,
            ..persona
        };
        assert!(owl.is_awake(night));
        assert!(!owl.is_awake(morning));
    }

    #[test]
    fn test_persona_timezone_offset() {
        let persona = BotPersona {
            utc_offset_hours: -5,
            active_from_hour: 9,
            active_until_hour: 17,
            interests: vec![],
        };
        // 15:00 UTC = 10:00 local
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap();
        assert!(persona.is_awake(now));
        // 10:00 UTC = 05:00 local
        let early = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        assert!(!persona.is_awake(early));
    }

    #[test]
    fn test_onboarding_keys_are_deterministic() {
        let user = Uuid::new_v4();
        let task = OnboardingTask::FirstThread;
        assert_eq!(task.idempotency_key(user), task.idempotency_key(user));
        assert_ne!(
            task.idempotency_key(user),
            OnboardingTask::FirstReply.idempotency_key(user)
        );
    }
}
