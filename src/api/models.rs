use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::models::{Account, Bot, BotCaps, BotPersona, OnboardingTask};

#[derive(Debug, Deserialize)]
pub struct OnboardingRewardRequest {
    pub user_id: Uuid,
    pub task: OnboardingTask,
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub user_id: Uuid,
    /// Signed: positive credits the user from the treasury
    pub amount: i64,
    pub reason: String,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SeedTreasuryRequest {
    pub amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub bots_enabled: Option<bool>,
    pub treasury_daily_limit: Option<i64>,
    pub refund_delay_hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub display_name: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub trust_level: Option<i16>,
    #[serde(default)]
    pub persona: Option<BotPersona>,
    #[serde(default)]
    pub caps: Option<BotCaps>,
}

impl CreateBotRequest {
    pub fn into_bot(self) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            display_name: self.display_name,
            purpose: self.purpose.unwrap_or_else(|| "engagement".to_string()),
            trust_level: self.trust_level.unwrap_or(0),
            persona: self.persona.unwrap_or_default(),
            caps: self.caps.unwrap_or_default(),
            active: true,
            spent_today: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateBotRequest {
    pub display_name: Option<String>,
    pub purpose: Option<String>,
    pub trust_level: Option<i16>,
    pub persona: Option<BotPersona>,
    pub caps: Option<BotCaps>,
}

impl UpdateBotRequest {
    pub fn apply_to(self, mut bot: Bot) -> Bot {
        if let Some(display_name) = self.display_name {
            bot.display_name = display_name;
        }
        if let Some(purpose) = self.purpose {
            bot.purpose = purpose;
        }
        if let Some(trust_level) = self.trust_level {
            bot.trust_level = trust_level;
        }
        if let Some(persona) = self.persona {
            bot.persona = persona;
        }
        if let Some(caps) = self.caps {
            bot.caps = caps;
        }
        bot
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleBotRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub user_id: Uuid,
    pub balance: i64,
    pub available_balance: i64,
    pub pending_balance: i64,
}

impl WalletResponse {
    pub fn from_account(user_id: Uuid, account: &Account) -> Self {
        Self {
            user_id,
            balance: account.balance,
            available_balance: account.available_balance,
            pending_balance: account.pending_balance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_bot_defaults() {
        let bot = CreateBotRequest {
            display_name: "PipHunter".into(),
            purpose: None,
            trust_level: None,
            persona: None,
            caps: None,
        }
        .into_bot();

        assert!(bot.active);
        assert_eq!(bot.trust_level, 0);
        assert_eq!(bot.purpose, "engagement");
        assert_eq!(bot.caps.daily_purchases, 2);
    }

    #[test]
    fn test_update_is_partial() {
        let bot = CreateBotRequest {
            display_name: "PipHunter".into(),
            purpose: None,
            trust_level: Some(3),
            persona: None,
            caps: None,
        }
        .into_bot();

        let updated = UpdateBotRequest {
            display_name: Some("ScalperSue".into()),
            purpose: None,
            trust_level: None,
            persona: None,
            caps: None,
        }
        .apply_to(bot);

        assert_eq!(updated.display_name, "ScalperSue");
        assert_eq!(updated.trust_level, 3);
    }
}
