use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Minutes between engagement cycles
    pub cycle_minutes: u64,
    /// UTC hours inside which engagement cycles fire
    pub active_start_hour: u32,
    pub active_end_hour: u32,
    /// UTC hour for the daily refund sweep
    pub sweep_hour: u32,
    /// How far back content/listing scans look, in minutes
    pub scan_lookback_minutes: i64,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/coin_engine".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            cycle_minutes: env_parse("ENGINE_CYCLE_MINUTES", 10)?,
            active_start_hour: env_parse("ENGINE_ACTIVE_START_HOUR", 6)?,
            active_end_hour: env_parse("ENGINE_ACTIVE_END_HOUR", 23)?,
            sweep_hour: env_parse("ENGINE_SWEEP_HOUR", 2)?,
            scan_lookback_minutes: env_parse("ENGINE_SCAN_LOOKBACK_MINUTES", 30)?,
        };

        if config.cycle_minutes == 0 {
            return Err(AppError::Config(
                "ENGINE_CYCLE_MINUTES must be at least 1".to_string(),
            ));
        }
        for (name, hour) in [
            ("ENGINE_ACTIVE_START_HOUR", config.active_start_hour),
            ("ENGINE_ACTIVE_END_HOUR", config.active_end_hour),
            ("ENGINE_SWEEP_HOUR", config.sweep_hour),
        ] {
            if hour > 23 {
                return Err(AppError::Config(format!("{} must be 0-23", name)));
            }
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default() {
        assert_eq!(env_parse::<u32>("NO_SUCH_VAR_SET", 7).unwrap(), 7);
    }
}
