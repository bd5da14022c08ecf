use crate::db::Tables;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

/// Environment variables that override `[investment]` values from the TOML file.
pub const ENV_INVEST_MIN_POINTS: &str = "INVEST_MIN_POINTS";
pub const ENV_INVEST_PAYOUT_MULTIPLIER: &str = "INVEST_PAYOUT_MULTIPLIER";
pub const ENV_INVEST_WINDOW_DAYS: &str = "INVEST_WINDOW_DAYS";

/// Env var naming the config file for `hubd`.
pub const ENV_CONFIG_PATH: &str = "HUBD_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub investment: Investment,
    pub streak: Streak,
    pub settlement: Settlement,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
    #[serde(default)]
    pub tables: Tables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Investment {
    pub min_points: i64,
    pub payout_multiplier: i64,
    pub window_days: i64,
}

impl Default for Investment {
    fn default() -> Self {
        Self {
            min_points: 10,
            payout_multiplier: 2,
            window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Streak {
    pub enabled: bool,
    pub daily_points: i64,
    pub bonus_every_days: u32,
    pub bonus_points: i64,
}

impl Default for Streak {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_points: 5,
            bonus_every_days: 7,
            bonus_points: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settlement {
    pub interval_secs: u64,
    pub batch_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    /// Read `path`, apply `INVEST_*` overrides from the process environment, then validate.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let mut config: Config =
            toml::from_str(&content).context("failed to parse hub config")?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse hub config")?;
        config.validate()?;
        Ok(config)
    }

    /// `HUBD_CONFIG` if set, otherwise `config/default.toml` relative to the cwd.
    pub fn default_path() -> String {
        std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "config/default.toml".to_string())
    }

    /// Apply investment overrides. `lookup` is the environment in production and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides = [
            (ENV_INVEST_MIN_POINTS, &mut self.investment.min_points),
            (
                ENV_INVEST_PAYOUT_MULTIPLIER,
                &mut self.investment.payout_multiplier,
            ),
            (ENV_INVEST_WINDOW_DAYS, &mut self.investment.window_days),
        ];
        for (key, slot) in overrides {
            if let Some(raw) = lookup(key) {
                *slot = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be an integer, got {raw:?}"))?;
                tracing::debug!(key, value = *slot, "config override from environment");
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.investment.min_points >= 1,
            "investment.min_points must be >= 1"
        );
        anyhow::ensure!(
            self.investment.payout_multiplier >= 1,
            "investment.payout_multiplier must be >= 1"
        );
        anyhow::ensure!(
            self.investment.window_days >= 1,
            "investment.window_days must be >= 1"
        );
        anyhow::ensure!(
            self.streak.bonus_every_days >= 1,
            "streak.bonus_every_days must be >= 1"
        );
        anyhow::ensure!(
            self.streak.daily_points >= 0 && self.streak.bonus_points >= 0,
            "streak points must not be negative"
        );
        anyhow::ensure!(
            self.settlement.interval_secs > 0,
            "settlement.interval_secs must be > 0"
        );
        anyhow::ensure!(
            self.settlement.batch_limit > 0,
            "settlement.batch_limit must be > 0"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
