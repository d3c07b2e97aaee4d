// Runtime settings: defaults, optional config/perpbot.toml, PERPBOT__* env vars
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::exit::{ExitCondition, ExitConditionChain, IndicatorRule};
use crate::indicators::IndicatorEngine;
use crate::models::{Direction, Timeframe};
use crate::risk::{LiquidationRiskModel, DEFAULT_SAFETY_MARGIN};

pub const DEFAULT_CONFIG_FILE: &str = "config/perpbot";
const ENV_PREFIX: &str = "PERPBOT";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Redis cache; the in-memory store is used when unset
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Binance futures REST base; synthetic market data is used when unset
    #[serde(default)]
    pub market_data_base_url: Option<String>,
    pub fetch_timeout_secs: u64,
    pub candle_window: usize,
    pub eval_interval_secs: u64,
    pub safety_margin_percent: f64,
    pub trailing_percent: f64,
    pub synthetic_seed: u64,
    pub synthetic_scenario: String,
    pub synthetic_base_price: f64,
    #[serde(default = "default_bots")]
    pub bots: Vec<BotSettings>,
}

/// One (symbol, direction) position watched by its own loop
#[derive(Debug, Clone, Deserialize)]
pub struct BotSettings {
    pub symbol: String,
    pub direction: Direction,
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    pub quantity: f64,
    pub leverage: f64,
    #[serde(default)]
    pub rsi: Option<RsiSettings>,
    #[serde(default)]
    pub macd_cross: bool,
    #[serde(default)]
    pub bollinger: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RsiSettings {
    pub overbought: f64,
    pub oversold: f64,
}

fn default_timeframe() -> Timeframe {
    Timeframe::H1
}

fn default_bots() -> Vec<BotSettings> {
    vec![BotSettings {
        symbol: "BTCUSDT".to_string(),
        direction: Direction::Long,
        timeframe: default_timeframe(),
        quantity: 0.01,
        leverage: 10.0,
        rsi: Some(RsiSettings {
            overbought: 70.0,
            oversold: 30.0,
        }),
        macd_cross: false,
        bollinger: false,
    }]
}

impl Settings {
    /// Load from `config/perpbot.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load with an explicit config file; a missing file is not an error
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("fetch_timeout_secs", 10)?
            .set_default("candle_window", 100)?
            .set_default("eval_interval_secs", 60)?
            .set_default("safety_margin_percent", DEFAULT_SAFETY_MARGIN)?
            .set_default("trailing_percent", 0.01)?
            .set_default("synthetic_seed", 42)?
            .set_default("synthetic_scenario", "sideways")?
            .set_default("synthetic_base_price", 50_000.0)?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        LiquidationRiskModel::new(self.safety_margin_percent)
            .context("safety_margin_percent out of range")?;

        let trailing = self.trailing_percent;
        if trailing.is_nan() || trailing <= 0.0 || trailing >= 1.0 {
            anyhow::bail!("trailing_percent must be in (0, 1), got {}", trailing);
        }
        if self.eval_interval_secs == 0 {
            anyhow::bail!("eval_interval_secs must be positive");
        }

        let required = IndicatorEngine::default().required_lookback();
        if self.candle_window < required {
            anyhow::bail!(
                "candle_window {} is shorter than the {} candles the indicators need",
                self.candle_window,
                required
            );
        }

        for bot in &self.bots {
            if bot.quantity.is_nan() || bot.quantity <= 0.0 {
                anyhow::bail!("bot {} {}: quantity must be positive", bot.symbol, bot.direction);
            }
        }
        Ok(())
    }
}

impl BotSettings {
    /// Exit chain in evaluation order: liquidation, trailing stop, indicators
    pub fn exit_chain(&self, risk: LiquidationRiskModel) -> ExitConditionChain {
        let mut chain = ExitConditionChain::new()
            .with(ExitCondition::LiquidationRisk(risk))
            .with(ExitCondition::TrailingStop);

        if let Some(rsi) = self.rsi {
            chain.push(ExitCondition::IndicatorThreshold(IndicatorRule::Rsi {
                overbought: rsi.overbought,
                oversold: rsi.oversold,
            }));
        }
        if self.macd_cross {
            chain.push(ExitCondition::IndicatorThreshold(IndicatorRule::MacdCross));
        }
        if self.bollinger {
            chain.push(ExitCondition::IndicatorThreshold(IndicatorRule::BollingerBand));
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("perpbot-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::load_from(Path::new("does/not/exist.toml")).unwrap();

        assert_eq!(settings.candle_window, 100);
        assert_eq!(settings.safety_margin_percent, 0.05);
        assert_eq!(settings.bots.len(), 1);
        assert_eq!(settings.bots[0].symbol, "BTCUSDT");
    }

    #[test]
    fn test_file_overrides_and_bots() {
        let path = write_config(
            r#"
            redis_url = "redis://127.0.0.1:6379"
            candle_window = 200
            safety_margin_percent = 0.1

            [[bots]]
            symbol = "ETHUSDT"
            direction = "short"
            timeframe = "15m"
            quantity = 1.5
            leverage = 5.0
            macd_cross = true
            "#,
        );

        let settings = Settings::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(settings.candle_window, 200);
        assert_eq!(settings.eval_interval_secs, 60);

        let bot = &settings.bots[0];
        assert_eq!(bot.direction, Direction::Short);
        assert_eq!(bot.timeframe, Timeframe::M15);
        assert!(bot.rsi.is_none());

        // liquidation + trailing stop + macd cross
        assert_eq!(bot.exit_chain(LiquidationRiskModel::default()).len(), 3);
    }

    #[test]
    fn test_rejects_window_shorter_than_lookback() {
        let path = write_config("candle_window = 20\n");
        let result = Settings::load_from(&path);
        std::fs::remove_file(&path).ok();

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("candle_window 20"), "{}", message);

        let path = write_config("candle_window = 34\n");
        let result = Settings::load_from(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_ok());
    }

    #[test]
    fn test_rejects_bad_safety_margin() {
        let path = write_config("safety_margin_percent = 1.5\n");
        let result = Settings::load_from(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
