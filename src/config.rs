// =============================================================================
// Settings — process-lifetime configuration read from the environment
// =============================================================================
//
// Reads `std::env::var` directly, gathered into one struct rather than
// scattered across call sites. `Settings` is read once at startup and never
// mutates; hot, runtime-adjustable knobs belong in `RuntimeConfig` (see
// `runtime_config.rs`) behind a `parking_lot::RwLock`.
// =============================================================================

use anyhow::{bail, Result};
use tracing::warn;

use crate::types::RuntimeMode;

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: Option<String>,
    pub redis_url: Option<String>,
    pub deepseek_api_key: Option<String>,

    pub okx_api_key: Option<String>,
    pub okx_secret_key: Option<String>,
    pub okx_passphrase: Option<String>,
    pub okx_demo_mode: bool,
    pub okx_base_url: String,

    pub decision_interval_minutes: u64,
    pub market_data_symbols: Vec<String>,
    pub simulation_state_path: String,
    pub cron_trigger_token: Option<String>,
    pub trading_broker: RuntimeMode,
    pub admin_token: Option<String>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Settings {
    /// Read all `AUTOTRADE_*` variables from the environment and validate
    /// the combinations required by the selected broker.
    pub fn from_env() -> Result<Self> {
        let trading_broker = env_var("AUTOTRADE_TRADING_BROKER")
            .and_then(|v| RuntimeMode::parse(&v))
            .unwrap_or_default();

        let settings = Self {
            db_url: env_var("AUTOTRADE_DB_URL"),
            redis_url: env_var("AUTOTRADE_REDIS_URL"),
            deepseek_api_key: env_var("AUTOTRADE_DEEPSEEK_API_KEY"),

            okx_api_key: env_var("AUTOTRADE_OKX_API_KEY"),
            okx_secret_key: env_var("AUTOTRADE_OKX_SECRET_KEY"),
            okx_passphrase: env_var("AUTOTRADE_OKX_PASSPHRASE"),
            okx_demo_mode: env_var("AUTOTRADE_OKX_DEMO_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            okx_base_url: env_var("AUTOTRADE_OKX_BASE_URL")
                .unwrap_or_else(|| "https://www.okx.com".to_string()),

            decision_interval_minutes: env_var("AUTOTRADE_DECISION_INTERVAL_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            market_data_symbols: env_var("AUTOTRADE_MARKET_DATA_SYMBOLS")
                .map(|v| {
                    v.split(',')
                        .map(|s| crate::domain::normalize_symbol(s.trim()))
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(default_symbols),
            simulation_state_path: env_var("AUTOTRADE_SIMULATION_STATE_PATH")
                .unwrap_or_else(|| "simulation_state.json".to_string()),
            cron_trigger_token: env_var("AUTOTRADE_CRON_TRIGGER_TOKEN"),
            trading_broker,
            admin_token: env_var("AUTOTRADE_ADMIN_TOKEN"),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.trading_broker.uses_exchange() {
            if self.okx_api_key.is_none() || self.okx_secret_key.is_none() || self.okx_passphrase.is_none() {
                bail!(
                    "AUTOTRADE_TRADING_BROKER={} requires AUTOTRADE_OKX_API_KEY, AUTOTRADE_OKX_SECRET_KEY, and AUTOTRADE_OKX_PASSPHRASE",
                    self.trading_broker
                );
            }
        }
        if self.trading_broker == RuntimeMode::Live && self.okx_demo_mode {
            warn!("AUTOTRADE_TRADING_BROKER=live but AUTOTRADE_OKX_DEMO_MODE is not disabled — orders will route to OKX's demo venue");
        }
        if self.decision_interval_minutes == 0 {
            bail!("AUTOTRADE_DECISION_INTERVAL_MINUTES must be >= 1");
        }
        if self.market_data_symbols.is_empty() {
            bail!("AUTOTRADE_MARKET_DATA_SYMBOLS resolved to an empty symbol list");
        }
        Ok(())
    }
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT-SWAP".to_string(),
        "ETH-USDT-SWAP".to_string(),
        "SOL-USDT-SWAP".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes env-mutating tests; `std::env::var` is process-global.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_okx_vars() {
        for key in [
            "AUTOTRADE_TRADING_BROKER",
            "AUTOTRADE_OKX_API_KEY",
            "AUTOTRADE_OKX_SECRET_KEY",
            "AUTOTRADE_OKX_PASSPHRASE",
            "AUTOTRADE_DECISION_INTERVAL_MINUTES",
            "AUTOTRADE_MARKET_DATA_SYMBOLS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_to_simulator_with_default_symbols() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_okx_vars();
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.trading_broker, RuntimeMode::Simulator);
        assert!(!settings.market_data_symbols.is_empty());
        clear_okx_vars();
    }

    #[test]
    fn paper_mode_requires_okx_credentials() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_okx_vars();
        std::env::set_var("AUTOTRADE_TRADING_BROKER", "paper");
        let result = Settings::from_env();
        assert!(result.is_err());
        clear_okx_vars();
    }

    #[test]
    fn paper_mode_succeeds_with_full_credentials() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_okx_vars();
        std::env::set_var("AUTOTRADE_TRADING_BROKER", "paper");
        std::env::set_var("AUTOTRADE_OKX_API_KEY", "k");
        std::env::set_var("AUTOTRADE_OKX_SECRET_KEY", "s");
        std::env::set_var("AUTOTRADE_OKX_PASSPHRASE", "p");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.trading_broker, RuntimeMode::Paper);
        clear_okx_vars();
    }

    #[test]
    fn symbols_are_parsed_and_normalized() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_okx_vars();
        std::env::set_var("AUTOTRADE_MARKET_DATA_SYMBOLS", " btc-usdt-swap, eth-usdt-swap ");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.market_data_symbols, vec!["BTC-USDT-SWAP", "ETH-USDT-SWAP"]);
        clear_okx_vars();
    }
}
