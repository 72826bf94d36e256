// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Holds every tunable the engine may need to change without a restart:
// the active RuntimeMode, the symbol list, scheduler cadences, and broker
// sizing parameters. Persistence uses an atomic tmp + rename pattern to
// prevent corruption on crash. All fields carry `#[serde(default)]` so
// adding a field never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::RuntimeMode;

fn default_symbols() -> Vec<String> {
    vec![
        "BTC-USDT-SWAP".to_string(),
        "ETH-USDT-SWAP".to_string(),
        "SOL-USDT-SWAP".to_string(),
    ]
}

fn default_decision_interval_minutes() -> u64 {
    3
}

fn default_market_data_interval_seconds() -> u64 {
    5
}

fn default_position_size_limit_pct() -> f64 {
    50.0
}

fn default_max_slippage_bps() -> f64 {
    5.0
}

fn default_starting_cash() -> f64 {
    10_000.0
}

fn default_max_rules_in_prompt() -> usize {
    8
}

fn default_max_history_trades() -> usize {
    5
}

fn default_stale_threshold_seconds() -> i64 {
    30
}

fn default_max_tool_iterations() -> u32 {
    8
}

fn default_confidence_entry_threshold() -> f64 {
    0.6
}

fn default_max_gross_exposure_pct() -> f64 {
    80.0
}

fn default_min_cash_buffer_pct() -> f64 {
    15.0
}

/// Top-level runtime configuration for the autotrade engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current broker selection: simulator, paper, or live.
    #[serde(default)]
    pub runtime_mode: RuntimeMode,

    /// Symbols the engine watches and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// DecisionScheduler tick cadence.
    #[serde(default = "default_decision_interval_minutes")]
    pub decision_interval_minutes: u64,

    /// MarketDataScheduler tick cadence.
    #[serde(default = "default_market_data_interval_seconds")]
    pub market_data_interval_seconds: u64,

    /// Cap on a single BUY's notional as a percentage of equity.
    #[serde(default = "default_position_size_limit_pct")]
    pub position_size_limit_pct: f64,

    /// Default max slippage applied when a decision doesn't specify one.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,

    /// Starting cash for a freshly created simulator portfolio.
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,

    /// Top-K active learned rules surfaced in the prompt.
    #[serde(default = "default_max_rules_in_prompt")]
    pub max_rules_in_prompt: usize,

    /// Last-K trade outcomes surfaced in the prompt.
    #[serde(default = "default_max_history_trades")]
    pub max_history_trades: usize,

    /// Age beyond which a cached ticker is treated as stale.
    #[serde(default = "default_stale_threshold_seconds")]
    pub stale_threshold_seconds: i64,

    /// Per-run bound on the LLM agent's tool-calling loop.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Minimum decision confidence surfaced to the LLM as an entry gate.
    /// Read-only in the prompt; not enforced by the broker.
    #[serde(default = "default_confidence_entry_threshold")]
    pub confidence_entry_threshold: f64,

    /// Maximum total notional exposure as a percentage of equity, surfaced
    /// in the prompt as a read-only risk setting.
    #[serde(default = "default_max_gross_exposure_pct")]
    pub max_gross_exposure_pct: f64,

    /// Minimum cash the portfolio should keep uncommitted, surfaced in the
    /// prompt as a read-only risk setting.
    #[serde(default = "default_min_cash_buffer_pct")]
    pub min_cash_buffer_pct: f64,

    /// Path to append one line of JSON per decision run, if configured.
    #[serde(default)]
    pub decision_trace_log_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_mode: RuntimeMode::default(),
            symbols: default_symbols(),
            decision_interval_minutes: default_decision_interval_minutes(),
            market_data_interval_seconds: default_market_data_interval_seconds(),
            position_size_limit_pct: default_position_size_limit_pct(),
            max_slippage_bps: default_max_slippage_bps(),
            starting_cash: default_starting_cash(),
            max_rules_in_prompt: default_max_rules_in_prompt(),
            max_history_trades: default_max_history_trades(),
            stale_threshold_seconds: default_stale_threshold_seconds(),
            max_tool_iterations: default_max_tool_iterations(),
            confidence_entry_threshold: default_confidence_entry_threshold(),
            max_gross_exposure_pct: default_max_gross_exposure_pct(),
            min_cash_buffer_pct: default_min_cash_buffer_pct(),
            decision_trace_log_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            runtime_mode = %config.runtime_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.runtime_mode, RuntimeMode::Simulator);
        assert_eq!(cfg.symbols.len(), 3);
        assert_eq!(cfg.decision_interval_minutes, 3);
        assert_eq!(cfg.market_data_interval_seconds, 5);
        assert!((cfg.position_size_limit_pct - 50.0).abs() < f64::EPSILON);
        assert!((cfg.starting_cash - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_rules_in_prompt, 8);
        assert_eq!(cfg.max_history_trades, 5);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.runtime_mode, RuntimeMode::Simulator);
        assert_eq!(cfg.max_tool_iterations, 8);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "runtime_mode": "paper", "symbols": ["ETH-USDT-SWAP"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.runtime_mode, RuntimeMode::Paper);
        assert_eq!(cfg.symbols, vec!["ETH-USDT-SWAP"]);
        assert_eq!(cfg.max_rules_in_prompt, 8);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.runtime_mode, cfg2.runtime_mode);
        assert_eq!(cfg.decision_interval_minutes, cfg2.decision_interval_minutes);
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("autotrade-rc-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.runtime_mode = RuntimeMode::Paper;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.runtime_mode, RuntimeMode::Paper);

        std::fs::remove_dir_all(&dir).ok();
    }
}
