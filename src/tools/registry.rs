// =============================================================================
// ToolRegistry — LLM-facing tools and symbol resolution
// =============================================================================
//
// Exposes the three tools named in §4.4 to the agent loop, dispatching by
// name and memoizing each result in the caller-supplied per-run `ToolCache`.
// Also owns symbol resolution: the LLM may refer to a symbol in base,
// dash, slash, or colon-suffixed-futures form, and all of them must resolve
// to the same configured canonical symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::domain::{normalize_symbol, Symbol};
use crate::error::AppError;
use crate::exchange::ExchangeClient;
use crate::market_cache::MarketCache;
use crate::tools::cache::ToolCache;
use crate::tools::{derivatives, indicator_tool, live_market};

/// The three tool names exposed to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    LiveMarketData,
    IndicatorCalculator,
    DerivativesData,
}

impl ToolName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LiveMarketData => "live_market_data",
            Self::IndicatorCalculator => "indicator_calculator",
            Self::DerivativesData => "derivatives_data",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "live_market_data" => Some(Self::LiveMarketData),
            "indicator_calculator" => Some(Self::IndicatorCalculator),
            "derivatives_data" => Some(Self::DerivativesData),
            _ => None,
        }
    }

    pub const ALL: [ToolName; 3] = [Self::LiveMarketData, Self::IndicatorCalculator, Self::DerivativesData];

    fn description(self) -> &'static str {
        match self {
            Self::LiveMarketData => "Fetch the latest price and recent OHLCV candles for a symbol.",
            Self::IndicatorCalculator => "Compute technical indicators (EMA, MACD, RSI, ATR, volatility) for a symbol.",
            Self::DerivativesData => "Fetch funding rate and open interest for a perpetual swap symbol.",
        }
    }
}

/// JSON-schema-shaped tool definition, provider-agnostic (consumed by
/// `llm::chat` to build whatever wire format the configured LLM expects).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Maps every accepted spelling of a configured symbol back to its
/// canonical form. Built once from the engine's configured symbol list.
pub struct SymbolResolver {
    aliases: HashMap<String, Symbol>,
}

impl SymbolResolver {
    pub fn new(configured_symbols: &[String]) -> Self {
        let mut aliases = HashMap::new();
        for raw in configured_symbols {
            let canonical = normalize_symbol(raw);
            for alias in Self::derive_aliases(&canonical) {
                aliases.insert(alias, canonical.clone());
            }
        }
        Self { aliases }
    }

    /// Base (`BTC`), dash-form (`BTC-USDT`), slash-form (`BTC/USDT`), and
    /// colon-suffixed-futures (`BTC/USDT:USDT`) spellings of one canonical
    /// `BASE-QUOTE-SWAP`-shaped symbol.
    fn derive_aliases(canonical: &str) -> Vec<String> {
        let mut out = vec![canonical.to_string()];
        let parts: Vec<&str> = canonical.split('-').collect();
        if let Some(&base) = parts.first() {
            out.push(base.to_string());
            if let Some(&quote) = parts.get(1) {
                out.push(format!("{base}-{quote}"));
                out.push(format!("{base}/{quote}"));
                out.push(format!("{base}/{quote}:{quote}"));
            }
        }
        out
    }

    /// Resolve any accepted spelling to the canonical configured symbol.
    pub fn resolve(&self, raw: &str) -> Result<Symbol, AppError> {
        let normalized = normalize_symbol(raw);
        self.aliases
            .get(&normalized)
            .cloned()
            .ok_or_else(|| AppError::validation(format!("no symbol mapping for '{raw}'")))
    }
}

pub struct ToolRegistry {
    cache: Arc<MarketCache>,
    exchange: Arc<dyn ExchangeClient>,
    resolver: SymbolResolver,
    short_timeframe: String,
    long_timeframe: String,
}

impl ToolRegistry {
    pub fn new(
        cache: Arc<MarketCache>,
        exchange: Arc<dyn ExchangeClient>,
        configured_symbols: &[String],
        short_timeframe: impl Into<String>,
        long_timeframe: impl Into<String>,
    ) -> Self {
        Self {
            resolver: SymbolResolver::new(configured_symbols),
            cache,
            exchange,
            short_timeframe: short_timeframe.into(),
            long_timeframe: long_timeframe.into(),
        }
    }

    /// Tool specs to hand to `llm::chat` so the LLM knows what it can call.
    pub fn specs(&self) -> Vec<ToolSpec> {
        ToolName::ALL
            .iter()
            .map(|tool| ToolSpec {
                name: tool.as_str().to_string(),
                description: tool.description().to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "symbol": { "type": "string", "description": "Trading symbol, any accepted spelling." }
                    },
                    "required": ["symbol"],
                }),
            })
            .collect()
    }

    /// Resolve `args.symbol`, dispatch to the named tool, and memoize the
    /// result in `tool_cache` under `<tool>:<symbol>`.
    pub async fn call(
        &self,
        tool_cache: &ToolCache,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let tool = ToolName::parse(name).ok_or_else(|| AppError::validation(format!("unknown tool '{name}'")))?;

        let raw_symbol = args
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::validation("tool call missing required 'symbol' argument"))?;
        let symbol = self.resolver.resolve(raw_symbol)?;

        let cache_key = format!("{}:{symbol}", tool.as_str());
        if let Some(cached) = tool_cache.get(&cache_key) {
            return Ok(cached);
        }

        let result = match tool {
            ToolName::LiveMarketData => live_market::fetch_live_market_data(
                &self.cache,
                self.exchange.as_ref(),
                &symbol,
                &self.short_timeframe,
                &self.long_timeframe,
            )
            .await
            .map_err(|e| AppError::transient(e.to_string()))?,
            ToolName::IndicatorCalculator => indicator_tool::fetch_indicator_snapshot(
                &self.cache,
                self.exchange.as_ref(),
                &symbol,
                &self.short_timeframe,
                &self.long_timeframe,
            )
            .await
            .map_err(|e| AppError::transient(e.to_string()))?,
            ToolName::DerivativesData => derivatives::fetch_derivatives_data(&self.cache, self.exchange.as_ref(), &symbol)
                .await
                .map_err(|e| AppError::transient(e.to_string()))?,
        };

        tool_cache.put(&cache_key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::new(&["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()])
    }

    #[test]
    fn resolves_base_form() {
        assert_eq!(resolver().resolve("btc").unwrap(), "BTC-USDT-SWAP");
    }

    #[test]
    fn resolves_dash_form_without_swap_suffix() {
        assert_eq!(resolver().resolve("BTC-USDT").unwrap(), "BTC-USDT-SWAP");
    }

    #[test]
    fn resolves_slash_form() {
        assert_eq!(resolver().resolve("BTC/USDT").unwrap(), "BTC-USDT-SWAP");
    }

    #[test]
    fn resolves_colon_suffixed_futures_form() {
        assert_eq!(resolver().resolve("eth/usdt:usdt").unwrap(), "ETH-USDT-SWAP");
    }

    #[test]
    fn unmapped_symbol_is_a_validation_error() {
        let err = resolver().resolve("SOL-USDT-SWAP").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn tool_name_round_trips_through_parse() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("not_a_tool"), None);
    }

    #[tokio::test]
    async fn call_rejects_unmapped_symbol() {
        use crate::exchange::okx::OkxClient;

        let registry = ToolRegistry::new(
            Arc::new(MarketCache::new(500, std::time::Duration::from_secs(3600))),
            Arc::new(OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true)),
            &["BTC-USDT-SWAP".to_string()],
            "15m",
            "1h",
        );
        let tool_cache = ToolCache::new();
        let err = registry
            .call(&tool_cache, "live_market_data", &json!({"symbol": "DOGE"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn call_rejects_unknown_tool_name() {
        use crate::exchange::okx::OkxClient;

        let registry = ToolRegistry::new(
            Arc::new(MarketCache::new(500, std::time::Duration::from_secs(3600))),
            Arc::new(OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true)),
            &["BTC-USDT-SWAP".to_string()],
            "15m",
            "1h",
        );
        let tool_cache = ToolCache::new();
        let err = registry
            .call(&tool_cache, "nonexistent_tool", &json!({"symbol": "BTC"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
