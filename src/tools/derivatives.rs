// =============================================================================
// derivatives_data tool
// =============================================================================
//
// Returns a `DerivativesSnapshot`. Consults the `MarketCache`'s funding
// entry first (populated by `MarketDataScheduler` as a fully-formed
// snapshot); on a miss, assembles one fresh from the exchange's funding and
// open-interest endpoints without writing it back to the cache.
// =============================================================================

use anyhow::Result;
use chrono::Utc;

use crate::domain::DerivativesSnapshot;
use crate::exchange::ExchangeClient;
use crate::market_cache::{cache_key, CacheKind, MarketCache};

pub async fn fetch_derivatives_data(
    cache: &MarketCache,
    exchange: &dyn ExchangeClient,
    symbol: &str,
) -> Result<serde_json::Value> {
    let key = cache_key(symbol, CacheKind::Funding, None);
    if let Some(value) = cache.get_json(&key) {
        if let Ok(snapshot) = serde_json::from_value::<DerivativesSnapshot>(value) {
            return Ok(serde_json::to_value(snapshot)?);
        }
    }

    let funding = exchange.get_funding(symbol).await?;
    let mut snapshot = DerivativesSnapshot::from_funding_rate(funding.funding_rate, Utc::now());
    snapshot.predicted_funding_rate = funding.predicted_funding_rate;
    snapshot.next_funding_time = funding.next_funding_time;
    snapshot.mark_price = funding.mark_price;

    if let Ok(oi) = exchange.get_open_interest(symbol).await {
        snapshot.open_interest_usd = oi.open_interest_usd;
        snapshot.open_interest_contracts = oi.open_interest_contracts;
        snapshot.open_interest_timestamp = oi.timestamp;
    }

    Ok(serde_json::to_value(snapshot)?)
}
