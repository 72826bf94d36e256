// =============================================================================
// ExchangeClient contract
// =============================================================================
//
// The wire format of any particular venue (OKX's REST/CCXT-shaped JSON) is
// abstracted behind this trait so the broker, market-data scheduler, and
// tools never depend on it directly. Native `async fn` in traits is not
// object-safe, and neither `async-trait` nor any trait-object executor crate
// is part of this crate's dependency set, so object safety is obtained the
// same way the ecosystem did before RPITIT landed: methods return a boxed,
// pinned future by hand. Callers that only need static dispatch can ignore
// the boxing entirely and call the inherent async methods on a concrete
// client directly.
// =============================================================================

pub mod okx;

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Candle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub price: f64,
    pub change_pct_24h: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// Top-of-book mid price, or `None` if either side is empty.
    pub fn mid_price(&self) -> Option<f64> {
        let best_bid = self.bids.first()?.price;
        let best_ask = self.asks.first()?.price;
        Some((best_bid + best_ask) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingInfo {
    pub funding_rate: f64,
    #[serde(default)]
    pub predicted_funding_rate: Option<f64>,
    #[serde(default)]
    pub next_funding_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mark_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestInfo {
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
    #[serde(default)]
    pub open_interest_contracts: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: String,
}

impl OrderResult {
    /// An order is accepted iff it has a non-empty id and its status is not
    /// one of the terminal-failure states.
    pub fn is_accepted(&self) -> bool {
        const REJECTED: &[&str] = &["canceled", "cancelled", "rejected", "error"];
        !self.order_id.is_empty() && !REJECTED.contains(&self.status.to_ascii_lowercase().as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub free_usdt: f64,
    pub equity_usdt: f64,
}

/// Uniform market-data + order-routing contract for one exchange venue.
pub trait ExchangeClient: Send + Sync {
    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Ticker>>;

    fn get_orderbook<'a>(&'a self, symbol: &'a str, depth: u32) -> BoxFuture<'a, Result<OrderBook>>;

    fn get_funding<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<FundingInfo>>;

    fn get_open_interest<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<OpenInterestInfo>>;

    fn get_ohlcv<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<Candle>>>;

    fn place_order<'a>(
        &'a self,
        symbol: &'a str,
        side: OrderSide,
        amount: f64,
    ) -> BoxFuture<'a, Result<OrderResult>>;

    fn get_recent_trades<'a>(&'a self, symbol: &'a str, limit: u32) -> BoxFuture<'a, Result<Vec<TradeRecord>>>;

    fn get_balance<'a>(&'a self) -> BoxFuture<'a, Result<AccountBalance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_result_accepted_requires_nonempty_id() {
        let ok = OrderResult {
            order_id: "1".into(),
            status: "filled".into(),
        };
        assert!(ok.is_accepted());

        let empty_id = OrderResult {
            order_id: "".into(),
            status: "filled".into(),
        };
        assert!(!empty_id.is_accepted());
    }

    #[test]
    fn order_result_rejected_statuses_are_case_insensitive() {
        for status in ["canceled", "CANCELLED", "Rejected", "ERROR"] {
            let r = OrderResult {
                order_id: "1".into(),
                status: status.into(),
            };
            assert!(!r.is_accepted(), "{status} should not be accepted");
        }
    }

    #[test]
    fn orderbook_mid_price_averages_best_levels() {
        let book = OrderBook {
            bids: vec![OrderBookLevel { price: 99.0, quantity: 1.0 }],
            asks: vec![OrderBookLevel { price: 101.0, quantity: 1.0 }],
            timestamp: Utc::now(),
        };
        assert_eq!(book.mid_price(), Some(100.0));
    }

    #[test]
    fn orderbook_mid_price_none_when_empty_side() {
        let book = OrderBook {
            bids: vec![],
            asks: vec![OrderBookLevel { price: 101.0, quantity: 1.0 }],
            timestamp: Utc::now(),
        };
        assert!(book.mid_price().is_none());
    }
}
