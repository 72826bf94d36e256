// =============================================================================
// OKX REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry OK-ACCESS-KEY / OK-ACCESS-SIGN / OK-ACCESS-TIMESTAMP /
// OK-ACCESS-PASSPHRASE headers; demo (paper) mode additionally sends
// `x-simulated-trading: 1`, routing orders to OKX's simulated venue with
// the same wire format as live.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::domain::Candle;
use crate::exchange::{
    AccountBalance, BoxFuture, ExchangeClient, FundingInfo, OpenInterestInfo, OrderBook,
    OrderBookLevel, OrderResult, OrderSide, Ticker, TradeRecord,
};

type HmacSha256 = Hmac<Sha256>;

/// OKX REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    demo_mode: bool,
    client: reqwest::Client,
}

impl OkxClient {
    /// Create a new `OkxClient`.
    ///
    /// `demo_mode` routes every signed request to OKX's simulated-trading
    /// venue via the `x-simulated-trading` header — the wire format and
    /// endpoints are otherwise identical to live trading.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        base_url: impl Into<String>,
        demo_mode: bool,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(demo_mode, "OkxClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: base_url.into(),
            demo_mode,
            client,
        }
    }

    fn iso_timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Base64-encoded HMAC-SHA256 signature of `timestamp + method + path + body`.
    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, mac.finalize().into_bytes())
    }

    fn signed_headers(&self, method: &str, path: &str, body: &str) -> HeaderMap {
        let timestamp = Self::iso_timestamp();
        let signature = self.sign(&timestamp, method, path, body);

        let mut headers = HeaderMap::new();
        headers.insert("OK-ACCESS-KEY", HeaderValue::from_str(&self.api_key).unwrap());
        headers.insert("OK-ACCESS-SIGN", HeaderValue::from_str(&signature).unwrap());
        headers.insert("OK-ACCESS-TIMESTAMP", HeaderValue::from_str(&timestamp).unwrap());
        headers.insert(
            "OK-ACCESS-PASSPHRASE",
            HeaderValue::from_str(&self.passphrase).unwrap(),
        );
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        if self.demo_mode {
            headers.insert("x-simulated-trading", HeaderValue::from_static("1"));
        }
        headers
    }

    fn parse_f64(v: &serde_json::Value) -> f64 {
        v.as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0)
    }

    #[instrument(skip(self), name = "okx::get_ticker")]
    async fn get_ticker_inner(&self, symbol: &str) -> Result<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={symbol}");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/market/ticker request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse ticker response")?;
        let entry = body["data"]
            .get(0)
            .context("OKX ticker response missing data[0]")?;

        Ok(Ticker {
            price: Self::parse_f64(&entry["last"]),
            change_pct_24h: {
                let open24h = Self::parse_f64(&entry["open24h"]);
                let last = Self::parse_f64(&entry["last"]);
                if open24h == 0.0 {
                    0.0
                } else {
                    (last - open24h) / open24h * 100.0
                }
            },
            volume_24h: Self::parse_f64(&entry["vol24h"]),
            high_24h: Self::parse_f64(&entry["high24h"]),
            low_24h: Self::parse_f64(&entry["low24h"]),
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "okx::get_orderbook")]
    async fn get_orderbook_inner(&self, symbol: &str, depth: u32) -> Result<OrderBook> {
        let path = format!("/api/v5/market/books?instId={symbol}&sz={depth}");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/market/books request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse orderbook response")?;
        let entry = body["data"]
            .get(0)
            .context("OKX orderbook response missing data[0]")?;

        let parse_levels = |levels: &serde_json::Value| -> Vec<OrderBookLevel> {
            levels
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|lvl| {
                            let lvl = lvl.as_array()?;
                            Some(OrderBookLevel {
                                price: lvl.first().map(Self::parse_f64).unwrap_or(0.0),
                                quantity: lvl.get(1).map(Self::parse_f64).unwrap_or(0.0),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBook {
            bids: parse_levels(&entry["bids"]),
            asks: parse_levels(&entry["asks"]),
            timestamp: Utc::now(),
        })
    }

    #[instrument(skip(self), name = "okx::get_funding")]
    async fn get_funding_inner(&self, symbol: &str) -> Result<FundingInfo> {
        let path = format!("/api/v5/public/funding-rate?instId={symbol}");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/public/funding-rate request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse funding response")?;
        let entry = body["data"]
            .get(0)
            .context("OKX funding response missing data[0]")?;

        let next_funding_time = entry["nextFundingTime"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| DateTime::from_timestamp_millis(ms));

        Ok(FundingInfo {
            funding_rate: Self::parse_f64(&entry["fundingRate"]),
            predicted_funding_rate: entry
                .get("nextFundingRate")
                .map(Self::parse_f64)
                .filter(|v| *v != 0.0),
            next_funding_time,
            mark_price: None,
        })
    }

    #[instrument(skip(self), name = "okx::get_open_interest")]
    async fn get_open_interest_inner(&self, symbol: &str) -> Result<OpenInterestInfo> {
        let path = format!("/api/v5/public/open-interest?instId={symbol}");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/public/open-interest request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse OI response")?;
        let entry = match body["data"].get(0) {
            Some(e) => e,
            None => {
                warn!(symbol, "no open-interest data returned");
                return Ok(OpenInterestInfo {
                    open_interest_usd: None,
                    open_interest_contracts: None,
                    timestamp: None,
                });
            }
        };

        let timestamp = entry["ts"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| DateTime::from_timestamp_millis(ms));

        Ok(OpenInterestInfo {
            open_interest_usd: Some(Self::parse_f64(&entry["oiCcy"])),
            open_interest_contracts: Some(Self::parse_f64(&entry["oi"])),
            timestamp,
        })
    }

    #[instrument(skip(self), name = "okx::get_ohlcv")]
    async fn get_ohlcv_inner(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = format!("/api/v5/market/candles?instId={symbol}&bar={timeframe}&limit={limit}");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v5/market/candles request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse candles response")?;
        let raw = body["data"].as_array().context("candles response missing data array")?;

        // OKX returns newest-first; the core expects oldest-first.
        let mut candles: Vec<Candle> = raw
            .iter()
            .filter_map(|entry| {
                let arr = entry.as_array()?;
                if arr.len() < 6 {
                    return None;
                }
                let ts_ms: i64 = arr[0].as_str()?.parse().ok()?;
                Some(Candle {
                    timestamp: DateTime::from_timestamp_millis(ts_ms)?,
                    open: arr[1].as_str()?.parse().ok()?,
                    high: arr[2].as_str()?.parse().ok()?,
                    low: arr[3].as_str()?.parse().ok()?,
                    close: arr[4].as_str()?.parse().ok()?,
                    volume: arr[5].as_str()?.parse().ok()?,
                })
            })
            .collect();
        candles.reverse();

        debug!(symbol, timeframe, count = candles.len(), "ohlcv fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "okx::place_order")]
    async fn place_order_inner(&self, symbol: &str, side: OrderSide, amount: f64) -> Result<OrderResult> {
        let path = "/api/v5/trade/order";
        let body = serde_json::json!({
            "instId": symbol,
            "tdMode": "cross",
            "side": side.as_str(),
            "ordType": "market",
            "sz": amount.to_string(),
        })
        .to_string();

        let headers = self.signed_headers("POST", path, &body);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .context("POST /api/v5/trade/order request failed")?;

        let parsed: serde_json::Value = resp.json().await.context("failed to parse order response")?;
        let entry = parsed["data"].get(0);

        let order_id = entry
            .and_then(|e| e["ordId"].as_str())
            .unwrap_or("")
            .to_string();
        let status = entry
            .and_then(|e| e["sCode"].as_str())
            .map(|code| if code == "0" { "filled" } else { "rejected" })
            .unwrap_or("error")
            .to_string();

        debug!(symbol, order_id, status, "order placed");
        Ok(OrderResult { order_id, status })
    }

    #[instrument(skip(self), name = "okx::get_recent_trades")]
    async fn get_recent_trades_inner(&self, symbol: &str, limit: u32) -> Result<Vec<TradeRecord>> {
        let path = "/api/v5/trade/fills";
        let query = format!("?instId={symbol}&limit={limit}");
        let headers = self.signed_headers("GET", &format!("{path}{query}"), "");
        let url = format!("{}{}{}", self.base_url, path, query);

        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .context("GET /api/v5/trade/fills request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse fills response")?;
        let raw = body["data"].as_array().cloned().unwrap_or_default();

        let trades = raw
            .iter()
            .filter_map(|entry| {
                let ts_ms: i64 = entry["ts"].as_str()?.parse().ok()?;
                Some(TradeRecord {
                    symbol: symbol.to_string(),
                    side: entry["side"].as_str().unwrap_or("").to_string(),
                    price: Self::parse_f64(&entry["fillPx"]),
                    quantity: Self::parse_f64(&entry["fillSz"]),
                    timestamp: DateTime::from_timestamp_millis(ts_ms)?,
                })
            })
            .collect();
        Ok(trades)
    }

    #[instrument(skip(self), name = "okx::get_balance")]
    async fn get_balance_inner(&self) -> Result<AccountBalance> {
        let path = "/api/v5/account/balance";
        let headers = self.signed_headers("GET", path, "");
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .context("GET /api/v5/account/balance request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse balance response")?;
        let entry = body["data"].get(0).context("balance response missing data[0]")?;

        let free_usdt = entry["details"]
            .as_array()
            .and_then(|details| {
                details
                    .iter()
                    .find(|d| d["ccy"].as_str() == Some("USDT"))
                    .map(|d| Self::parse_f64(&d["availBal"]))
            })
            .unwrap_or(0.0);
        let equity_usdt = Self::parse_f64(&entry["totalEq"]);

        Ok(AccountBalance { free_usdt, equity_usdt })
    }
}

impl ExchangeClient for OkxClient {
    fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<Ticker>> {
        Box::pin(self.get_ticker_inner(symbol))
    }

    fn get_orderbook<'a>(&'a self, symbol: &'a str, depth: u32) -> BoxFuture<'a, Result<OrderBook>> {
        Box::pin(self.get_orderbook_inner(symbol, depth))
    }

    fn get_funding<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<FundingInfo>> {
        Box::pin(self.get_funding_inner(symbol))
    }

    fn get_open_interest<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, Result<OpenInterestInfo>> {
        Box::pin(self.get_open_interest_inner(symbol))
    }

    fn get_ohlcv<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: &'a str,
        limit: u32,
    ) -> BoxFuture<'a, Result<Vec<Candle>>> {
        Box::pin(self.get_ohlcv_inner(symbol, timeframe, limit))
    }

    fn place_order<'a>(&'a self, symbol: &'a str, side: OrderSide, amount: f64) -> BoxFuture<'a, Result<OrderResult>> {
        Box::pin(self.place_order_inner(symbol, side, amount))
    }

    fn get_recent_trades<'a>(&'a self, symbol: &'a str, limit: u32) -> BoxFuture<'a, Result<Vec<TradeRecord>>> {
        Box::pin(self.get_recent_trades_inner(symbol, limit))
    }

    fn get_balance<'a>(&'a self) -> BoxFuture<'a, Result<AccountBalance>> {
        Box::pin(self.get_balance_inner())
    }
}
