// =============================================================================
// ExchangeBroker — BrokerPort backed by a real venue (§4.8.2)
// =============================================================================
//
// Wraps `ExchangeClient` for paper/live trading: resolves the configured
// symbol, derives an order quantity, submits a market order, and — after a
// SELL/CLOSE — reconstructs realized PnL from the exchange's own recent-trade
// history rather than trusting a locally-tracked entry price (the exchange,
// not this process, is the source of truth for fills). No local `Portfolio`
// is maintained; `get_portfolio_snapshot` always returns `None`, matching
// §4.8's contract that Portfolio ownership belongs to `SimulatedBroker` alone.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::broker::{apply_slippage, BoxFuture, BrokerPort, Decision, ExecutionContext, PendingExit};
use crate::domain::{Portfolio, Symbol};
use crate::exchange::{ExchangeClient, OrderSide};
use crate::feedback::outcome_tracker::OutcomeTracker;
use crate::types::DecisionAction;

/// Rolling latency samples for order submission, surfaced by
/// `/metrics/latency/okx-order`.
#[derive(Default)]
pub struct LatencyTracker {
    samples_ms: RwLock<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub latest_ms: f64,
}

impl LatencyTracker {
    pub fn record(&self, sample_ms: f64) {
        self.samples_ms.write().push(sample_ms);
    }

    pub fn stats(&self) -> Option<LatencyStats> {
        let samples = self.samples_ms.read();
        if samples.is_empty() {
            return None;
        }
        let count = samples.len();
        let min_ms = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_ms = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg_ms = samples.iter().sum::<f64>() / count as f64;
        let latest_ms = *samples.last().unwrap();
        Some(LatencyStats { count, min_ms, max_ms, avg_ms, latest_ms })
    }
}

/// Order outcome counts by terminal status, surfaced as
/// `okx_orders_total{status=…}` on `/metrics`.
#[derive(Default)]
pub struct OrderCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub error: AtomicU64,
}

impl OrderCounters {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        )
    }
}

pub struct ExchangeBroker {
    client: std::sync::Arc<dyn ExchangeClient>,
    symbol_map: HashMap<Symbol, String>,
    outcome_tracker: Option<std::sync::Arc<OutcomeTracker>>,
    max_slippage_bps: f64,
    pub latency: std::sync::Arc<LatencyTracker>,
    pub order_counters: std::sync::Arc<OrderCounters>,
    pending_exits: Mutex<Vec<PendingExit>>,
}

impl ExchangeBroker {
    /// `symbol_map` maps a configured symbol (e.g. `BTC-USDT-SWAP`) to the
    /// exchange's own spelling (e.g. `BTC/USDT:USDT`); symbols absent from the
    /// map are passed through unchanged.
    pub fn new(
        client: std::sync::Arc<dyn ExchangeClient>,
        symbol_map: HashMap<Symbol, String>,
        outcome_tracker: Option<std::sync::Arc<OutcomeTracker>>,
        max_slippage_bps: f64,
    ) -> Self {
        Self {
            client,
            symbol_map,
            outcome_tracker,
            max_slippage_bps,
            latency: std::sync::Arc::new(LatencyTracker::default()),
            order_counters: std::sync::Arc::new(OrderCounters::default()),
            pending_exits: Mutex::new(Vec::new()),
        }
    }

    fn resolve_symbol(&self, symbol: &str) -> String {
        self.symbol_map.get(symbol).cloned().unwrap_or_else(|| symbol.to_string())
    }

    /// Prefer an explicit quantity; otherwise derive one from `size_pct` of
    /// the account's free USDT balance at the current price.
    async fn derive_quantity(&self, decision: &Decision, price: f64) -> Result<f64> {
        if let Some(quantity) = decision.quantity {
            return Ok(quantity);
        }
        let size_pct = decision.size_pct.unwrap_or(10.0);
        let balance = self.client.get_balance().await?;
        Ok(balance.free_usdt * (size_pct / 100.0) / price)
    }

    async fn submit_order(&self, decision: &Decision, side: OrderSide, price: f64) -> Result<String> {
        let exchange_symbol = self.resolve_symbol(&decision.symbol);
        let quantity = self.derive_quantity(decision, price).await?;
        if quantity <= 0.0 {
            return Ok(format!("Computed non-positive quantity for {} {}; skipping", side.as_str(), decision.symbol));
        }

        let started = Instant::now();
        let result = self.client.place_order(&exchange_symbol, side, quantity).await;
        self.latency.record(started.elapsed().as_secs_f64() * 1000.0);

        let order = match result.with_context(|| format!("order submission failed for {exchange_symbol}")) {
            Ok(order) => order,
            Err(e) => {
                self.order_counters.error.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        if !order.is_accepted() {
            self.order_counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %decision.symbol, status = %order.status, "order rejected by exchange");
            return Ok(format!("Order rejected for {}: status={}", decision.symbol, order.status));
        }
        self.order_counters.accepted.fetch_add(1, Ordering::Relaxed);

        if matches!(side, OrderSide::Sell) {
            self.capture_realized_pnl(&decision.symbol, &exchange_symbol).await;
        }

        Ok(format!("{} {}: order {} accepted (status={})", side.as_str(), decision.symbol, order.order_id, order.status))
    }

    /// Reconstruct realized PnL for a just-closed position from the
    /// exchange's own recent-trade history: weighted-average buy price as
    /// entry, weighted-average sell price as exit.
    async fn capture_realized_pnl(&self, symbol: &Symbol, exchange_symbol: &str) {
        let trades = match self.client.get_recent_trades(exchange_symbol, 50).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(%symbol, error = %e, "failed to fetch recent trades for PnL capture");
                return;
            }
        };

        let (buy_notional, buy_qty) = weighted_side(&trades, "buy");
        let (sell_notional, sell_qty) = weighted_side(&trades, "sell");

        if buy_qty <= 0.0 || sell_qty <= 0.0 {
            return;
        }

        let entry_price = buy_notional / buy_qty;
        let exit_price = sell_notional / sell_qty;
        let quantity = sell_qty.min(buy_qty);
        let realized_pnl = quantity * (exit_price - entry_price);

        info!(%symbol, entry_price, exit_price, realized_pnl, "captured realized PnL from exchange trade history");

        if let Some(tracker) = &self.outcome_tracker {
            self.pending_exits.lock().push(PendingExit { symbol: symbol.clone(), fill_price: exit_price, reason: "Exchange fill".into() });
            let _ = tracker;
        }
    }
}

fn weighted_side(trades: &[crate::exchange::TradeRecord], side: &str) -> (f64, f64) {
    trades
        .iter()
        .filter(|t| t.side.eq_ignore_ascii_case(side))
        .fold((0.0, 0.0), |(notional, qty), t| (notional + t.price * t.quantity, qty + t.quantity))
}

impl BrokerPort for ExchangeBroker {
    fn execute<'a>(
        &'a self,
        decisions: &'a [Decision],
        market_snapshots: &'a HashMap<Symbol, f64>,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut messages = Vec::with_capacity(decisions.len());
            for decision in decisions {
                let Some(&price) = market_snapshots.get(&decision.symbol) else {
                    messages.push(format!("No market data for {}; skipping decision", decision.symbol));
                    continue;
                };
                if price <= 0.0 {
                    messages.push(format!("Invalid market price ({price}) for {}; skipping decision", decision.symbol));
                    continue;
                }

                let slippage_bps = decision.max_slippage_bps.unwrap_or(self.max_slippage_bps);
                let fill_price = apply_slippage(decision.action, price, slippage_bps);

                let msg = match decision.action {
                    DecisionAction::Buy => self.submit_order(decision, OrderSide::Buy, fill_price).await,
                    DecisionAction::Sell | DecisionAction::Close => self.submit_order(decision, OrderSide::Sell, fill_price).await,
                    DecisionAction::Hold => Ok(format!("HOLD {}: no order submitted", decision.symbol)),
                    DecisionAction::NoEntry => Ok(format!("NO_ENTRY {}: no order submitted", decision.symbol)),
                };

                messages.push(msg.unwrap_or_else(|e| format!("Error executing {:?} for {}: {e}", decision.action, decision.symbol)));
            }
            Ok(messages)
        })
    }

    fn mark_to_market<'a>(&'a self, _market_snapshots: &'a HashMap<Symbol, f64>) -> BoxFuture<'a, Result<()>> {
        // Stop-loss/take-profit triggers are enforced exchange-side (conditional
        // orders) in paper/live mode; there is no local position state to
        // re-price here.
        Box::pin(async move { Ok(()) })
    }

    fn process_pending_feedback<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let exits: Vec<PendingExit> = std::mem::take(&mut *self.pending_exits.lock());
            let Some(tracker) = &self.outcome_tracker else { return Ok(()) };
            for exit in exits {
                if let Err(e) = tracker
                    .register_position_exit(exit.symbol.clone(), exit.fill_price, DecisionAction::Close, exit.reason)
                    .await
                {
                    warn!(symbol = %exit.symbol, error = %e, "failed to process feedback loop");
                }
            }
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn get_portfolio_snapshot<'a>(&'a self) -> BoxFuture<'a, Result<Option<Portfolio>>> {
        let _ = Utc::now();
        Box::pin(async move { Ok(None) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::okx::OkxClient;

    fn broker() -> ExchangeBroker {
        let client = std::sync::Arc::new(OkxClient::new("k".into(), "s".into(), "p".into(), "https://unused.invalid".into(), true));
        let mut symbol_map = HashMap::new();
        symbol_map.insert("BTC-USDT-SWAP".to_string(), "BTC/USDT:USDT".to_string());
        ExchangeBroker::new(client, symbol_map, None, 5.0)
    }

    #[test]
    fn resolve_symbol_uses_mapping_when_present() {
        let b = broker();
        assert_eq!(b.resolve_symbol("BTC-USDT-SWAP"), "BTC/USDT:USDT");
        assert_eq!(b.resolve_symbol("UNKNOWN-SYM"), "UNKNOWN-SYM");
    }

    #[test]
    fn latency_tracker_computes_stats() {
        let tracker = LatencyTracker::default();
        assert!(tracker.stats().is_none());
        tracker.record(10.0);
        tracker.record(30.0);
        tracker.record(20.0);
        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.latest_ms, 20.0);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn order_counters_start_at_zero() {
        let counters = OrderCounters::default();
        assert_eq!(counters.snapshot(), (0, 0, 0));
    }

    #[test]
    fn weighted_side_averages_price_by_quantity() {
        let trades = vec![
            crate::exchange::TradeRecord { symbol: "BTC".into(), side: "buy".into(), price: 100.0, quantity: 1.0, timestamp: Utc::now() },
            crate::exchange::TradeRecord { symbol: "BTC".into(), side: "buy".into(), price: 120.0, quantity: 1.0, timestamp: Utc::now() },
        ];
        let (notional, qty) = weighted_side(&trades, "buy");
        assert_eq!(qty, 2.0);
        assert_eq!(notional / qty, 110.0);
    }
}
