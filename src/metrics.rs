// =============================================================================
// Prometheus exposition — GET /metrics (§B)
// =============================================================================
//
// Counters live where they're produced (`ExchangeBroker::order_counters`,
// `ExchangeBroker::latency`, `DecisionScheduler::evaluation_counts`); this
// module only formats a snapshot of them as Prometheus text, using the
// standard `# HELP` / `# TYPE` plus flat `name{labels} value` exposition
// format.
// =============================================================================

use std::fmt::Write as _;

use crate::broker::exchange::{ExchangeBroker, LatencyStats};
use crate::decision_scheduler::DecisionScheduler;
use crate::domain::Portfolio;

/// Render the full `/metrics` body for one scrape.
pub fn render(exchange_broker: &ExchangeBroker, decision_scheduler: &DecisionScheduler, portfolio: Option<&Portfolio>) -> String {
    let mut out = String::new();

    let (accepted, rejected, error) = exchange_broker.order_counters.snapshot();
    write_orders_total(&mut out, accepted, rejected, error);
    write_order_latency(&mut out, exchange_broker.latency.stats());

    let (success, failure) = decision_scheduler.evaluation_counts();
    write_evaluations_total(&mut out, success, failure);

    write_drawdown(&mut out, portfolio);

    out
}

fn write_orders_total(out: &mut String, accepted: u64, rejected: u64, error: u64) {
    let _ = writeln!(out, "# HELP okx_orders_total Count of order submissions by terminal status.");
    let _ = writeln!(out, "# TYPE okx_orders_total counter");
    let _ = writeln!(out, "okx_orders_total{{status=\"accepted\"}} {accepted}");
    let _ = writeln!(out, "okx_orders_total{{status=\"rejected\"}} {rejected}");
    let _ = writeln!(out, "okx_orders_total{{status=\"error\"}} {error}");
}

fn write_order_latency(out: &mut String, stats: Option<LatencyStats>) {
    let _ = writeln!(out, "# HELP okx_order_latency_seconds Observed order submission round-trip latency.");
    let _ = writeln!(out, "# TYPE okx_order_latency_seconds summary");
    let Some(stats) = stats else {
        let _ = writeln!(out, "okx_order_latency_seconds_count 0");
        return;
    };
    let _ = writeln!(out, "okx_order_latency_seconds{{quantile=\"0\"}} {:.6}", stats.min_ms / 1000.0);
    let _ = writeln!(out, "okx_order_latency_seconds{{quantile=\"1\"}} {:.6}", stats.max_ms / 1000.0);
    let _ = writeln!(out, "okx_order_latency_seconds_sum {:.6}", stats.avg_ms * stats.count as f64 / 1000.0);
    let _ = writeln!(out, "okx_order_latency_seconds_count {}", stats.count);
}

fn write_evaluations_total(out: &mut String, success: u64, failure: u64) {
    let _ = writeln!(out, "# HELP scheduler_evaluations_total Decision-cycle outcomes since startup.");
    let _ = writeln!(out, "# TYPE scheduler_evaluations_total counter");
    let _ = writeln!(out, "scheduler_evaluations_total{{result=\"success\"}} {success}");
    let _ = writeln!(out, "scheduler_evaluations_total{{result=\"failure\"}} {failure}");
}

fn write_drawdown(out: &mut String, portfolio: Option<&Portfolio>) {
    let _ = writeln!(out, "# HELP portfolio_drawdown_pct Percentage drawdown from starting cash, floored at zero.");
    let _ = writeln!(out, "# TYPE portfolio_drawdown_pct gauge");
    let pct = portfolio.map(drawdown_pct).unwrap_or(0.0);
    let _ = writeln!(out, "portfolio_drawdown_pct {pct:.4}");
}

fn drawdown_pct(portfolio: &Portfolio) -> f64 {
    if portfolio.starting_cash <= 0.0 {
        return 0.0;
    }
    let equity = portfolio.equity();
    ((portfolio.starting_cash - equity) / portfolio.starting_cash * 100.0).max(0.0)
}
