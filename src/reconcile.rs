// =============================================================================
// Reconciliation loop — compare our balance view against the exchange (§B)
// =============================================================================
//
// SAFETY POLICY: this module only observes and logs. It never cancels orders
// or closes positions on the exchange; a human operator resolves drift.
//
// `ExchangeBroker` keeps no local position book (the exchange is the source
// of truth for fills), so there is nothing to match here beyond the account
// balance itself. A no-op in simulator mode, where there is no exchange
// account to drift from.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::exchange::{AccountBalance, ExchangeClient};

/// Outcome of one reconciliation pass, surfaced on `/readyz`.
#[derive(Debug, Clone)]
pub struct ReconcileStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_ok: bool,
    pub last_error: Option<String>,
    pub balance_drift: bool,
}

impl Default for ReconcileStatus {
    fn default() -> Self {
        Self { last_run_at: None, last_ok: true, last_error: None, balance_drift: false }
    }
}

/// Shared, lock-protected reconciliation state the `/readyz` handler reads.
#[derive(Default)]
pub struct ReconcileState {
    status: RwLock<ReconcileStatus>,
    last_balance: RwLock<Option<AccountBalance>>,
}

impl ReconcileState {
    pub fn snapshot(&self) -> ReconcileStatus {
        self.status.read().clone()
    }

    /// Run one reconciliation cycle against `exchange`, recording the result.
    /// Always `Ok`; failures are captured in the stored status rather than
    /// propagated, so a transient exchange outage never takes down the
    /// scheduler that calls this in a loop.
    pub async fn reconcile_once(&self, exchange: &dyn ExchangeClient) -> Result<()> {
        let now = Utc::now();
        match fetch_balance(exchange).await {
            Ok(balance) => {
                let drift = {
                    let previous = self.last_balance.read();
                    detect_drift(previous.as_ref(), &balance)
                };
                *self.last_balance.write() = Some(balance);
                if drift {
                    warn!(equity_usdt = balance.equity_usdt, "balance drift detected during reconciliation");
                } else {
                    debug!(equity_usdt = balance.equity_usdt, "reconciliation: balance unchanged beyond tolerance");
                }
                *self.status.write() = ReconcileStatus {
                    last_run_at: Some(now),
                    last_ok: true,
                    last_error: None,
                    balance_drift: drift,
                };
                info!(timestamp = %now, "reconciliation cycle completed");
            }
            Err(e) => {
                warn!(error = %e, "reconciliation cycle failed");
                *self.status.write() = ReconcileStatus {
                    last_run_at: Some(now),
                    last_ok: false,
                    last_error: Some(e.to_string()),
                    balance_drift: self.status.read().balance_drift,
                };
            }
        }
        Ok(())
    }
}

async fn fetch_balance(exchange: &dyn ExchangeClient) -> Result<AccountBalance> {
    exchange.get_balance().await.context("reconcile: failed to fetch account balance")
}

/// `true` if equity moved by more than 0.01% relative to the prior sample.
/// The first sample after startup never counts as drift.
fn detect_drift(previous: Option<&AccountBalance>, current: &AccountBalance) -> bool {
    let Some(previous) = previous else { return false };
    if previous.equity_usdt.abs() < f64::EPSILON {
        return current.equity_usdt.abs() > f64::EPSILON;
    }
    let pct_change = ((current.equity_usdt - previous.equity_usdt) / previous.equity_usdt).abs();
    pct_change > 0.0001
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(equity: f64) -> AccountBalance {
        AccountBalance { free_usdt: equity, equity_usdt: equity }
    }

    #[test]
    fn first_sample_is_never_drift() {
        assert!(!detect_drift(None, &balance(1000.0)));
    }

    #[test]
    fn small_change_is_not_drift() {
        assert!(!detect_drift(Some(&balance(1000.0)), &balance(1000.0000001)));
    }

    #[test]
    fn large_change_is_drift() {
        assert!(detect_drift(Some(&balance(1000.0)), &balance(900.0)));
    }

    #[test]
    fn appearance_from_zero_is_drift() {
        assert!(detect_drift(Some(&balance(0.0)), &balance(50.0)));
    }

    #[test]
    fn default_status_reports_ok_with_no_history() {
        let status = ReconcileStatus::default();
        assert!(status.last_ok);
        assert!(status.last_run_at.is_none());
        assert!(!status.balance_drift);
    }
}
