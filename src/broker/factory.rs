// =============================================================================
// BrokerFactory / BrokerHandle — runtime-mode-driven broker selection (§9)
// =============================================================================
//
// `BrokerPort` has no shared base beyond the trait itself, so switching
// broker backends on a `RuntimeMode` change can't be a field assignment on a
// common struct. `BrokerFactory` resolves a mode to the already-constructed
// `Arc<dyn BrokerPort>` for it (typically one long-lived `SimulatedBroker`
// and one long-lived `ExchangeBroker`, picked by mode rather than rebuilt
// per tick). `BrokerHandle` is itself a `BrokerPort` that forwards to
// whichever broker was last installed, so `DecisionPipeline` — constructed
// once at startup and holding an `Arc<dyn BrokerPort>` — transparently
// follows the active mode without needing to know about mode switches.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::broker::{BoxFuture, BrokerPort, Decision, ExecutionContext};
use crate::domain::{Portfolio, Symbol};
use crate::types::RuntimeMode;

/// Resolves a `RuntimeMode` to the broker backend that serves it.
pub trait BrokerFactory: Send + Sync {
    fn build(&self, mode: RuntimeMode) -> Arc<dyn BrokerPort>;
}

/// Picks between one simulator broker and one exchange-backed broker shared
/// across paper and live mode (paper/live differ only in the exchange
/// client's demo-mode header, not in which `BrokerPort` impl handles them).
pub struct ModeBrokerFactory {
    simulator: Arc<dyn BrokerPort>,
    exchange: Arc<dyn BrokerPort>,
}

impl ModeBrokerFactory {
    pub fn new(simulator: Arc<dyn BrokerPort>, exchange: Arc<dyn BrokerPort>) -> Self {
        Self { simulator, exchange }
    }
}

impl BrokerFactory for ModeBrokerFactory {
    fn build(&self, mode: RuntimeMode) -> Arc<dyn BrokerPort> {
        match mode {
            RuntimeMode::Simulator => self.simulator.clone(),
            RuntimeMode::Paper | RuntimeMode::Live => self.exchange.clone(),
        }
    }
}

/// A `BrokerPort` whose implementation can be swapped out from under its
/// holders. `DecisionScheduler` swaps this to the mode-appropriate broker at
/// the top of every tick; `DecisionPipeline` holds it as a plain
/// `Arc<dyn BrokerPort>` and always observes the broker of the tick in
/// progress.
pub struct BrokerHandle {
    current: RwLock<Arc<dyn BrokerPort>>,
}

impl BrokerHandle {
    pub fn new(initial: Arc<dyn BrokerPort>) -> Self {
        Self { current: RwLock::new(initial) }
    }

    pub fn swap(&self, broker: Arc<dyn BrokerPort>) {
        *self.current.write() = broker;
    }

    pub fn current(&self) -> Arc<dyn BrokerPort> {
        self.current.read().clone()
    }
}

impl BrokerPort for BrokerHandle {
    fn execute<'a>(
        &'a self,
        decisions: &'a [Decision],
        market_snapshots: &'a HashMap<Symbol, f64>,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        let broker = self.current();
        Box::pin(async move { broker.execute(decisions, market_snapshots, context).await })
    }

    fn mark_to_market<'a>(&'a self, market_snapshots: &'a HashMap<Symbol, f64>) -> BoxFuture<'a, Result<()>> {
        let broker = self.current();
        Box::pin(async move { broker.mark_to_market(market_snapshots).await })
    }

    fn process_pending_feedback<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        let broker = self.current();
        Box::pin(async move { broker.process_pending_feedback().await })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        let broker = self.current();
        Box::pin(async move { broker.close().await })
    }

    fn get_portfolio_snapshot<'a>(&'a self) -> BoxFuture<'a, Result<Option<Portfolio>>> {
        let broker = self.current();
        Box::pin(async move { broker.get_portfolio_snapshot().await })
    }
}
