// =============================================================================
// Small tagged sum types shared across the engine
// =============================================================================
//
// Every operational discriminant is a closed enum rather than a bare string,
// so invalid states (typos, unmapped actions) are caught at deserialisation
// time instead of drifting silently through the pipeline.
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which broker backend the engine is driving.
///
/// `Simulator` never touches a real exchange; `Paper` and `Live` both submit
/// to the exchange client, differing only in whether real funds move
/// (enforced by the exchange client's demo-mode header, not by this enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Simulator,
    Paper,
    Live,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        Self::Simulator
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simulator => "simulator",
            Self::Paper => "paper",
            Self::Live => "live",
        };
        write!(f, "{s}")
    }
}

impl RuntimeMode {
    /// Whether this mode ever places real orders against the exchange.
    pub fn uses_exchange(self) -> bool {
        matches!(self, Self::Paper | Self::Live)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simulator" | "sim" => Some(Self::Simulator),
            "paper" => Some(Self::Paper),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

/// The decision an LLM-produced plan expresses for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionAction {
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "NO_ENTRY")]
    NoEntry,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hold => "HOLD",
            Self::Close => "CLOSE",
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::NoEntry => "NO_ENTRY",
        };
        write!(f, "{s}")
    }
}

impl DecisionAction {
    /// Entry-style actions open or add to a position; exit-style actions
    /// reduce or close one.
    pub fn is_entry(self) -> bool {
        matches!(self, Self::Buy)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::Close | Self::Sell)
    }
}

/// Why a position was closed, recorded on `ClosedPosition` for the feedback
/// loop's critique prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The LLM issued an explicit CLOSE decision.
    Decision,
    /// `exit_plan.stop_loss` was crossed during mark-to-market.
    StopLoss,
    /// `exit_plan.take_profit` was crossed during mark-to-market.
    TakeProfit,
    /// `exit_plan.invalidation` condition parsed and matched.
    Invalidation,
    /// Operator-initiated close via the control API.
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decision => "decision",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Invalidation => "invalidation",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Category a generated rule is filed under, used to cap how many of each
/// kind are surfaced in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    RiskManagement,
    Exit,
    PositionSizing,
    Entry,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RiskManagement => "risk_management",
            Self::Exit => "exit",
            Self::PositionSizing => "position_sizing",
            Self::Entry => "entry",
        };
        write!(f, "{s}")
    }
}
