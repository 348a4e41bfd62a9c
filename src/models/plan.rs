//! Follow plans: the action the detector decided on for one symbol.

use super::position::AgentPosition;

/// Action classified for a symbol this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowAction {
    /// Open a fresh position mirroring the agent's
    Enter,
    /// The agent closed; mirror the close
    Exit,
    /// The agent rolled into a new position; close old, open new atomically
    Replace,
    /// Mark price crossed the agent's TP or SL threshold; close
    TpSlClose,
    /// Nothing to do
    None,
}

impl FollowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "ENTER",
            Self::Exit => "EXIT",
            Self::Replace => "REPLACE",
            Self::TpSlClose => "TP_SL_CLOSE",
            Self::None => "NONE",
        }
    }
}

impl std::fmt::Display for FollowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction produced by the detector and consumed within the same tick.
///
/// Carries the observed agent position for actions that need it (Enter,
/// Replace, TpSlClose); Exit and None carry nothing beyond the symbol.
#[derive(Debug, Clone)]
pub struct FollowPlan {
    pub symbol: String,
    pub action: FollowAction,
    pub position: Option<AgentPosition>,
}

impl FollowPlan {
    pub fn new(symbol: impl Into<String>, action: FollowAction, position: Option<AgentPosition>) -> Self {
        Self {
            symbol: symbol.into(),
            action,
            position,
        }
    }

    /// Whether this plan requires margin from the allocator.
    pub fn needs_capital(&self) -> bool {
        matches!(self.action, FollowAction::Enter | FollowAction::Replace)
    }
}
