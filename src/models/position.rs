//! Position snapshot as reported by the signal feed for one symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Derive the side from a signed quantity. Zero has no side.
    pub fn from_quantity(quantity: Decimal) -> Option<Self> {
        if quantity > Decimal::ZERO {
            Some(Self::Long)
        } else if quantity < Decimal::ZERO {
            Some(Self::Short)
        } else {
            None
        }
    }

    /// The side that closes a position opened on this side.
    pub fn closing(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit plan attached to an agent position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitPlan {
    /// Price at which the agent intends to take profit
    pub profit_target: Option<Decimal>,

    /// Price at which the agent intends to stop out
    pub stop_loss: Option<Decimal>,

    /// Agent's note on what invalidates the trade
    pub invalidation: Option<String>,
}

/// One symbol's simulated position as observed from the agent feed.
///
/// Immutable snapshot value; each poll replaces it wholesale, nothing
/// mutates it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPosition {
    pub symbol: String,

    /// Signed quantity; negative means short
    pub quantity: Decimal,

    pub entry_price: Decimal,
    pub leverage: u32,

    /// Mark price at observation time
    pub mark_price: Decimal,

    pub unrealized_pnl: Decimal,

    /// Margin the agent committed to this position
    pub margin: Decimal,

    /// Order identifiers assigned by the agent's venue
    pub entry_oid: String,
    pub tp_oid: Option<String>,
    pub sl_oid: Option<String>,

    pub exit_plan: ExitPlan,

    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl AgentPosition {
    pub fn side(&self) -> Option<PositionSide> {
        PositionSide::from_quantity(self.quantity)
    }

    /// Whether `mark` has crossed the exit plan's profit-target or
    /// stop-loss threshold for this position's side. Inclusive on both
    /// boundaries.
    pub fn crossed_exit_threshold(&self, mark: Decimal) -> bool {
        let Some(side) = self.side() else {
            return false;
        };

        let hit_tp = self.exit_plan.profit_target.is_some_and(|tp| match side {
            PositionSide::Long => mark >= tp,
            PositionSide::Short => mark <= tp,
        });
        let hit_sl = self.exit_plan.stop_loss.is_some_and(|sl| match side {
            PositionSide::Long => mark <= sl,
            PositionSide::Short => mark >= sl,
        });

        hit_tp || hit_sl
    }
}

/// Percentage return of a leveraged position, sign-adjusted for side.
///
/// `(mark - entry) / entry * leverage * 100`, negated for shorts.
pub fn leveraged_return_pct(
    entry_price: Decimal,
    mark_price: Decimal,
    leverage: u32,
    side: PositionSide,
) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }

    let raw = (mark_price - entry_price) / entry_price
        * Decimal::from(leverage)
        * Decimal::ONE_HUNDRED;

    match side {
        PositionSide::Long => raw,
        PositionSide::Short => -raw,
    }
}
