//! Append-only mirror events emitted at the notification boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::PositionSide;

/// What happened to a followed symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Entered,
    Exited,
    Replaced,
    TpSlClosed,
    ProfitExit,
    ManualClose,
    ReplaceLegFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entered => "ENTERED",
            Self::Exited => "EXITED",
            Self::Replaced => "REPLACED",
            Self::TpSlClosed => "TP_SL_CLOSED",
            Self::ProfitExit => "PROFIT_EXIT",
            Self::ManualClose => "MANUAL_CLOSE",
            Self::ReplaceLegFailed => "REPLACE_LEG_FAILED",
        }
    }

}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record of a completed action, suitable for forwarding to an
/// external notifier. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorEvent {
    pub id: String,
    pub symbol: String,
    pub kind: EventKind,
    pub side: Option<PositionSide>,

    /// Trigger or fill price, when one applies
    pub price: Option<Decimal>,

    /// Exchange order id of the action, when one was placed
    pub order_id: Option<String>,

    /// Human-readable context (rejection reason, realized return, ...)
    pub detail: String,

    /// Whether the action was simulated (risk-only mode)
    pub dry_run: bool,

    pub timestamp: DateTime<Utc>,
}

impl MirrorEvent {
    pub fn new(symbol: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            kind,
            side: None,
            price: None,
            order_id: None,
            detail: String::new(),
            dry_run: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_side(mut self, side: Option<PositionSide>) -> Self {
        self.side = side;
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_order_id(mut self, order_id: Option<String>) -> Self {
        self.order_id = order_id;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
