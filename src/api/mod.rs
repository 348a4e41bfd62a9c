//! External collaborators: the agent signal feed and the futures exchange.
//!
//! Both are capability traits with exactly the operations the engine needs.
//! One concrete adapter exists per real backend (`SignalClient`,
//! `FuturesClient`) plus deterministic in-memory fakes (`sim`) for tests.

mod exchange_client;
mod signal_client;
#[cfg(test)]
pub mod sim;
mod types;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{AgentPosition, PositionSide};

pub use exchange_client::FuturesClient;
pub use signal_client::{CacheStats, SignalClient};
pub use types::*;

/// Collateral mode for a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Isolated,
    Crossed,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Crossed => "CROSSED",
        }
    }
}

impl std::str::FromStr for MarginMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ISOLATED" => Ok(Self::Isolated),
            "CROSSED" | "CROSS" => Ok(Self::Crossed),
            other => anyhow::bail!("Unknown margin mode: {}", other),
        }
    }
}

/// A followable agent as listed by the signal feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// An actual open position on the real exchange account.
#[derive(Debug, Clone)]
pub struct LivePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

/// The agent's position feed. Idempotent and safe to call every tick;
/// caching and backoff are the adapter's concern.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Current per-symbol snapshot for an agent. `marker` requests a
    /// specific historical snapshot; `None` means latest.
    ///
    /// The map is ordered so every tick processes symbols in the same
    /// deterministic sequence.
    async fn fetch_snapshot(
        &self,
        agent_id: &str,
        marker: Option<&str>,
    ) -> Result<BTreeMap<String, AgentPosition>>;

    /// All agents the feed exposes.
    async fn list_agents(&self) -> Result<Vec<AgentMeta>>;
}

/// The real leveraged-futures account. Mutating operations are never called
/// in risk-only mode; reads are always permitted.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()>;

    /// Place a market order, returning the exchange order id.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<String>;

    /// Flatten the open position for a symbol, returning the order id.
    async fn close_position(&self, symbol: &str) -> Result<String>;

    async fn mark_price(&self, symbol: &str) -> Result<Decimal>;

    /// The account's live position for a symbol, if any.
    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>>;

    /// Free collateral available for new positions.
    async fn available_balance(&self) -> Result<Decimal>;
}
