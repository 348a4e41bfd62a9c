//! Wire types for the signal feed and futures REST responses.

use rust_decimal::Decimal;
use serde::Deserialize;

/// One position row from the agent feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPositionRow {
    pub symbol: String,

    /// Signed quantity; negative means short
    pub quantity: Decimal,

    pub entry_price: Decimal,
    pub leverage: u32,
    pub current_price: Decimal,

    #[serde(default)]
    pub unrealized_pnl: Decimal,

    #[serde(default)]
    pub margin: Decimal,

    pub entry_oid: String,
    #[serde(default)]
    pub tp_oid: Option<String>,
    #[serde(default)]
    pub sl_oid: Option<String>,

    #[serde(default)]
    pub exit_plan: Option<FeedExitPlan>,
}

/// Exit plan block inside a feed position row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedExitPlan {
    #[serde(default)]
    pub profit_target: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub invalidation: Option<String>,
}

/// Snapshot envelope from the feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    #[serde(default)]
    pub positions: Vec<FeedPositionRow>,
}

/// Agent row from the feed's agent listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// ---- Futures REST responses ----

/// Response from a market order placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
    #[serde(default)]
    pub status: String,
}

/// Mark price endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: Decimal,
}

/// Position risk row from the account endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,

    /// Signed position size; "0" when flat
    pub position_amt: Decimal,

    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: Decimal,

    #[serde(rename = "unRealizedProfit", default)]
    pub unrealized_profit: Decimal,
}

/// One asset balance row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    pub available_balance: Decimal,
}

/// Error body returned by the futures API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}
