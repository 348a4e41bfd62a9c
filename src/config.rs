//! Mirror configuration.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::api::MarginMode;
use crate::engine::FundingMode;

/// Configuration for mirroring one agent onto the exchange account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Agent whose positions are mirrored
    pub agent_id: String,

    /// Seconds between snapshot polls; `None` runs a single pass and exits
    pub poll_interval_secs: Option<u64>,

    /// Log intents instead of placing orders
    pub dry_run: bool,

    /// Sqlite database URL
    pub database_url: String,

    /// Optional snapshot marker to replay a fixed point in time
    pub snapshot_marker: Option<String>,

    /// Margin pool split across open symbols (proportional funding)
    pub total_margin: Decimal,

    /// Fixed margin per symbol; set to switch off proportional funding
    pub fixed_margin_per_coin: Option<Decimal>,

    /// Per-symbol weights for proportional funding; missing symbols weigh 1
    pub symbol_weights: HashMap<String, Decimal>,

    /// Margin mode applied to every mirrored symbol
    pub margin_mode: MarginMode,

    /// Max deviation between our mark and the agent's entry, in percent
    pub price_tolerance_percent: Decimal,

    /// Leveraged-return take-profit in percent; `None` disables it
    pub profit_target_percent: Option<Decimal>,

    /// Release a symbol for re-entry after a manual close
    pub auto_re_follow: bool,

    /// Suppress console blotter output, keeping only structured logs
    pub quiet: bool,

    /// Use the exchange testnet
    pub testnet: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            poll_interval_secs: Some(30),
            dry_run: false,
            database_url: "sqlite:./agentmirror.db?mode=rwc".to_string(),
            snapshot_marker: None,
            total_margin: dec!(1000),
            fixed_margin_per_coin: None,
            symbol_weights: HashMap::new(),
            margin_mode: MarginMode::Isolated,
            price_tolerance_percent: dec!(1.0),
            profit_target_percent: None,
            auto_re_follow: false,
            quiet: false,
            testnet: false,
        }
    }
}

impl MirrorConfig {
    /// Overlay optional `MIRROR_*` environment variables. Exchange
    /// credentials are read separately by the exchange client.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("MIRROR_TOTAL_MARGIN") {
            self.total_margin = parse_decimal("MIRROR_TOTAL_MARGIN", &v)?;
        }
        if let Ok(v) = env::var("MIRROR_FIXED_MARGIN") {
            self.fixed_margin_per_coin = Some(parse_decimal("MIRROR_FIXED_MARGIN", &v)?);
        }
        if let Ok(v) = env::var("MIRROR_SYMBOL_WEIGHTS") {
            self.symbol_weights = parse_weights(&v)?;
        }
        if let Ok(v) = env::var("MIRROR_MARGIN_MODE") {
            self.margin_mode = MarginMode::from_str(&v)?;
        }
        if let Ok(v) = env::var("MIRROR_PRICE_TOLERANCE") {
            self.price_tolerance_percent = parse_decimal("MIRROR_PRICE_TOLERANCE", &v)?;
        }
        if let Ok(v) = env::var("MIRROR_PROFIT_TARGET") {
            self.profit_target_percent = Some(parse_decimal("MIRROR_PROFIT_TARGET", &v)?);
        }
        if let Ok(v) = env::var("MIRROR_AUTO_REFOLLOW") {
            self.auto_re_follow = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Configuration errors are fatal before the first tick.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            bail!("agent id must be set");
        }
        if self.poll_interval_secs == Some(0) {
            bail!("poll interval must be at least 1 second");
        }
        match self.fixed_margin_per_coin {
            Some(amount) if amount <= Decimal::ZERO => {
                bail!("fixed margin per coin must be positive");
            }
            None if self.total_margin <= Decimal::ZERO => {
                bail!("total margin must be positive");
            }
            _ => {}
        }
        if self.price_tolerance_percent < Decimal::ZERO {
            bail!("price tolerance must not be negative");
        }
        if let Some(w) = self.symbol_weights.values().find(|w| **w < Decimal::ZERO) {
            bail!("symbol weights must not be negative (got {})", w);
        }
        Ok(())
    }

    pub fn funding_mode(&self) -> FundingMode {
        match self.fixed_margin_per_coin {
            Some(amount) => FundingMode::FixedPerCoin { amount },
            None => FundingMode::Proportional {
                total_margin: self.total_margin,
                weights: self.symbol_weights.clone(),
            },
        }
    }
}

fn parse_decimal(name: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim()).with_context(|| format!("Invalid {}: {}", name, value))
}

/// Parse "BTCUSDT:2,ETHUSDT:1.5" into a weight map.
fn parse_weights(value: &str) -> Result<HashMap<String, Decimal>> {
    let mut weights = HashMap::new();
    for pair in value.split(',').filter(|p| !p.trim().is_empty()) {
        let (symbol, weight) = pair
            .split_once(':')
            .with_context(|| format!("Invalid weight entry: {}", pair))?;
        weights.insert(
            symbol.trim().to_uppercase(),
            parse_decimal("symbol weight", weight)?,
        );
    }
    Ok(weights)
}
