//! Exit monitor: runs after plan execution each tick and closes followed
//! positions on our own account-level triggers, independent of the agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::Exchange;
use crate::db::{FollowState, HistoryStore};
use crate::engine::ExecutionMode;
use crate::models::{leveraged_return_pct, AgentPosition, EventKind, MirrorEvent};

pub struct ExitMonitor {
    exchange: Arc<dyn Exchange>,
    mode: ExecutionMode,

    /// Leveraged-return take-profit, e.g. 30 for +30%. `None` disables it.
    profit_target_percent: Option<Decimal>,

    /// Treat a vanished live position as a deliberate manual close and
    /// release the symbol for re-entry.
    auto_re_follow: bool,
}

impl ExitMonitor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        mode: ExecutionMode,
        profit_target_percent: Option<Decimal>,
        auto_re_follow: bool,
    ) -> Self {
        Self {
            exchange,
            mode,
            profit_target_percent,
            auto_re_follow,
        }
    }

    /// Sweep every FOLLOWING record. Returns the events raised this pass;
    /// each is already persisted.
    pub async fn check(
        &self,
        store: &HistoryStore,
        snapshot: &BTreeMap<String, AgentPosition>,
    ) -> Result<Vec<MirrorEvent>> {
        let mut events = Vec::new();

        for record in store.all_records().await? {
            if record.state != FollowState::Following {
                continue;
            }
            let symbol = &record.symbol;

            let live = if self.mode.is_dry_run() {
                None
            } else {
                match self.exchange.open_position(symbol).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Position lookup failed, skipping");
                        continue;
                    }
                }
            };

            // Agent still holds it but our side is flat: the operator closed
            // it by hand. Only trustworthy in live mode, where a missing
            // position really means a missing position.
            if !self.mode.is_dry_run()
                && self.auto_re_follow
                && live.is_none()
                && snapshot.contains_key(symbol)
            {
                store.reset_record(symbol).await?;

                let event = MirrorEvent::new(symbol, EventKind::ManualClose)
                    .with_detail("live position gone while agent still holds it");
                store.insert_event(&event).await?;

                info!(symbol = %symbol, "Manual close detected, released for re-entry");
                events.push(event);
                continue;
            }

            let Some(target) = self.profit_target_percent else {
                continue;
            };

            // Live numbers when we have them; in risk-only mode fall back to
            // the agent's own marks so the trigger is still exercised.
            let (side, entry, mark, leverage) = if let Some(p) = live.as_ref() {
                (Some(p.side), p.entry_price, p.mark_price, p.leverage)
            } else if let Some(p) = snapshot.get(symbol) {
                (p.side(), p.entry_price, p.mark_price, p.leverage)
            } else {
                continue;
            };
            let Some(side) = side else { continue };
            if entry.is_zero() {
                continue;
            }

            let ret = leveraged_return_pct(entry, mark, leverage, side);
            if ret < target {
                continue;
            }

            let order_id = if self.mode.is_dry_run() {
                info!(symbol = %symbol, return_pct = %ret, "[RISK ONLY] Would take profit");
                None
            } else {
                match self.exchange.close_position(symbol).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Profit-exit close rejected");
                        continue;
                    }
                }
            };

            store.reset_record(symbol).await?;

            let event = MirrorEvent::new(symbol, EventKind::ProfitExit)
                .with_side(Some(side))
                .with_price(mark)
                .with_order_id(order_id)
                .with_detail(format!("leveraged return {:.2}% >= {}%", ret, target))
                .with_dry_run(self.mode.is_dry_run());
            store.insert_event(&event).await?;

            info!(symbol = %symbol, return_pct = %ret, "Took profit");
            events.push(event);
        }

        Ok(events)
    }
}
