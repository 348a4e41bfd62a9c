//! Order executor: turns a follow plan plus its margin allocation into
//! exchange calls, or logged intents in risk-only mode.
//!
//! Error discipline follows the tick contract: exchange rejections are
//! recoverable per symbol (logged, history untouched, retried next tick),
//! while history-store failures propagate and abort the tick so the exit
//! monitor never runs over unconfirmed state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{Exchange, MarginMode};
use crate::db::{FollowState, HistoryStore};
use crate::models::{AgentPosition, EventKind, FollowAction, FollowPlan, MirrorEvent};

/// Whether exchange-mutating calls are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    /// Risk-only: no mutating exchange call is ever issued, but history is
    /// updated identically so deduplication is exercised the same way.
    DryRun,
}

impl ExecutionMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// Executes one follow plan at a time, in tick order.
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    mode: ExecutionMode,
    margin_type: MarginMode,
    price_tolerance_percent: Decimal,

    /// Last leverage applied per symbol this run. Presence also means the
    /// margin mode was set; that stays constant for the whole run.
    applied_leverage: HashMap<String, u32>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        mode: ExecutionMode,
        margin_type: MarginMode,
        price_tolerance_percent: Decimal,
    ) -> Self {
        Self {
            exchange,
            mode,
            margin_type,
            price_tolerance_percent,
            applied_leverage: HashMap::new(),
        }
    }

    /// Execute one plan. Returns the persisted mirror event when an action
    /// completed; `None` when the plan was skipped (unfunded, tolerance
    /// band, exchange rejection).
    pub async fn execute(
        &mut self,
        store: &HistoryStore,
        plan: &FollowPlan,
        margin: Decimal,
    ) -> Result<Option<MirrorEvent>> {
        match plan.action {
            FollowAction::Enter => self.enter(store, plan, margin).await,
            FollowAction::Replace => self.replace(store, plan, margin).await,
            FollowAction::Exit => self.exit(store, plan).await,
            FollowAction::TpSlClose => self.tp_sl_close(store, plan).await,
            FollowAction::None => Ok(None),
        }
    }

    /// Mark price with the tolerance band applied against the agent's
    /// reported entry. `None` means skip the symbol this tick.
    async fn checked_mark(&self, pos: &AgentPosition) -> Option<Decimal> {
        let mark = match self.exchange.mark_price(&pos.symbol).await {
            Ok(m) => m,
            Err(e) => {
                warn!(symbol = %pos.symbol, error = %e, "Mark price unavailable, skipping");
                return None;
            }
        };

        if pos.entry_price.is_zero() {
            return None;
        }

        let deviation =
            ((mark - pos.entry_price).abs() / pos.entry_price) * Decimal::ONE_HUNDRED;
        if deviation > self.price_tolerance_percent {
            warn!(
                symbol = %pos.symbol,
                mark = %mark,
                agent_entry = %pos.entry_price,
                deviation_pct = %deviation,
                "Mark price outside tolerance band, skipping"
            );
            return None;
        }

        Some(mark)
    }

    fn order_quantity(pos: &AgentPosition, margin: Decimal, mark: Decimal) -> Decimal {
        if mark.is_zero() {
            return Decimal::ZERO;
        }
        (margin * Decimal::from(pos.leverage) / mark).round_dp(6)
    }

    /// Apply leverage and margin mode before an order leg. Leverage follows
    /// the agent's current position, so it is re-applied whenever a
    /// replacement or re-entry arrives at a different multiple; margin mode
    /// is set once per symbol per run.
    async fn configure_symbol(&mut self, pos: &AgentPosition) -> bool {
        let first_setup = match self.applied_leverage.get(&pos.symbol) {
            Some(&applied) if applied == pos.leverage => return true,
            Some(_) => false,
            None => true,
        };

        if let Err(e) = self.exchange.set_leverage(&pos.symbol, pos.leverage).await {
            warn!(symbol = %pos.symbol, error = %e, "Failed to set leverage");
            return false;
        }
        if first_setup {
            if let Err(e) = self
                .exchange
                .set_margin_mode(&pos.symbol, self.margin_type)
                .await
            {
                warn!(symbol = %pos.symbol, error = %e, "Failed to set margin mode");
                return false;
            }
        }

        self.applied_leverage.insert(pos.symbol.clone(), pos.leverage);
        true
    }

    async fn enter(
        &mut self,
        store: &HistoryStore,
        plan: &FollowPlan,
        margin: Decimal,
    ) -> Result<Option<MirrorEvent>> {
        let Some(pos) = plan.position.as_ref() else {
            return Ok(None);
        };
        let Some(side) = pos.side() else {
            return Ok(None);
        };

        if margin <= Decimal::ZERO {
            debug!(symbol = %plan.symbol, "No margin allocated, skipping entry");
            return Ok(None);
        }

        let Some(mark) = self.checked_mark(pos).await else {
            return Ok(None);
        };
        let quantity = Self::order_quantity(pos, margin, mark);
        if quantity.is_zero() {
            debug!(symbol = %plan.symbol, "Zero quantity, skipping entry");
            return Ok(None);
        }

        let order_id = if self.mode.is_dry_run() {
            info!(
                symbol = %plan.symbol,
                side = %side,
                quantity = %quantity,
                mark = %mark,
                "[RISK ONLY] Would enter position"
            );
            None
        } else {
            if !self.configure_symbol(pos).await {
                return Ok(None);
            }
            match self
                .exchange
                .place_market_order(&plan.symbol, side, quantity)
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(symbol = %plan.symbol, error = %e, "Entry order rejected");
                    return Ok(None);
                }
            }
        };

        // History transitions to FOLLOWING only after the entry confirmed
        store
            .upsert_record(
                &plan.symbol,
                &pos.entry_oid,
                pos.tp_oid.as_deref(),
                pos.sl_oid.as_deref(),
                FollowState::Following,
            )
            .await?;

        let event = MirrorEvent::new(&plan.symbol, EventKind::Entered)
            .with_side(Some(side))
            .with_price(mark)
            .with_order_id(order_id)
            .with_detail(format!("margin {} at {}x", margin.normalize(), pos.leverage))
            .with_dry_run(self.mode.is_dry_run());
        store.insert_event(&event).await?;

        info!(symbol = %plan.symbol, side = %side, quantity = %quantity, "Entered");
        Ok(Some(event))
    }

    /// Close-old-then-open-new within the same tick. The old record is
    /// rewritten only after both legs succeed; a failed open leg after a
    /// successful close leaves the symbol flat and UNFOLLOWED, to be picked
    /// up as a fresh entry next tick.
    async fn replace(
        &mut self,
        store: &HistoryStore,
        plan: &FollowPlan,
        margin: Decimal,
    ) -> Result<Option<MirrorEvent>> {
        let Some(pos) = plan.position.as_ref() else {
            return Ok(None);
        };
        let Some(side) = pos.side() else {
            return Ok(None);
        };

        if margin <= Decimal::ZERO {
            debug!(symbol = %plan.symbol, "No margin for replacement leg, deferring");
            return Ok(None);
        }

        // Validate the new leg before touching the old position, so a
        // tolerance rejection leaves everything as it was.
        let Some(mark) = self.checked_mark(pos).await else {
            return Ok(None);
        };
        let quantity = Self::order_quantity(pos, margin, mark);
        if quantity.is_zero() {
            return Ok(None);
        }

        if self.mode.is_dry_run() {
            info!(
                symbol = %plan.symbol,
                side = %side,
                quantity = %quantity,
                "[RISK ONLY] Would replace position"
            );

            store
                .upsert_record(
                    &plan.symbol,
                    &pos.entry_oid,
                    pos.tp_oid.as_deref(),
                    pos.sl_oid.as_deref(),
                    FollowState::Following,
                )
                .await?;

            let event = MirrorEvent::new(&plan.symbol, EventKind::Replaced)
                .with_side(Some(side))
                .with_price(mark)
                .with_detail(format!("rolled to {}", pos.entry_oid))
                .with_dry_run(true);
            store.insert_event(&event).await?;
            return Ok(Some(event));
        }

        // Close leg; failure keeps the old record so the close retries
        if let Err(e) = self.exchange.close_position(&plan.symbol).await {
            warn!(symbol = %plan.symbol, error = %e, "Replace close leg failed");
            return Ok(None);
        }

        if !self.configure_symbol(pos).await {
            // Flat but unable to re-enter this tick
            store.reset_record(&plan.symbol).await?;
            let event = MirrorEvent::new(&plan.symbol, EventKind::ReplaceLegFailed)
                .with_detail("closed old position; symbol setup failed before re-entry");
            store.insert_event(&event).await?;
            return Ok(Some(event));
        }

        match self
            .exchange
            .place_market_order(&plan.symbol, side, quantity)
            .await
        {
            Ok(order_id) => {
                store
                    .upsert_record(
                        &plan.symbol,
                        &pos.entry_oid,
                        pos.tp_oid.as_deref(),
                        pos.sl_oid.as_deref(),
                        FollowState::Following,
                    )
                    .await?;

                let event = MirrorEvent::new(&plan.symbol, EventKind::Replaced)
                    .with_side(Some(side))
                    .with_price(mark)
                    .with_order_id(Some(order_id))
                    .with_detail(format!("rolled to {}", pos.entry_oid));
                store.insert_event(&event).await?;

                info!(symbol = %plan.symbol, side = %side, "Replaced position");
                Ok(Some(event))
            }
            Err(e) => {
                warn!(symbol = %plan.symbol, error = %e, "Replace open leg failed, left flat");

                store.reset_record(&plan.symbol).await?;

                let event = MirrorEvent::new(&plan.symbol, EventKind::ReplaceLegFailed)
                    .with_detail(format!("closed old position; re-entry rejected: {}", e));
                store.insert_event(&event).await?;
                Ok(Some(event))
            }
        }
    }

    async fn exit(&mut self, store: &HistoryStore, plan: &FollowPlan) -> Result<Option<MirrorEvent>> {
        let order_id = if self.mode.is_dry_run() {
            info!(symbol = %plan.symbol, "[RISK ONLY] Would close position");
            None
        } else {
            match self.exchange.close_position(&plan.symbol).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(symbol = %plan.symbol, error = %e, "Close rejected");
                    return Ok(None);
                }
            }
        };

        // Identifiers are retained; EXITED blocks silent re-entry
        store.mark_state(&plan.symbol, FollowState::Exited).await?;

        let event = MirrorEvent::new(&plan.symbol, EventKind::Exited)
            .with_order_id(order_id)
            .with_detail("agent closed, mirrored")
            .with_dry_run(self.mode.is_dry_run());
        store.insert_event(&event).await?;

        info!(symbol = %plan.symbol, "Exited");
        Ok(Some(event))
    }

    async fn tp_sl_close(
        &mut self,
        store: &HistoryStore,
        plan: &FollowPlan,
    ) -> Result<Option<MirrorEvent>> {
        let trigger = plan.position.as_ref().map(|p| p.mark_price);

        let order_id = if self.mode.is_dry_run() {
            info!(symbol = %plan.symbol, "[RISK ONLY] Would close at TP/SL threshold");
            None
        } else {
            match self.exchange.close_position(&plan.symbol).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(symbol = %plan.symbol, error = %e, "TP/SL close rejected");
                    return Ok(None);
                }
            }
        };

        store.reset_record(&plan.symbol).await?;

        let mut event = MirrorEvent::new(&plan.symbol, EventKind::TpSlClosed)
            .with_order_id(order_id)
            .with_detail("exit-plan threshold crossed")
            .with_dry_run(self.mode.is_dry_run());
        if let Some(price) = trigger {
            event = event.with_price(price);
        }
        store.insert_event(&event).await?;

        info!(symbol = %plan.symbol, "Closed at exit-plan threshold");
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::api::sim::{SimCall, SimExchange};
    use crate::api::LivePosition;
    use crate::models::{ExitPlan, PositionSide};

    fn agent_position(entry_oid: &str) -> AgentPosition {
        AgentPosition {
            symbol: "BTCUSDT".to_string(),
            quantity: dec!(0.5),
            entry_price: dec!(50000),
            leverage: 10,
            mark_price: dec!(50000),
            unrealized_pnl: Decimal::ZERO,
            margin: dec!(100),
            entry_oid: entry_oid.to_string(),
            tp_oid: Some("tp-1".to_string()),
            sl_oid: None,
            exit_plan: ExitPlan::default(),
            observed_at: Utc::now(),
        }
    }

    fn enter_plan(entry_oid: &str) -> FollowPlan {
        FollowPlan::new("BTCUSDT", FollowAction::Enter, Some(agent_position(entry_oid)))
    }

    async fn store() -> HistoryStore {
        HistoryStore::new("sqlite::memory:").await.unwrap()
    }

    fn executor(exchange: Arc<SimExchange>, mode: ExecutionMode) -> OrderExecutor {
        OrderExecutor::new(exchange, mode, MarginMode::Isolated, dec!(1.0))
    }

    #[tokio::test]
    async fn dry_run_and_live_produce_same_history() {
        // Dry run: no mutating calls, history still FOLLOWING
        let dry_exchange = Arc::new(SimExchange::new());
        dry_exchange.set_mark_price("BTCUSDT", dec!(50000));
        let dry_store = store().await;
        let mut dry = executor(dry_exchange.clone(), ExecutionMode::DryRun);

        let event = dry
            .execute(&dry_store, &enter_plan("oid-1"), dec!(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Entered);
        assert!(event.dry_run);
        assert!(event.order_id.is_none());
        assert_eq!(dry_exchange.mutation_count(), 0);

        let rec = dry_store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Following);
        assert_eq!(rec.entry_oid.as_deref(), Some("oid-1"));

        // Live: same plan, same resulting history, plus the exchange calls
        let live_exchange = Arc::new(SimExchange::new());
        live_exchange.set_mark_price("BTCUSDT", dec!(50000));
        let live_store = store().await;
        let mut live = executor(live_exchange.clone(), ExecutionMode::Live);

        let event = live
            .execute(&live_store, &enter_plan("oid-1"), dec!(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Entered);
        assert!(!event.dry_run);
        assert!(event.order_id.is_some());

        let rec = live_store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Following);
        assert_eq!(rec.entry_oid.as_deref(), Some("oid-1"));

        let calls = live_exchange.calls();
        assert!(matches!(calls[0], SimCall::SetLeverage { leverage: 10, .. }));
        assert!(matches!(calls[1], SimCall::SetMarginMode { .. }));
        assert!(matches!(
            calls[2],
            SimCall::MarketOrder { side: PositionSide::Long, .. }
        ));
    }

    #[tokio::test]
    async fn price_tolerance_band_rejects_stale_signal() {
        let exchange = Arc::new(SimExchange::new());
        // Mark 2% above the agent's entry, tolerance is 1%
        exchange.set_mark_price("BTCUSDT", dec!(51000));
        let store = store().await;
        let mut exec = executor(exchange.clone(), ExecutionMode::Live);

        let result = exec
            .execute(&store, &enter_plan("oid-1"), dec!(100))
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(exchange.mutation_count(), 0);
        assert!(store.record("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfunded_plan_is_skipped() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        let store = store().await;
        let mut exec = executor(exchange.clone(), ExecutionMode::Live);

        let result = exec
            .execute(&store, &enter_plan("oid-1"), Decimal::ZERO)
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(exchange.mutation_count(), 0);
    }

    #[tokio::test]
    async fn replace_updates_history_to_new_oid() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        exchange.set_position(LivePosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: dec!(49000),
            mark_price: dec!(50000),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        });

        let store = store().await;
        store
            .upsert_record("BTCUSDT", "oid-1", None, None, FollowState::Following)
            .await
            .unwrap();

        let mut exec = executor(exchange.clone(), ExecutionMode::Live);
        let plan = FollowPlan::new("BTCUSDT", FollowAction::Replace, Some(agent_position("oid-2")));

        let event = exec.execute(&store, &plan, dec!(100)).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Replaced);

        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.entry_oid.as_deref(), Some("oid-2"));
        assert_eq!(rec.state, FollowState::Following);
    }

    #[tokio::test]
    async fn replace_at_new_leverage_reapplies_it_before_the_new_leg() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        let store = store().await;
        let mut exec = executor(exchange.clone(), ExecutionMode::Live);

        exec.execute(&store, &enter_plan("oid-1"), dec!(100))
            .await
            .unwrap()
            .unwrap();

        exchange.set_position(LivePosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: dec!(50000),
            mark_price: dec!(50000),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        });

        // Agent rolled to a 20x position; leverage must be re-applied on
        // the venue before the replacement leg is sized from it
        let mut pos = agent_position("oid-2");
        pos.leverage = 20;
        let plan = FollowPlan::new("BTCUSDT", FollowAction::Replace, Some(pos));
        let event = exec.execute(&store, &plan, dec!(100)).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Replaced);

        let calls = exchange.calls();
        let relever = calls
            .iter()
            .position(|c| matches!(c, SimCall::SetLeverage { leverage: 20, .. }))
            .expect("leverage re-applied for the replacement leg");
        let new_leg = calls
            .iter()
            .rposition(|c| matches!(c, SimCall::MarketOrder { .. }))
            .unwrap();
        assert!(relever < new_leg);

        // Margin mode is constant per run, set only on first setup
        let mode_calls = calls
            .iter()
            .filter(|c| matches!(c, SimCall::SetMarginMode { .. }))
            .count();
        assert_eq!(mode_calls, 1);
    }

    #[tokio::test]
    async fn replace_open_leg_failure_leaves_unfollowed() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        exchange.set_position(LivePosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: dec!(49000),
            mark_price: dec!(50000),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        });
        exchange.fail_next_order("BTCUSDT");

        let store = store().await;
        store
            .upsert_record("BTCUSDT", "oid-1", None, None, FollowState::Following)
            .await
            .unwrap();

        let mut exec = executor(exchange.clone(), ExecutionMode::Live);
        let plan = FollowPlan::new("BTCUSDT", FollowAction::Replace, Some(agent_position("oid-2")));

        let event = exec.execute(&store, &plan, dec!(100)).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::ReplaceLegFailed);

        // Flat and UNFOLLOWED: picked up as a fresh ENTER next tick
        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Unfollowed);
        assert_eq!(rec.entry_oid, None);
    }

    #[tokio::test]
    async fn replace_close_leg_failure_keeps_old_record() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        // No open position on the venue: the close leg will fail
        let store = store().await;
        store
            .upsert_record("BTCUSDT", "oid-1", None, None, FollowState::Following)
            .await
            .unwrap();

        let mut exec = executor(exchange.clone(), ExecutionMode::Live);
        let plan = FollowPlan::new("BTCUSDT", FollowAction::Replace, Some(agent_position("oid-2")));

        let result = exec.execute(&store, &plan, dec!(100)).await.unwrap();
        assert!(result.is_none());

        // Old identifier never overwritten before the close confirmed
        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.entry_oid.as_deref(), Some("oid-1"));
        assert_eq!(rec.state, FollowState::Following);
    }

    #[tokio::test]
    async fn exit_marks_exited_and_keeps_identifiers() {
        let exchange = Arc::new(SimExchange::new());
        exchange.set_mark_price("BTCUSDT", dec!(50000));
        exchange.set_position(LivePosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: dec!(49000),
            mark_price: dec!(50000),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        });

        let store = store().await;
        store
            .upsert_record("BTCUSDT", "oid-1", None, None, FollowState::Following)
            .await
            .unwrap();

        let mut exec = executor(exchange.clone(), ExecutionMode::Live);
        let plan = FollowPlan::new("BTCUSDT", FollowAction::Exit, None);

        let event = exec.execute(&store, &plan, Decimal::ZERO).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Exited);

        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Exited);
        assert_eq!(rec.entry_oid.as_deref(), Some("oid-1"));
    }
}
