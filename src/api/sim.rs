//! Deterministic in-memory fakes for the signal feed and the exchange.
//!
//! Used by the test suite to exercise the full tick path without a network.
//! The fake exchange records every call it receives so tests can assert on
//! exactly which operations ran, and individual order placements can be
//! scripted to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{AgentPosition, PositionSide};

use super::{AgentMeta, Exchange, LivePosition, MarginMode, SignalSource};

/// In-memory signal source serving a settable snapshot.
#[derive(Default)]
pub struct SimSignalSource {
    snapshot: Mutex<BTreeMap<String, AgentPosition>>,
    agents: Vec<AgentMeta>,
    fail_next: AtomicBool,
}

impl SimSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot the next fetch returns.
    pub fn set_snapshot(&self, positions: Vec<AgentPosition>) {
        let map = positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        *self.snapshot.lock().expect("snapshot lock") = map;
    }

    pub fn clear(&self) {
        self.snapshot.lock().expect("snapshot lock").clear();
    }

    /// Make the next fetch fail, as a feed outage would.
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalSource for SimSignalSource {
    async fn fetch_snapshot(
        &self,
        _agent_id: &str,
        _marker: Option<&str>,
    ) -> Result<BTreeMap<String, AgentPosition>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("Scripted feed outage");
        }
        Ok(self.snapshot.lock().expect("snapshot lock").clone())
    }

    async fn list_agents(&self) -> Result<Vec<AgentMeta>> {
        Ok(self.agents.clone())
    }
}

/// A call the fake exchange received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    SetLeverage { symbol: String, leverage: u32 },
    SetMarginMode { symbol: String, mode: MarginMode },
    MarketOrder { symbol: String, side: PositionSide, quantity: Decimal },
    ClosePosition { symbol: String },
}

#[derive(Default)]
struct SimState {
    marks: HashMap<String, Decimal>,
    positions: HashMap<String, LivePosition>,
    balance: Decimal,
    calls: Vec<SimCall>,
    fail_orders: HashSet<String>,
    fail_closes: HashSet<String>,
    next_order_id: u64,
}

/// In-memory exchange with scripted prices, balance, and failures.
#[derive(Default)]
pub struct SimExchange {
    state: Mutex<SimState>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .expect("sim lock")
            .marks
            .insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().expect("sim lock").balance = balance;
    }

    pub fn set_position(&self, position: LivePosition) {
        self.state
            .lock()
            .expect("sim lock")
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub fn clear_position(&self, symbol: &str) {
        self.state.lock().expect("sim lock").positions.remove(symbol);
    }

    /// Make the next market order for `symbol` fail with a rejection.
    pub fn fail_next_order(&self, symbol: &str) {
        self.state
            .lock()
            .expect("sim lock")
            .fail_orders
            .insert(symbol.to_string());
    }

    /// Make the next close for `symbol` fail.
    pub fn fail_next_close(&self, symbol: &str) {
        self.state
            .lock()
            .expect("sim lock")
            .fail_closes
            .insert(symbol.to_string());
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().expect("sim lock").calls.clone()
    }

    /// Number of exchange-mutating calls received.
    pub fn mutation_count(&self) -> usize {
        self.calls().len()
    }
}

#[async_trait]
impl Exchange for SimExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.state
            .lock()
            .expect("sim lock")
            .calls
            .push(SimCall::SetLeverage {
                symbol: symbol.to_string(),
                leverage,
            });
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        self.state
            .lock()
            .expect("sim lock")
            .calls
            .push(SimCall::SetMarginMode {
                symbol: symbol.to_string(),
                mode,
            });
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> Result<String> {
        let mut state = self.state.lock().expect("sim lock");

        state.calls.push(SimCall::MarketOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
        });

        if state.fail_orders.remove(symbol) {
            bail!("Order rejected: insufficient margin for {}", symbol);
        }

        let mark = state
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("No mark price for {}", symbol))?;

        state.next_order_id += 1;
        let order_id = format!("sim-{}", state.next_order_id);

        state.positions.insert(
            symbol.to_string(),
            LivePosition {
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price: mark,
                mark_price: mark,
                leverage: 1,
                unrealized_pnl: Decimal::ZERO,
            },
        );

        Ok(order_id)
    }

    async fn close_position(&self, symbol: &str) -> Result<String> {
        let mut state = self.state.lock().expect("sim lock");

        state.calls.push(SimCall::ClosePosition {
            symbol: symbol.to_string(),
        });

        if state.fail_closes.remove(symbol) {
            bail!("Close rejected for {}", symbol);
        }

        if state.positions.remove(symbol).is_none() {
            bail!("No open position for {}", symbol);
        }

        state.next_order_id += 1;
        Ok(format!("sim-{}", state.next_order_id))
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        self.state
            .lock()
            .expect("sim lock")
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("No mark price for {}", symbol))
    }

    async fn open_position(&self, symbol: &str) -> Result<Option<LivePosition>> {
        Ok(self
            .state
            .lock()
            .expect("sim lock")
            .positions
            .get(symbol)
            .cloned())
    }

    async fn available_balance(&self) -> Result<Decimal> {
        Ok(self.state.lock().expect("sim lock").balance)
    }
}
