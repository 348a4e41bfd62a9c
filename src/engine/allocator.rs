//! Capital allocation: how much margin each symbol gets this tick.
//!
//! Allocations are rebuilt from scratch every tick; nothing is reserved
//! across ticks, so capital freed by a shrinking symbol set is available
//! again on the next pass.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;

/// Funding mode, selected once per run.
#[derive(Debug, Clone)]
pub enum FundingMode {
    /// Split a total margin budget across the symbols needing capital,
    /// evenly or by per-symbol weight (missing weights default to 1).
    Proportional {
        total_margin: Decimal,
        weights: HashMap<String, Decimal>,
    },

    /// Every symbol requests the same fixed amount; requests are funded in
    /// full or not at all, first-come first-funded against the available
    /// balance.
    FixedPerCoin { amount: Decimal },
}

/// Computes the per-symbol margin map for one tick.
pub struct CapitalAllocator {
    mode: FundingMode,
}

impl CapitalAllocator {
    pub fn new(mode: FundingMode) -> Self {
        Self { mode }
    }

    /// Whether allocation needs the account's available balance.
    pub fn needs_balance(&self) -> bool {
        matches!(self.mode, FundingMode::FixedPerCoin { .. })
    }

    /// Allocate margin to `symbols`, in the given (deterministic) order.
    /// `available_balance` is only consulted in fixed-per-coin mode.
    pub fn allocate(
        &self,
        symbols: &[String],
        available_balance: Decimal,
    ) -> HashMap<String, Decimal> {
        if symbols.is_empty() {
            return HashMap::new();
        }

        match &self.mode {
            FundingMode::Proportional {
                total_margin,
                weights,
            } => {
                let total_weight: Decimal = symbols
                    .iter()
                    .map(|s| weights.get(s).copied().unwrap_or(Decimal::ONE))
                    .sum();

                if total_weight.is_zero() {
                    return symbols.iter().map(|s| (s.clone(), Decimal::ZERO)).collect();
                }

                symbols
                    .iter()
                    .map(|s| {
                        let weight = weights.get(s).copied().unwrap_or(Decimal::ONE);
                        (s.clone(), *total_margin * weight / total_weight)
                    })
                    .collect()
            }

            FundingMode::FixedPerCoin { amount } => {
                let mut committed = Decimal::ZERO;
                let mut allocation = HashMap::new();

                for symbol in symbols {
                    if committed + *amount <= available_balance {
                        committed += *amount;
                        allocation.insert(symbol.clone(), *amount);
                    } else {
                        debug!(
                            symbol = %symbol,
                            requested = %amount,
                            remaining = %(available_balance - committed),
                            "Request not funded, insufficient balance"
                        );
                        allocation.insert(symbol.clone(), Decimal::ZERO);
                    }
                }

                allocation
            }
        }
    }
}
