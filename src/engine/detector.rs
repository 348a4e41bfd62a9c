//! Signal detector: classifies each symbol by comparing the latest agent
//! snapshot against the order-history store.
//!
//! Classification is a pure function of (history record, observed position),
//! so re-polling the same snapshot is side-effect free: the second pass
//! classifies everything as NONE.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::db::{FollowState, HistoryRecord};
use crate::models::{AgentPosition, FollowAction, FollowPlan};

/// Stateless classifier for per-symbol follow decisions.
pub struct SignalDetector {
    auto_re_follow: bool,
}

impl SignalDetector {
    pub fn new(auto_re_follow: bool) -> Self {
        Self { auto_re_follow }
    }

    /// Classify one symbol. Rules in precedence order:
    ///
    /// 1. no position, no history: NONE
    /// 2. position, no history or UNFOLLOWED: ENTER
    /// 3. position, FOLLOWING, entry OID changed: REPLACE
    /// 4. position, FOLLOWING, same OID, price past TP/SL threshold: TP_SL_CLOSE
    /// 5. no position, FOLLOWING: EXIT
    /// 6. otherwise NONE (EXITED re-enters only with auto-re-follow and a
    ///    new entry OID)
    pub fn classify(
        &self,
        history: Option<&HistoryRecord>,
        position: Option<&AgentPosition>,
    ) -> FollowAction {
        match (history, position) {
            (None, None) => FollowAction::None,

            (None, Some(_)) => FollowAction::Enter,

            (Some(rec), Some(pos)) => match rec.state {
                FollowState::Unfollowed => FollowAction::Enter,
                FollowState::Following => {
                    if rec.entry_oid.as_deref() != Some(pos.entry_oid.as_str()) {
                        FollowAction::Replace
                    } else if pos.crossed_exit_threshold(pos.mark_price) {
                        FollowAction::TpSlClose
                    } else {
                        FollowAction::None
                    }
                }
                FollowState::Exited => {
                    let new_oid = rec.entry_oid.as_deref() != Some(pos.entry_oid.as_str());
                    if self.auto_re_follow && new_oid {
                        FollowAction::Enter
                    } else {
                        FollowAction::None
                    }
                }
            },

            (Some(rec), None) => {
                if rec.state == FollowState::Following {
                    FollowAction::Exit
                } else {
                    FollowAction::None
                }
            }
        }
    }

    /// Build the tick's follow plans: every snapshot symbol in order, then
    /// history-only symbols (agent no longer holds them) for exit checks.
    /// NONE classifications are dropped.
    pub fn build_plans(
        &self,
        records: &HashMap<String, HistoryRecord>,
        snapshot: &BTreeMap<String, AgentPosition>,
    ) -> Vec<FollowPlan> {
        let mut plans = Vec::new();

        for (symbol, position) in snapshot {
            let action = self.classify(records.get(symbol), Some(position));
            debug!(symbol = %symbol, action = %action, "Classified");
            if action != FollowAction::None {
                plans.push(FollowPlan::new(symbol.clone(), action, Some(position.clone())));
            }
        }

        let mut gone: Vec<&String> = records
            .keys()
            .filter(|s| !snapshot.contains_key(*s))
            .collect();
        gone.sort();

        for symbol in gone {
            let action = self.classify(records.get(symbol), None);
            if action != FollowAction::None {
                plans.push(FollowPlan::new(symbol.clone(), action, None));
            }
        }

        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::models::ExitPlan;

    fn record(entry_oid: &str, state: FollowState) -> HistoryRecord {
        HistoryRecord {
            symbol: "BTCUSDT".to_string(),
            entry_oid: Some(entry_oid.to_string()),
            tp_oid: None,
            sl_oid: None,
            state,
            updated_at: Utc::now(),
            last_event_at: None,
        }
    }

    fn position(entry_oid: &str, mark: Decimal) -> AgentPosition {
        AgentPosition {
            symbol: "BTCUSDT".to_string(),
            quantity: dec!(0.5),
            entry_price: dec!(50000),
            leverage: 10,
            mark_price: mark,
            unrealized_pnl: Decimal::ZERO,
            margin: dec!(100),
            entry_oid: entry_oid.to_string(),
            tp_oid: None,
            sl_oid: None,
            exit_plan: ExitPlan {
                profit_target: Some(dec!(60000)),
                stop_loss: Some(dec!(45000)),
                invalidation: None,
            },
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn classification_table() {
        let det = SignalDetector::new(false);
        let pos = position("oid-1", dec!(51000));
        let past_tp = position("oid-1", dec!(60000));
        let new_oid = position("oid-2", dec!(51000));

        // 1. nothing anywhere
        assert_eq!(det.classify(None, None), FollowAction::None);
        // 2. fresh position
        assert_eq!(det.classify(None, Some(&pos)), FollowAction::Enter);
        assert_eq!(
            det.classify(Some(&record("oid-0", FollowState::Unfollowed)), Some(&pos)),
            FollowAction::Enter
        );
        // 3. OID changed while following
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Following)), Some(&new_oid)),
            FollowAction::Replace
        );
        // 4. same OID, price past threshold
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Following)), Some(&past_tp)),
            FollowAction::TpSlClose
        );
        // same OID, inside thresholds
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Following)), Some(&pos)),
            FollowAction::None
        );
        // 5. agent closed
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Following)), None),
            FollowAction::Exit
        );
        // 6. unfollowed and absent, exited and absent
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Unfollowed)), None),
            FollowAction::None
        );
        assert_eq!(
            det.classify(Some(&record("oid-1", FollowState::Exited)), None),
            FollowAction::None
        );
    }

    #[test]
    fn idempotent_on_unchanged_snapshot() {
        let det = SignalDetector::new(false);
        let rec = record("oid-1", FollowState::Following);
        let pos = position("oid-1", dec!(51000));

        assert_eq!(det.classify(Some(&rec), Some(&pos)), FollowAction::None);
        // Same inputs again: same answer, nothing to execute
        assert_eq!(det.classify(Some(&rec), Some(&pos)), FollowAction::None);
    }

    #[test]
    fn exited_re_entry_needs_flag_and_new_oid() {
        let rec = record("oid-1", FollowState::Exited);
        let same = position("oid-1", dec!(51000));
        let fresh = position("oid-2", dec!(51000));

        let passive = SignalDetector::new(false);
        assert_eq!(passive.classify(Some(&rec), Some(&fresh)), FollowAction::None);

        let refollow = SignalDetector::new(true);
        assert_eq!(refollow.classify(Some(&rec), Some(&fresh)), FollowAction::Enter);
        assert_eq!(refollow.classify(Some(&rec), Some(&same)), FollowAction::None);
    }

    #[test]
    fn plans_cover_snapshot_then_departed_symbols() {
        let det = SignalDetector::new(false);

        let mut records = HashMap::new();
        let mut gone = record("oid-9", FollowState::Following);
        gone.symbol = "ETHUSDT".to_string();
        records.insert("ETHUSDT".to_string(), gone);

        let mut snapshot = BTreeMap::new();
        snapshot.insert("BTCUSDT".to_string(), position("oid-1", dec!(51000)));

        let plans = det.build_plans(&records, &snapshot);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].symbol, "BTCUSDT");
        assert_eq!(plans[0].action, FollowAction::Enter);
        assert_eq!(plans[1].symbol, "ETHUSDT");
        assert_eq!(plans[1].action, FollowAction::Exit);
    }
}
