//! Rebalance planning and execution.
//!
//! Planning is pure: deltas toward target, conjunctive threshold filters,
//! and decreases-before-increases ordering. Execution walks the plan through
//! the exchange adapter; a failed adjustment is counted, never fatal.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::HistoryStore;
use crate::domain::{
    AdjustmentDirection, AdjustmentRecord, Decimal, Position, TriggerType,
};
use crate::exchange::ExchangeAdapter;

/// Intent to move one position's margin by a signed delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentPlan {
    pub symbol: String,
    pub current_margin: Decimal,
    pub target_margin: Decimal,
    pub delta: Decimal,
}

impl AdjustmentPlan {
    pub fn is_increase(&self) -> bool {
        self.delta.is_positive()
    }
}

/// Result of executing a plan sequence.
#[derive(Debug, Clone, Default)]
pub struct RebalanceOutcome {
    pub success_count: usize,
    pub fail_count: usize,
    pub total_adjusted: Decimal,
    pub records: Vec<AdjustmentRecord>,
}

impl RebalanceOutcome {
    pub fn touched_anything(&self) -> bool {
        self.success_count > 0 || self.fail_count > 0
    }
}

/// Deltas toward target, filtered by both thresholds.
///
/// A plan survives only if `|delta| >= min_adjustment` AND (when margin is
/// positive) `|delta| / margin * 100 >= min_deviation_pct`.
pub fn compute_plans(
    positions: &[Position],
    targets: &BTreeMap<String, Decimal>,
    min_adjustment: Decimal,
    min_deviation_pct: Decimal,
) -> Vec<AdjustmentPlan> {
    let mut plans = Vec::new();
    for position in positions {
        let Some(&target) = targets.get(&position.symbol) else {
            continue;
        };
        let delta = target - position.margin;
        let abs_delta = delta.abs();

        if abs_delta < min_adjustment {
            continue;
        }
        if position.margin.is_positive() {
            let deviation_pct = abs_delta / position.margin * Decimal::ONE_HUNDRED;
            if deviation_pct < min_deviation_pct {
                continue;
            }
        }

        plans.push(AdjustmentPlan {
            symbol: position.symbol.clone(),
            current_margin: position.margin,
            target_margin: target,
            delta,
        });
    }
    plans
}

/// Decreases first (largest |delta| leading), then increases (smallest
/// first), so freed collateral lands on the account before it is spent.
pub fn sort_plans(mut plans: Vec<AdjustmentPlan>) -> Vec<AdjustmentPlan> {
    let (mut decreases, mut increases): (Vec<_>, Vec<_>) =
        plans.drain(..).partition(|p| !p.is_increase());
    decreases.sort_by(|a, b| b.delta.abs().cmp(&a.delta.abs()));
    increases.sort_by(|a, b| a.delta.cmp(&b.delta));
    decreases.extend(increases);
    decreases
}

/// Executes adjustment plans against the exchange and records outcomes.
pub struct Rebalancer {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeAdapter>,
    history: Arc<HistoryStore>,
}

impl Rebalancer {
    pub fn new(
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeAdapter>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            config,
            exchange,
            history,
        }
    }

    fn min_adjustment(&self) -> Decimal {
        Decimal::from_f64_lossy(self.config.thresholds.min_adjustment_usdt)
    }

    fn min_deviation_pct(&self) -> Decimal {
        Decimal::from_f64_lossy(self.config.thresholds.min_deviation_pct)
    }

    /// Plan against the targets and execute in safe order.
    pub async fn execute(
        &self,
        positions: &[Position],
        targets: &BTreeMap<String, Decimal>,
        trigger: TriggerType,
    ) -> RebalanceOutcome {
        let plans = sort_plans(compute_plans(
            positions,
            targets,
            self.min_adjustment(),
            self.min_deviation_pct(),
        ));
        if plans.is_empty() {
            return RebalanceOutcome::default();
        }
        self.run_plans(plans, trigger).await
    }

    /// Top a critical position up toward twice the emergency margin rate,
    /// spending at most the free balance. Never touches other positions.
    pub async fn emergency_top_up(
        &self,
        critical: &Position,
        available_balance: Decimal,
    ) -> RebalanceOutcome {
        let target_rate =
            Decimal::from_f64_lossy(self.config.thresholds.emergency_margin_rate * 2.0);
        if critical.margin_rate() >= target_rate {
            return RebalanceOutcome::default();
        }

        let needed = critical.notional() * target_rate / Decimal::ONE_HUNDRED;
        let delta = (needed - critical.margin).min(available_balance);
        if delta < self.min_adjustment() {
            info!(
                symbol = %critical.symbol,
                %delta,
                "emergency top-up below minimum adjustment, skipping"
            );
            return RebalanceOutcome::default();
        }

        let plan = AdjustmentPlan {
            symbol: critical.symbol.clone(),
            current_margin: critical.margin,
            target_margin: critical.margin + delta,
            delta,
        };
        self.run_plans(vec![plan], TriggerType::Emergency).await
    }

    async fn run_plans(
        &self,
        plans: Vec<AdjustmentPlan>,
        trigger: TriggerType,
    ) -> RebalanceOutcome {
        let mut outcome = RebalanceOutcome::default();

        for plan in plans {
            let full_symbol = self.exchange.full_symbol(&plan.symbol);
            let ok = self.exchange.adjust_margin(&full_symbol, plan.delta).await;

            if !ok {
                warn!(symbol = %plan.symbol, delta = %plan.delta, "margin adjustment failed");
                outcome.fail_count += 1;
                continue;
            }

            outcome.success_count += 1;
            outcome.total_adjusted += plan.delta.abs();

            let record = AdjustmentRecord {
                timestamp: Utc::now(),
                symbol: plan.symbol.clone(),
                direction: if plan.is_increase() {
                    AdjustmentDirection::Increase
                } else {
                    AdjustmentDirection::Decrease
                },
                amount: plan.delta.abs(),
                before_margin: plan.current_margin,
                after_margin: plan.target_margin,
                trigger,
            };
            if let Err(e) = self.history.record_adjustment(&record).await {
                warn!(symbol = %plan.symbol, "history insert failed: {e}");
            }
            outcome.records.push(record);
        }

        info!(
            success = outcome.success_count,
            failed = outcome.fail_count,
            moved = %outcome.total_adjusted,
            "rebalance pass complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionSide;

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    fn position(symbol: &str, margin: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: dec("1"),
            entry_price: dec("100"),
            current_price: dec("100"),
            margin: dec(margin),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn plan(symbol: &str, delta: &str) -> AdjustmentPlan {
        AdjustmentPlan {
            symbol: symbol.to_string(),
            current_margin: dec("100"),
            target_margin: dec("100") + dec(delta),
            delta: dec(delta),
        }
    }

    #[test]
    fn small_absolute_delta_is_dropped() {
        let positions = vec![position("BTC", "490")];
        let targets = BTreeMap::from([("BTC".to_string(), dec("500"))]);
        let plans = compute_plans(&positions, &targets, dec("50"), dec("5"));
        assert!(plans.is_empty());
    }

    #[test]
    fn small_relative_delta_is_dropped() {
        // |delta| = 60 passes the absolute bar but is only 3% of margin 2000.
        let positions = vec![position("BTC", "2000")];
        let targets = BTreeMap::from([("BTC".to_string(), dec("2060"))]);
        let plans = compute_plans(&positions, &targets, dec("50"), dec("5"));
        assert!(plans.is_empty());
    }

    #[test]
    fn zero_margin_skips_relative_filter() {
        let positions = vec![position("NEW", "0")];
        let targets = BTreeMap::from([("NEW".to_string(), dec("75"))]);
        let plans = compute_plans(&positions, &targets, dec("50"), dec("5"));
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].delta, dec("75"));
    }

    #[test]
    fn passing_both_filters_survives() {
        let positions = vec![position("BTC", "400")];
        let targets = BTreeMap::from([("BTC".to_string(), dec("327.87"))]);
        let plans = compute_plans(&positions, &targets, dec("50"), dec("5"));
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].delta, dec("-72.13"));
        assert!(!plans[0].is_increase());
    }

    #[test]
    fn sort_puts_all_decreases_before_increases() {
        let sorted = sort_plans(vec![
            plan("A", "50"),
            plan("B", "-120"),
            plan("C", "200"),
            plan("D", "-30"),
        ]);
        let deltas: Vec<Decimal> = sorted.iter().map(|p| p.delta).collect();
        assert_eq!(
            deltas,
            vec![dec("-120"), dec("-30"), dec("50"), dec("200")]
        );
    }

    #[test]
    fn sort_invariant_any_decrease_precedes_any_increase() {
        let sorted = sort_plans(vec![
            plan("A", "10"),
            plan("B", "-1"),
            plan("C", "9999"),
            plan("D", "-5000"),
            plan("E", "3"),
        ]);
        let last_decrease = sorted.iter().rposition(|p| !p.is_increase()).unwrap();
        let first_increase = sorted.iter().position(|p| p.is_increase()).unwrap();
        assert!(last_decrease < first_increase);
    }

    #[test]
    fn idempotent_when_margins_match_targets() {
        let positions = vec![position("BTC", "500"), position("ETH", "300")];
        let targets = BTreeMap::from([
            ("BTC".to_string(), dec("500")),
            ("ETH".to_string(), dec("300")),
        ]);
        assert!(compute_plans(&positions, &targets, dec("50"), dec("5")).is_empty());
    }
}
