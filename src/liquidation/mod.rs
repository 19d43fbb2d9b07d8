//! Partial-close planning when total collateral cannot keep every position
//! above the safety buffer.
//!
//! The deficit model treats `notional * maintenance_rate * safety_multiplier`
//! as the per-position minimum safe margin; the shortfall against current
//! margin plus free balance is the gap the planner works off, lowest-priority
//! positions first.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::HistoryStore;
use crate::domain::{Decimal, LiquidationRecord, Position};
use crate::exchange::ExchangeAdapter;

/// Intent to partially close one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationPlan {
    pub symbol: String,
    pub side: crate::domain::PositionSide,
    pub current_quantity: Decimal,
    pub close_quantity: Decimal,
    pub current_price: Decimal,
    pub estimated_release: Decimal,
}

/// Why a liquidation pass did or did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationReason {
    Disabled,
    InCooldown,
    NoGap,
    DryRun,
    Executed { success_count: usize },
}

impl std::fmt::Display for LiquidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiquidationReason::Disabled => write!(f, "liquidation disabled"),
            LiquidationReason::InCooldown => write!(f, "in cooldown period"),
            LiquidationReason::NoGap => write!(f, "no margin gap"),
            LiquidationReason::DryRun => write!(f, "dry run mode"),
            LiquidationReason::Executed { success_count } => {
                write!(f, "executed {success_count} partial closes")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiquidationOutcome {
    pub executed: bool,
    pub reason: LiquidationReason,
    pub plans: Vec<LiquidationPlan>,
    pub success_count: usize,
    pub fail_count: usize,
    pub total_released: Decimal,
}

impl LiquidationOutcome {
    fn skipped(reason: LiquidationReason) -> Self {
        Self {
            executed: false,
            reason,
            plans: Vec::new(),
            success_count: 0,
            fail_count: 0,
            total_released: Decimal::ZERO,
        }
    }

    /// Anything worth alerting about: a pending plan or an execution.
    pub fn noteworthy(&self) -> bool {
        self.executed || !self.plans.is_empty()
    }
}

/// Plans and executes partial closes, gated by enable flag, cooldown, and
/// dry-run.
pub struct Liquidator {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeAdapter>,
    history: Arc<HistoryStore>,
    dry_run_override: bool,
    /// Wall time of the last successful liquidation. Never persisted.
    last_liquidation_at: Mutex<Option<Instant>>,
}

impl Liquidator {
    pub fn new(
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeAdapter>,
        history: Arc<HistoryStore>,
        dry_run_override: bool,
    ) -> Self {
        Self {
            config,
            exchange,
            history,
            dry_run_override,
            last_liquidation_at: Mutex::new(None),
        }
    }

    fn dry_run(&self) -> bool {
        self.dry_run_override || self.config.liquidation.dry_run
    }

    fn cooldown_passed(&self) -> bool {
        let last = self.last_liquidation_at.lock().unwrap();
        match *last {
            None => true,
            Some(at) => at.elapsed().as_secs() >= self.config.liquidation.cooldown_seconds,
        }
    }

    /// Collateral shortfall against the safety buffer; zero when covered.
    pub fn margin_gap(&self, positions: &[Position], available_balance: Decimal) -> Decimal {
        let total_notional: Decimal = positions.iter().map(|p| p.notional()).sum();
        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();

        let min_safe = total_notional
            * Decimal::from_f64_lossy(self.config.liquidation.maintenance_margin_rate)
            * Decimal::from_f64_lossy(self.config.liquidation.safety_margin_multiplier);

        (min_safe - total_margin - available_balance).max(Decimal::ZERO)
    }

    /// Build plans sized to the gap, priority order, each clamped to the
    /// single-close cap.
    fn build_plans(&self, positions: &[Position], gap: Decimal) -> Vec<LiquidationPlan> {
        let mut by_priority: Vec<&Position> = positions.iter().collect();
        by_priority.sort_by_key(|p| self.config.position_priority(&p.symbol));

        let max_close_ratio =
            Decimal::from_f64_lossy(self.config.liquidation.max_single_close_pct)
                / Decimal::ONE_HUNDRED;

        let mut plans = Vec::new();
        let mut remaining_gap = gap;

        for position in by_priority {
            if !remaining_gap.is_positive() {
                break;
            }
            if position.quantity.is_zero() {
                continue;
            }

            let max_close_qty = position.quantity * max_close_ratio;
            let qty_for_release = if position.margin.is_positive() {
                let margin_per_unit = position.margin / position.quantity;
                remaining_gap / margin_per_unit
            } else {
                max_close_qty
            };
            let close_quantity = max_close_qty.min(qty_for_release);
            if close_quantity.is_zero() {
                continue;
            }

            let estimated_release = close_quantity / position.quantity * position.margin;

            plans.push(LiquidationPlan {
                symbol: position.symbol.clone(),
                side: position.side,
                current_quantity: position.quantity,
                close_quantity,
                current_price: position.current_price,
                estimated_release,
            });
            remaining_gap -= estimated_release;
        }
        plans
    }

    /// Evaluate the gap and, when gated conditions allow, close positions.
    pub async fn execute_if_needed(
        &self,
        positions: &[Position],
        available_balance: Decimal,
    ) -> LiquidationOutcome {
        if !self.config.liquidation.enabled {
            return LiquidationOutcome::skipped(LiquidationReason::Disabled);
        }
        if !self.cooldown_passed() {
            return LiquidationOutcome::skipped(LiquidationReason::InCooldown);
        }

        let gap = self.margin_gap(positions, available_balance);
        if !gap.is_positive() {
            return LiquidationOutcome::skipped(LiquidationReason::NoGap);
        }

        let plans = self.build_plans(positions, gap);
        info!(%gap, plan_count = plans.len(), "margin gap detected");

        if self.dry_run() {
            return LiquidationOutcome {
                executed: false,
                reason: LiquidationReason::DryRun,
                plans,
                success_count: 0,
                fail_count: 0,
                total_released: Decimal::ZERO,
            };
        }

        let mut success_count = 0;
        let mut fail_count = 0;
        let mut total_released = Decimal::ZERO;

        for plan in &plans {
            let full_symbol = self.exchange.full_symbol(&plan.symbol);
            let ok = self
                .exchange
                .close_position(&full_symbol, plan.side, plan.close_quantity)
                .await;

            if !ok {
                warn!(symbol = %plan.symbol, "partial close failed");
                fail_count += 1;
                continue;
            }

            success_count += 1;
            total_released += plan.estimated_release;

            let record = LiquidationRecord {
                timestamp: Utc::now(),
                symbol: plan.symbol.clone(),
                side: plan.side,
                quantity: plan.close_quantity,
                price: plan.current_price,
                released_margin: plan.estimated_release,
                reason: format!("margin gap: {gap}"),
            };
            if let Err(e) = self.history.record_liquidation(&record).await {
                warn!(symbol = %plan.symbol, "history insert failed: {e}");
            }
        }

        if success_count > 0 {
            let mut last = self.last_liquidation_at.lock().unwrap();
            *last = Some(Instant::now());
        }

        LiquidationOutcome {
            executed: true,
            reason: LiquidationReason::Executed { success_count },
            plans,
            success_count,
            fail_count,
            total_released,
        }
    }

    #[cfg(test)]
    fn force_cooldown(&self) {
        let mut last = self.last_liquidation_at.lock().unwrap();
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::PositionSide;
    use crate::exchange::MockExchange;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    fn doge_position() -> Position {
        Position {
            symbol: "DOGE".to_string(),
            side: PositionSide::Long,
            quantity: dec("10000"),
            entry_price: dec("0.1"),
            current_price: dec("0.1"),
            margin: dec("10"),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn config(raw_extra: &str) -> Arc<Config> {
        let raw = format!(
            r#"
            [bitfinex]
            api_key = "k"
            api_secret = "s"
            {raw_extra}
            "#
        );
        Arc::new(Config::from_toml_str(&raw, &HashMap::new()).unwrap())
    }

    async fn history() -> (Arc<HistoryStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.unwrap();
        (Arc::new(HistoryStore::new(pool)), temp_dir)
    }

    fn liquidator(
        config: Arc<Config>,
        exchange: Arc<MockExchange>,
        history: Arc<HistoryStore>,
    ) -> Liquidator {
        Liquidator::new(config, exchange, history, false)
    }

    #[tokio::test]
    async fn golden_gap_plan_in_dry_run() {
        // notional 1000, min_safe 15, margin 10, available 0 -> gap 5.
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(config(""), exchange.clone(), store);

        let outcome = liq
            .execute_if_needed(&[doge_position()], Decimal::ZERO)
            .await;

        assert!(!outcome.executed);
        assert_eq!(outcome.reason, LiquidationReason::DryRun);
        assert_eq!(outcome.plans.len(), 1);
        let plan = &outcome.plans[0];
        // qty_for_release 5000, clamped by 25% cap to 2500.
        assert_eq!(plan.close_quantity, dec("2500"));
        assert_eq!(plan.estimated_release, dec("2.5"));
        assert!(exchange.close_calls().is_empty());
    }

    #[tokio::test]
    async fn no_gap_means_no_plans() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(config(""), exchange.clone(), store);

        let mut position = doge_position();
        position.margin = dec("20");
        let outcome = liq.execute_if_needed(&[position], Decimal::ZERO).await;

        assert_eq!(outcome.reason, LiquidationReason::NoGap);
        assert!(outcome.plans.is_empty());
        assert!(exchange.close_calls().is_empty());
    }

    #[tokio::test]
    async fn cooldown_blocks_execution() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(
            config("[liquidation]\ndry_run = false"),
            exchange.clone(),
            store,
        );
        liq.force_cooldown();

        let outcome = liq
            .execute_if_needed(&[doge_position()], Decimal::ZERO)
            .await;

        assert_eq!(outcome.reason, LiquidationReason::InCooldown);
        assert!(exchange.close_calls().is_empty());
    }

    #[tokio::test]
    async fn disabled_skips_everything() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(
            config("[liquidation]\nenabled = false"),
            exchange.clone(),
            store,
        );

        let outcome = liq
            .execute_if_needed(&[doge_position()], Decimal::ZERO)
            .await;
        assert_eq!(outcome.reason, LiquidationReason::Disabled);
    }

    #[tokio::test]
    async fn real_mode_closes_and_records() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(
            config("[liquidation]\ndry_run = false"),
            exchange.clone(),
            store.clone(),
        );

        let outcome = liq
            .execute_if_needed(&[doge_position()], Decimal::ZERO)
            .await;

        assert!(outcome.executed);
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.total_released, dec("2.5"));

        let calls = exchange.close_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].full_symbol, "tDOGEF0:USTF0");
        assert_eq!(calls[0].quantity, dec("2500"));

        let records = store.list_liquidations().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].released_margin, dec("2.5"));

        // The cooldown clock advanced: an immediate second pass is blocked.
        let outcome2 = liq
            .execute_if_needed(&[doge_position()], Decimal::ZERO)
            .await;
        assert_eq!(outcome2.reason, LiquidationReason::InCooldown);
    }

    #[tokio::test]
    async fn close_quantity_never_exceeds_cap() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(config(""), exchange, store);

        // Huge gap: still clamped to 25% of quantity.
        let mut position = doge_position();
        position.margin = dec("1");
        let outcome = liq.execute_if_needed(&[position], Decimal::ZERO).await;

        for plan in &outcome.plans {
            assert!(plan.close_quantity <= plan.current_quantity * dec("0.25"));
        }
    }

    #[tokio::test]
    async fn zero_margin_position_uses_max_close_qty() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let liq = liquidator(config(""), exchange, store);

        let mut position = doge_position();
        position.margin = Decimal::ZERO;
        let outcome = liq.execute_if_needed(&[position], Decimal::ZERO).await;

        assert_eq!(outcome.plans.len(), 1);
        assert_eq!(outcome.plans[0].close_quantity, dec("2500"));
        assert_eq!(outcome.plans[0].estimated_release, Decimal::ZERO);
    }

    #[tokio::test]
    async fn priority_orders_the_plan_walk() {
        let (store, _temp) = history().await;
        let exchange = Arc::new(MockExchange::new());
        let raw = "[position_priority]\nDOGE = 1\nBTC = 90\ndefault = 50";
        let liq = liquidator(config(raw), exchange, store);

        let btc = Position {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: dec("1"),
            entry_price: dec("50000"),
            current_price: dec("50000"),
            margin: dec("100"),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        };
        let outcome = liq
            .execute_if_needed(&[btc, doge_position()], Decimal::ZERO)
            .await;

        assert!(outcome.plans.len() >= 2);
        assert_eq!(outcome.plans[0].symbol, "DOGE");
    }
}
