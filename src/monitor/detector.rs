//! Emergency condition checks over snapshots and streamed prices.
//!
//! The detector only observes and emits signals; acting on them is the
//! controller's job. It owns the last-price table and the account-warning
//! latch (one warning per crossing, reset on recovery).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::Config;
use crate::domain::{Decimal, EmergencySignal, Position};

#[derive(Debug)]
pub struct EventDetector {
    config: Arc<Config>,
    last_prices: Mutex<HashMap<String, Decimal>>,
    account_warning_sent: AtomicBool,
}

impl EventDetector {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            last_prices: Mutex::new(HashMap::new()),
            account_warning_sent: AtomicBool::new(false),
        }
    }

    /// Flag positions under the emergency margin rate and, once per
    /// crossing, the account-wide warning level.
    pub fn check_snapshot(
        &self,
        positions: &[Position],
        available_balance: Decimal,
    ) -> Vec<EmergencySignal> {
        let mut signals = Vec::new();

        let emergency_rate =
            Decimal::from_f64_lossy(self.config.thresholds.emergency_margin_rate);
        for position in positions {
            if position.margin_rate() < emergency_rate {
                warn!(
                    symbol = %position.symbol,
                    margin_rate = %position.margin_rate(),
                    "position under emergency margin rate"
                );
                signals.push(EmergencySignal::PositionBelowThreshold {
                    symbol: position.symbol.clone(),
                });
            }
        }

        if let Some(signal) = self.check_account_rate(positions, available_balance) {
            signals.push(signal);
        }
        signals
    }

    fn check_account_rate(
        &self,
        positions: &[Position],
        available_balance: Decimal,
    ) -> Option<EmergencySignal> {
        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();
        if total_margin.is_zero() {
            self.account_warning_sent.store(false, Ordering::Relaxed);
            return None;
        }

        let total_equity = total_margin + available_balance;
        let rate_pct = (total_equity / total_margin * Decimal::ONE_HUNDRED).to_f64_lossy();

        if rate_pct < self.config.thresholds.account_margin_rate_warning {
            if self.account_warning_sent.swap(true, Ordering::Relaxed) {
                return None;
            }
            warn!(rate_pct, "account margin rate under warning level");
            return Some(EmergencySignal::AccountBelowWarning { rate_pct });
        }

        self.account_warning_sent.store(false, Ordering::Relaxed);
        None
    }

    /// Record a streamed price and emit a spike signal when the move from
    /// the previous observation exceeds the threshold. The first price for
    /// a symbol only sets the baseline.
    pub fn on_price(&self, symbol: &str, price: Decimal) -> Option<EmergencySignal> {
        let previous = {
            let mut prices = self.last_prices.lock().unwrap();
            prices.insert(symbol.to_string(), price)
        };

        let previous = previous.filter(|p| !p.is_zero())?;
        let change_pct = ((price - previous).abs() / previous * Decimal::ONE_HUNDRED)
            .to_f64_lossy();

        if change_pct >= self.config.thresholds.price_spike_pct {
            warn!(symbol, change_pct, %previous, %price, "price spike");
            return Some(EmergencySignal::PriceSpike {
                symbol: symbol.to_string(),
                from: previous,
                to: price,
            });
        }
        None
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.lock().unwrap().get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionSide;

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    fn config() -> Arc<Config> {
        config_with("")
    }

    fn config_with(raw_extra: &str) -> Arc<Config> {
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

    fn position(symbol: &str, margin: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: dec("1"),
            entry_price: dec("50000"),
            current_price: dec("50000"),
            margin: dec(margin),
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn flags_position_under_emergency_rate() {
        let detector = EventDetector::new(config());
        // margin 500 on notional 50000 -> 1% < 2%.
        let signals = detector.check_snapshot(&[position("BTC", "500")], dec("100000"));
        assert!(signals.iter().any(|s| matches!(
            s,
            EmergencySignal::PositionBelowThreshold { symbol } if symbol == "BTC"
        )));
    }

    #[test]
    fn healthy_position_raises_nothing() {
        let detector = EventDetector::new(config());
        // margin 2000 on notional 50000 -> 4%.
        let signals = detector.check_snapshot(&[position("BTC", "2000")], dec("100000"));
        assert!(signals.is_empty());
    }

    #[test]
    fn account_warning_latches_until_recovery() {
        // Warning level set above 100% so equity = margin trips it.
        let detector = EventDetector::new(config_with(
            "[thresholds]\naccount_margin_rate_warning = 105.0",
        ));
        let positions = [position("BTC", "2000")];

        // equity/margin = 100% < 105% -> warn once.
        let first = detector.check_snapshot(&positions, Decimal::ZERO);
        assert!(first
            .iter()
            .any(|s| matches!(s, EmergencySignal::AccountBelowWarning { .. })));

        // Still low: latched, no repeat.
        let second = detector.check_snapshot(&positions, Decimal::ZERO);
        assert!(second.is_empty());

        // Recovered: 110% resets the latch.
        detector.check_snapshot(&positions, dec("200"));
        let third = detector.check_snapshot(&positions, Decimal::ZERO);
        assert!(third
            .iter()
            .any(|s| matches!(s, EmergencySignal::AccountBelowWarning { .. })));
    }

    #[test]
    fn first_price_sets_baseline_without_signal() {
        let detector = EventDetector::new(config());
        assert!(detector.on_price("BTC", dec("50000")).is_none());
        assert_eq!(detector.last_price("BTC"), Some(dec("50000")));
    }

    #[test]
    fn spike_over_threshold_signals() {
        let detector = EventDetector::new(config());
        detector.on_price("BTC", dec("50000"));
        let signal = detector.on_price("BTC", dec("52000"));
        match signal {
            Some(EmergencySignal::PriceSpike { symbol, from, to }) => {
                assert_eq!(symbol, "BTC");
                assert_eq!(from, dec("50000"));
                assert_eq!(to, dec("52000"));
            }
            other => panic!("expected spike, got {other:?}"),
        }
    }

    #[test]
    fn small_move_is_quiet() {
        let detector = EventDetector::new(config());
        detector.on_price("BTC", dec("50000"));
        assert!(detector.on_price("BTC", dec("50500")).is_none());
    }

    #[test]
    fn downward_spike_also_signals() {
        let detector = EventDetector::new(config());
        detector.on_price("BTC", dec("50000"));
        assert!(detector.on_price("BTC", dec("48000")).is_some());
    }
}
