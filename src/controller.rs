//! Single-writer orchestration of ticks and emergencies.
//!
//! Every exchange write in the daemon flows through this type. A tokio
//! mutex gates execution: the scheduler's tick uses `try_lock` and skips
//! when the gate is held, while emergency handlers queue on `lock()`. A
//! tick therefore never interleaves with an emergency pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::HistoryStore;
use crate::domain::{AccountSnapshot, Decimal, EmergencySignal, Position, TriggerType};
use crate::exchange::{ExchangeAdapter, ExchangeError};
use crate::liquidation::Liquidator;
use crate::monitor::EventDetector;
use crate::notify::Notifier;
use crate::rebalance::Rebalancer;
use crate::risk::{target_margins, RiskEstimator};
use crate::stream::{StreamEvent, SubscriptionSink};

pub struct Controller {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeAdapter>,
    estimator: Arc<RiskEstimator>,
    rebalancer: Rebalancer,
    liquidator: Liquidator,
    detector: EventDetector,
    history: Arc<HistoryStore>,
    notifier: Arc<dyn Notifier>,
    subscriptions: Option<Arc<dyn SubscriptionSink>>,
    gate: Mutex<()>,
    writes_enabled: AtomicBool,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeAdapter>,
        history: Arc<HistoryStore>,
        notifier: Arc<dyn Notifier>,
        force_dry_run: bool,
    ) -> Self {
        let estimator = Arc::new(RiskEstimator::new(
            Arc::clone(&config),
            Arc::clone(&exchange),
        ));
        let rebalancer = Rebalancer::new(
            Arc::clone(&config),
            Arc::clone(&exchange),
            Arc::clone(&history),
        );
        let liquidator = Liquidator::new(
            Arc::clone(&config),
            Arc::clone(&exchange),
            Arc::clone(&history),
            force_dry_run,
        );
        let detector = EventDetector::new(Arc::clone(&config));

        Self {
            config,
            exchange,
            estimator,
            rebalancer,
            liquidator,
            detector,
            history,
            notifier,
            subscriptions: None,
            gate: Mutex::new(()),
            writes_enabled: AtomicBool::new(true),
        }
    }

    /// Attach the streaming adapter that receives subscription updates.
    pub fn with_subscription_sink(mut self, sink: Arc<dyn SubscriptionSink>) -> Self {
        self.subscriptions = Some(sink);
        self
    }

    pub fn estimator(&self) -> &RiskEstimator {
        &self.estimator
    }

    pub fn detector(&self) -> &EventDetector {
        &self.detector
    }

    fn writes_enabled(&self) -> bool {
        self.writes_enabled.load(Ordering::Relaxed)
    }

    /// Track auth state from fetch results: an auth rejection disables
    /// writes until a later authenticated fetch succeeds.
    fn observe_fetch<T>(
        &self,
        result: Result<T, ExchangeError>,
    ) -> Result<T, ExchangeError> {
        match result {
            Ok(value) => {
                if !self.writes_enabled.swap(true, Ordering::Relaxed) {
                    info!("authenticated fetch recovered, writes re-enabled");
                }
                Ok(value)
            }
            Err(e) => {
                if e.is_auth() {
                    if self.writes_enabled.swap(false, Ordering::Relaxed) {
                        error!("authentication failure, writes disabled: {e}");
                    }
                }
                Err(e)
            }
        }
    }

    /// One scheduled pass. Skips (never queues) when a tick or emergency is
    /// already running. A fetch error aborts only this tick.
    pub async fn tick(&self) -> Result<(), ExchangeError> {
        let Ok(_guard) = self.gate.try_lock() else {
            debug!("tick skipped, controller busy");
            return Ok(());
        };
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<(), ExchangeError> {
        let positions = match self.observe_fetch(self.exchange.list_positions().await) {
            Ok(positions) => positions,
            Err(e) => {
                self.report_fetch_failure("position fetch", &e).await;
                return Err(e);
            }
        };
        if positions.is_empty() {
            debug!("no active positions, nothing to do");
            return Ok(());
        }

        let available = match self.observe_fetch(self.exchange.available_balance().await) {
            Ok(balance) => balance,
            Err(e) => {
                self.report_fetch_failure("balance fetch", &e).await;
                return Err(e);
            }
        };
        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();
        let budget = total_margin + available;
        info!(
            position_count = positions.len(),
            %available,
            %budget,
            "tick started"
        );

        let mut weights = HashMap::new();
        for position in &positions {
            let weight = self.estimator.weight(&position.symbol).await;
            weights.insert(position.symbol.clone(), weight);
        }
        let targets = target_margins(&positions, &weights, budget);

        if self.writes_enabled() {
            let outcome = self
                .rebalancer
                .execute(&positions, &targets, TriggerType::Scheduled)
                .await;
            if outcome.touched_anything() {
                self.notifier.rebalance_report(&outcome).await;
            }
        } else {
            warn!("writes disabled, rebalance skipped");
        }

        // Margins moved; work from a fresh balance for the emergency and
        // liquidation phases.
        let mut free_balance =
            match self.observe_fetch(self.exchange.available_balance().await) {
                Ok(balance) => balance,
                Err(e) => {
                    self.report_fetch_failure("balance refresh", &e).await;
                    return Err(e);
                }
            };
        for signal in self.detector.check_snapshot(&positions, free_balance) {
            match signal {
                EmergencySignal::PositionBelowThreshold { ref symbol } => {
                    let Some(critical) = positions.iter().find(|p| &p.symbol == symbol)
                    else {
                        continue;
                    };
                    if !self.writes_enabled() {
                        continue;
                    }
                    let outcome = self
                        .rebalancer
                        .emergency_top_up(critical, free_balance)
                        .await;
                    if outcome.touched_anything() {
                        free_balance =
                            (free_balance - outcome.total_adjusted).max(Decimal::ZERO);
                        self.notifier.rebalance_report(&outcome).await;
                    }
                }
                EmergencySignal::AccountBelowWarning { rate_pct } => {
                    self.notifier.account_margin_warning(rate_pct).await;
                }
                EmergencySignal::PriceSpike { .. } => {}
            }
        }

        if self.writes_enabled() {
            let outcome = self
                .liquidator
                .execute_if_needed(&positions, free_balance)
                .await;
            if outcome.noteworthy() {
                self.notifier.liquidation_alert(&outcome).await;
            }
        }

        self.record_snapshot(&positions, available, total_margin).await;
        self.publish_subscriptions(&positions).await;
        Ok(())
    }

    /// Handle one mailbox event from the streaming side.
    pub async fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Price(update) => {
                self.handle_price(&update.symbol, update.price).await;
            }
            StreamEvent::ReconnectExhausted => {
                warn!("stream gone, continuing in polling-only mode");
                self.notifier
                    .retry_exhausted_alert(
                        "websocket stream",
                        "reconnect attempts exhausted",
                    )
                    .await;
            }
        }
    }

    /// Streamed price observation: detect a spike, shorten the volatility
    /// refresh window, and run the emergency path for that symbol.
    pub async fn handle_price(&self, symbol: &str, price: Decimal) {
        let Some(signal) = self.detector.on_price(symbol, price) else {
            return;
        };
        self.estimator.note_spike();
        self.handle_emergency(signal).await;
    }

    /// Serialized emergency pass; queues behind a running tick.
    pub async fn handle_emergency(&self, signal: EmergencySignal) {
        let _guard = self.gate.lock().await;

        let symbol = match &signal {
            EmergencySignal::PriceSpike { symbol, .. } => symbol.clone(),
            EmergencySignal::PositionBelowThreshold { symbol } => symbol.clone(),
            EmergencySignal::AccountBelowWarning { rate_pct } => {
                self.notifier.account_margin_warning(*rate_pct).await;
                return;
            }
        };
        info!(%symbol, %signal, "emergency handling started");

        if !self.writes_enabled() {
            warn!(%symbol, "writes disabled, emergency top-up skipped");
            return;
        }

        let positions = match self.observe_fetch(self.exchange.list_positions().await) {
            Ok(positions) => positions,
            Err(e) => {
                error!(%symbol, "emergency aborted, position fetch failed: {e}");
                return;
            }
        };
        let emergency_rate =
            Decimal::from_f64_lossy(self.config.thresholds.emergency_margin_rate);
        let Some(critical) = positions
            .iter()
            .find(|p| p.symbol == symbol && p.margin_rate() < emergency_rate)
        else {
            debug!(%symbol, "no critical position for signal, nothing to do");
            return;
        };

        let available = match self.observe_fetch(self.exchange.available_balance().await)
        {
            Ok(balance) => balance,
            Err(e) => {
                error!(%symbol, "emergency aborted, balance fetch failed: {e}");
                return;
            }
        };

        let outcome = self.rebalancer.emergency_top_up(critical, available).await;
        if outcome.touched_anything() {
            self.notifier.rebalance_report(&outcome).await;
        }
    }

    async fn record_snapshot(
        &self,
        positions: &[Position],
        available: Decimal,
        total_margin: Decimal,
    ) {
        let positions_json = json!(positions
            .iter()
            .map(|p| {
                json!({
                    "symbol": p.symbol,
                    "side": p.side.as_str(),
                    "quantity": p.quantity.to_canonical_string(),
                    "current_price": p.current_price.to_canonical_string(),
                    "margin": p.margin.to_canonical_string(),
                    "margin_rate": p.margin_rate().to_canonical_string(),
                })
            })
            .collect::<Vec<_>>())
        .to_string();

        let snapshot = AccountSnapshot {
            timestamp: Utc::now(),
            total_equity: total_margin + available,
            total_margin,
            available_balance: available,
            positions_json,
        };
        if let Err(e) = self.history.record_snapshot(&snapshot).await {
            warn!("snapshot insert failed: {e}");
        }
    }

    /// Publish the symbols worth streaming: everything already within 2x of
    /// the emergency margin rate.
    async fn publish_subscriptions(&self, positions: &[Position]) {
        let Some(sink) = &self.subscriptions else {
            return;
        };
        let high_risk_rate =
            Decimal::from_f64_lossy(self.config.thresholds.emergency_margin_rate * 2.0);
        let symbols: BTreeSet<String> = positions
            .iter()
            .filter(|p| p.margin_rate() < high_risk_rate)
            .map(|p| p.symbol.clone())
            .collect();
        debug!(count = symbols.len(), "subscription set published");
        sink.replace_subscriptions(symbols).await;
    }

    async fn report_fetch_failure(&self, context: &str, error: &ExchangeError) {
        error!("{context} failed: {error}");
        self.notifier
            .retry_exhausted_alert(context, &error.to_string())
            .await;
    }
}
