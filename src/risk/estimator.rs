//! Per-symbol risk weights from historical volatility.
//!
//! A weight is the symbol's daily-return volatility normalized by the
//! reference symbol's (BTC). Weights are a policy signal, not an accounting
//! number, so the math runs in f64 and every failure degrades to 1.0 rather
//! than blocking a tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::exchange::ExchangeAdapter;

const REFERENCE_SYMBOL: &str = "BTC";
const CANDLE_TIMEFRAME: &str = "1D";
const VOLATILITY_FLOOR: f64 = 0.001;
const FALLBACK_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct CachedValue {
    value: f64,
    computed_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    weights: HashMap<String, CachedValue>,
    reference_volatility: Option<CachedValue>,
    last_spike_at: Option<Instant>,
}

/// Computes and caches risk weights.
///
/// Cache reads and writes are synchronous; only the candle fetch suspends.
#[derive(Debug)]
pub struct RiskEstimator {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeAdapter>,
    state: Mutex<CacheState>,
}

impl RiskEstimator {
    pub fn new(config: Arc<Config>, exchange: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            config,
            exchange,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Risk weight for `symbol`.
    ///
    /// Resolution order: configured override, fresh cache entry, computed
    /// volatility ratio. Fetch errors and missing or too-short candle data
    /// all yield the 1.0 floor assumption.
    pub async fn weight(&self, symbol: &str) -> f64 {
        if let Some(pinned) = self.config.risk_weight(symbol) {
            return pinned;
        }

        let window = {
            let state = self.state.lock().unwrap();
            let window = self.refresh_window(&state);
            if let Some(cached) = state.weights.get(symbol) {
                if cached.computed_at.elapsed() < window {
                    return cached.value;
                }
            }
            window
        };

        let weight = match self.fetch_volatility(symbol).await {
            Some(volatility) => match self.reference_volatility(window).await {
                Some(reference) if reference > 0.0 => volatility / reference,
                _ => FALLBACK_WEIGHT,
            },
            None => FALLBACK_WEIGHT,
        };

        let mut state = self.state.lock().unwrap();
        state.weights.insert(
            symbol.to_string(),
            CachedValue {
                value: weight,
                computed_at: Instant::now(),
            },
        );
        debug!(symbol, weight, "risk weight refreshed");
        weight
    }

    /// Shorten the refresh window after a spike; it stays shortened until a
    /// full normal window passes without another spike.
    pub fn note_spike(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_spike_at = Some(Instant::now());
    }

    /// Drop every cached weight; the next `weight()` call refetches candles.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock().unwrap();
        state.weights.clear();
        state.reference_volatility = None;
    }

    fn normal_window(&self) -> Duration {
        Duration::from_secs(self.config.monitor.volatility_update_hours * 3600)
    }

    fn refresh_window(&self, state: &CacheState) -> Duration {
        let spiked_recently = state
            .last_spike_at
            .map(|at| at.elapsed() < self.normal_window())
            .unwrap_or(false);
        if spiked_recently {
            Duration::from_secs(self.config.monitor.spike_refresh_minutes * 60)
        } else {
            self.normal_window()
        }
    }

    async fn reference_volatility(&self, window: Duration) -> Option<f64> {
        {
            let state = self.state.lock().unwrap();
            if let Some(cached) = state.reference_volatility {
                if cached.computed_at.elapsed() < window {
                    return Some(cached.value);
                }
            }
        }

        let volatility = self.fetch_volatility(REFERENCE_SYMBOL).await?;
        let mut state = self.state.lock().unwrap();
        state.reference_volatility = Some(CachedValue {
            value: volatility,
            computed_at: Instant::now(),
        });
        Some(volatility)
    }

    /// Volatility from daily closes, or None when the data cannot support
    /// the computation.
    async fn fetch_volatility(&self, symbol: &str) -> Option<f64> {
        let limit = self.config.monitor.volatility_lookback_days;
        match self
            .exchange
            .candles(symbol, CANDLE_TIMEFRAME, limit)
            .await
        {
            Ok(closes) if closes.len() >= 2 => {
                // Candles arrive most recent first; returns are computed in
                // chronological order.
                let chronological: Vec<f64> = closes.into_iter().rev().collect();
                daily_volatility(&chronological)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(symbol, "candle fetch failed, assuming weight floor: {e}");
                None
            }
        }
    }
}

/// Population standard deviation of simple returns, floored at 0.001.
fn daily_volatility(closes: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|pair| pair[0] != 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect();
    if returns.is_empty() {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt().max(VOLATILITY_FLOOR))
}
