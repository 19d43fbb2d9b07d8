//! Builder-style exchange double for tests: no network, records every write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ExchangeAdapter, ExchangeError};
use crate::domain::{Decimal, Position, PositionSide};

/// A recorded `adjust_margin` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustCall {
    pub full_symbol: String,
    pub delta: Decimal,
}

/// A recorded `close_position` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseCall {
    pub full_symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
}

#[derive(Debug, Default)]
pub struct MockExchange {
    positions: Vec<Position>,
    balance: Decimal,
    candles: HashMap<String, Vec<f64>>,
    candles_unavailable: bool,
    fail_adjust_symbols: Vec<String>,
    fail_all_writes: bool,
    auth_rejected: bool,
    fetch_latency: Option<std::time::Duration>,
    adjust_calls: Mutex<Vec<AdjustCall>>,
    close_calls: Mutex<Vec<CloseCall>>,
    candle_requests: Mutex<Vec<String>>,
    position_fetches: Mutex<u32>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    pub fn with_positions(mut self, positions: Vec<Position>) -> Self {
        self.positions.extend(positions);
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }

    /// Close prices served for `symbol`, most recent first.
    pub fn with_candles(mut self, symbol: &str, closes: Vec<f64>) -> Self {
        self.candles.insert(symbol.to_string(), closes);
        self
    }

    /// Make every candle fetch fail with a network error.
    pub fn with_candles_unavailable(mut self) -> Self {
        self.candles_unavailable = true;
        self
    }

    /// Make `adjust_margin` report failure for one symbol.
    pub fn with_failing_adjust(mut self, symbol: &str) -> Self {
        self.fail_adjust_symbols.push(symbol.to_string());
        self
    }

    /// Make every write report failure.
    pub fn with_failing_writes(mut self) -> Self {
        self.fail_all_writes = true;
        self
    }

    /// Reject every authenticated fetch, as an expired key would.
    pub fn with_auth_rejected(mut self) -> Self {
        self.auth_rejected = true;
        self
    }

    /// Delay every fetch, to make overlap between callers observable.
    pub fn with_fetch_latency(mut self, latency: std::time::Duration) -> Self {
        self.fetch_latency = Some(latency);
        self
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.fetch_latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn adjust_calls(&self) -> Vec<AdjustCall> {
        self.adjust_calls.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> Vec<CloseCall> {
        self.close_calls.lock().unwrap().clone()
    }

    /// Symbols whose candles were fetched, in request order.
    pub fn candle_requests(&self) -> Vec<String> {
        self.candle_requests.lock().unwrap().clone()
    }

    pub fn position_fetches(&self) -> u32 {
        *self.position_fetches.lock().unwrap()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        *self.position_fetches.lock().unwrap() += 1;
        self.simulate_latency().await;
        if self.auth_rejected {
            return Err(ExchangeError::Auth("status 401".to_string()));
        }
        Ok(self.positions.clone())
    }

    async fn available_balance(&self) -> Result<Decimal, ExchangeError> {
        self.simulate_latency().await;
        if self.auth_rejected {
            return Err(ExchangeError::Auth("status 401".to_string()));
        }
        Ok(self.balance)
    }

    async fn candles(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<f64>, ExchangeError> {
        self.candle_requests.lock().unwrap().push(symbol.to_string());
        if self.candles_unavailable {
            return Err(ExchangeError::Network("candles unavailable".to_string()));
        }
        Ok(self
            .candles
            .get(symbol)
            .map(|closes| closes.iter().copied().take(limit as usize).collect())
            .unwrap_or_default())
    }

    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool {
        self.adjust_calls.lock().unwrap().push(AdjustCall {
            full_symbol: full_symbol.to_string(),
            delta,
        });
        if self.fail_all_writes {
            return false;
        }
        !self
            .fail_adjust_symbols
            .iter()
            .any(|s| full_symbol.contains(s.as_str()))
    }

    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool {
        self.close_calls.lock().unwrap().push(CloseCall {
            full_symbol: full_symbol.to_string(),
            side,
            quantity,
        });
        !self.fail_all_writes
    }

    fn full_symbol(&self, symbol: &str) -> String {
        format!("t{symbol}F0:USTF0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, margin: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: Decimal::ONE,
            entry_price: Decimal::parse("100").unwrap(),
            current_price: Decimal::parse("100").unwrap(),
            margin: Decimal::parse(margin).unwrap(),
            leverage: 5,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn returns_configured_positions_and_balance() {
        let mock = MockExchange::new()
            .with_position(position("BTC", "400"))
            .with_balance(Decimal::parse("100").unwrap());
        assert_eq!(mock.list_positions().await.unwrap().len(), 1);
        assert_eq!(
            mock.available_balance().await.unwrap(),
            Decimal::parse("100").unwrap()
        );
    }

    #[tokio::test]
    async fn records_writes_and_honors_failures() {
        let mock = MockExchange::new().with_failing_adjust("ETH");
        assert!(mock.adjust_margin("tBTCF0:USTF0", Decimal::ONE).await);
        assert!(!mock.adjust_margin("tETHF0:USTF0", Decimal::ONE).await);
        assert_eq!(mock.adjust_calls().len(), 2);
    }

    #[tokio::test]
    async fn candle_requests_are_observable() {
        let mock = MockExchange::new().with_candles("BTC", vec![100.0, 101.0]);
        mock.candles("BTC", "1D", 7).await.unwrap();
        assert_eq!(mock.candle_requests(), vec!["BTC".to_string()]);
    }
}
