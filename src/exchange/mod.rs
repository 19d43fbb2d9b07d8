//! Exchange adapter abstraction.
//!
//! The core plans against this trait; the Bitfinex implementation lives in
//! [`bitfinex`] and a builder-style test double in [`mock`].

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::domain::{Decimal, Position, PositionSide};

pub mod bitfinex;
pub mod mock;

pub use bitfinex::BitfinexExchange;
pub use mock::MockExchange;

/// Errors surfaced by exchange reads.
///
/// Write endpoints (`adjust_margin`, `close_position`) never raise; they
/// report failure as `false` after the adapter's retry budget is spent.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited")]
    RateLimited,
    #[error("parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Whether the error indicates bad credentials rather than a transient
    /// fault. Auth failures disable writes until resolved.
    pub fn is_auth(&self) -> bool {
        matches!(self, ExchangeError::Auth(_))
    }
}

/// Interface the control loop expects from the exchange.
///
/// Reads return `Result`; a fetch error aborts only the current tick.
/// Writes return a bare `bool` and must already include retry-with-backoff.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + fmt::Debug {
    /// Active derivative positions only.
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Free collateral in the derivatives wallet, never negative.
    async fn available_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Recent close prices for `symbol`, most recent first.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<f64>, ExchangeError>;

    /// Move collateral on a position: positive delta adds, negative removes.
    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool;

    /// Partially close a position with a market order opposite to its side.
    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool;

    /// Map a short symbol ("BTC") to the exchange's full derivative pair.
    fn full_symbol(&self, symbol: &str) -> String;
}
