//! Streaming price feed.
//!
//! The stream task pushes events into a bounded channel that the controller
//! drains; the controller pushes subscription-set replacements back through
//! [`SubscriptionSink`]. Reconnection is the stream's own concern and is
//! invisible to the rest of the daemon until the retry budget runs out.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::Decimal;

pub mod bitfinex_ws;

pub use bitfinex_ws::BitfinexStream;

/// One streamed price observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Decimal,
}

/// Events the stream delivers to the controller's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Price(PriceUpdate),
    /// Reconnect attempts exhausted; the daemon continues in polling-only
    /// mode and this is surfaced as a non-fatal alert.
    ReconnectExhausted,
}

/// Where the controller publishes the set of symbols worth streaming.
#[async_trait]
pub trait SubscriptionSink: Send + Sync + fmt::Debug {
    /// Replace the subscription set atomically with the given set.
    async fn replace_subscriptions(&self, symbols: BTreeSet<String>);
}
