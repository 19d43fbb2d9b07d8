//! Emergency signals raised by the event detector.

use super::Decimal;

/// A condition that preempts the normal schedule.
///
/// Signals are forwarded to the controller for serialized handling; the
/// detector itself never touches the exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencySignal {
    /// A position's margin rate dropped below the emergency threshold.
    PositionBelowThreshold { symbol: String },
    /// Consecutive price observations moved more than the spike threshold.
    PriceSpike {
        symbol: String,
        from: Decimal,
        to: Decimal,
    },
    /// Account-wide equity/margin ratio dropped below the warning level.
    AccountBelowWarning { rate_pct: f64 },
}

impl std::fmt::Display for EmergencySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencySignal::PositionBelowThreshold { symbol } => {
                write!(f, "position {symbol} below emergency margin rate")
            }
            EmergencySignal::PriceSpike { symbol, from, to } => {
                write!(f, "price spike on {symbol}: {from} -> {to}")
            }
            EmergencySignal::AccountBelowWarning { rate_pct } => {
                write!(f, "account margin rate {rate_pct:.2}% below warning level")
            }
        }
    }
}
