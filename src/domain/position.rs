//! Position snapshot as fetched from the exchange each tick.

use serde::{Deserialize, Serialize};

use super::Decimal;

/// Direction of a derivative holding.
///
/// Quantity is always positive; the side carries the direction. Signed
/// amounts only exist on the wire, inside the exchange adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(format!("invalid position side: {other}")),
        }
    }
}

/// A live derivative holding with its isolated collateral.
///
/// Read-only snapshot owned by the tick that fetched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Short base identifier, e.g. "BTC".
    pub symbol: String,
    pub side: PositionSide,
    /// Always positive; direction lives in `side`.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    /// Isolated collateral currently attached to the position.
    pub margin: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// `quantity * current_price`.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.current_price
    }

    /// `margin / notional * 100`, in percent. Zero when notional is zero.
    pub fn margin_rate(&self) -> Decimal {
        let notional = self.notional();
        if notional.is_zero() {
            Decimal::ZERO
        } else {
            self.margin / notional * Decimal::ONE_HUNDRED
        }
    }

    pub fn is_profitable(&self) -> bool {
        self.unrealized_pnl.is_positive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_long(margin: &str) -> Position {
        Position {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: Decimal::parse("0.5").unwrap(),
            entry_price: Decimal::parse("48000").unwrap(),
            current_price: Decimal::parse("50000").unwrap(),
            margin: Decimal::parse(margin).unwrap(),
            leverage: 10,
            unrealized_pnl: Decimal::parse("1000").unwrap(),
        }
    }

    #[test]
    fn notional_is_quantity_times_price() {
        let pos = btc_long("400");
        assert_eq!(pos.notional(), Decimal::parse("25000").unwrap());
    }

    #[test]
    fn margin_rate_in_percent() {
        let pos = btc_long("500");
        assert_eq!(pos.margin_rate(), Decimal::parse("2").unwrap());
    }

    #[test]
    fn margin_rate_zero_notional() {
        let mut pos = btc_long("500");
        pos.quantity = Decimal::ZERO;
        assert_eq!(pos.margin_rate(), Decimal::ZERO);
    }

    #[test]
    fn side_parse_roundtrip() {
        assert_eq!("long".parse::<PositionSide>().unwrap(), PositionSide::Long);
        assert_eq!("short".parse::<PositionSide>().unwrap(), PositionSide::Short);
        assert!("sideways".parse::<PositionSide>().is_err());
    }
}
