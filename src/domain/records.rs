//! History records appended to the store after executed actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Decimal, PositionSide};

/// What initiated an adjustment: the periodic tick or an emergency path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Emergency,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentDirection {
    Increase,
    Decrease,
}

impl AdjustmentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentDirection::Increase => "increase",
            AdjustmentDirection::Decrease => "decrease",
        }
    }
}

/// One executed margin adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub direction: AdjustmentDirection,
    /// Absolute amount moved.
    pub amount: Decimal,
    pub before_margin: Decimal,
    pub after_margin: Decimal,
    pub trigger: TriggerType,
}

/// One executed partial close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub released_margin: Decimal,
    pub reason: String,
}

/// Per-tick account state, stored for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_equity: Decimal,
    pub total_margin: Decimal,
    pub available_balance: Decimal,
    /// Compact JSON array of per-position state.
    pub positions_json: String,
}
