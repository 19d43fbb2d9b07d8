//! Domain types for the margin daemon.
//!
//! This module provides:
//! - Lossless money/quantity arithmetic via the Decimal wrapper
//! - Position snapshots with derived notional and margin rate
//! - History records (adjustments, liquidations, account snapshots)
//! - Emergency signals raised by the event detector

pub mod decimal;
pub mod position;
pub mod records;
pub mod signal;

pub use decimal::Decimal;
pub use position::{Position, PositionSide};
pub use records::{
    AccountSnapshot, AdjustmentDirection, AdjustmentRecord, LiquidationRecord, TriggerType,
};
pub use signal::EmergencySignal;
