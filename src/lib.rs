pub mod config;
pub mod controller;
pub mod db;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod liquidation;
pub mod monitor;
pub mod notify;
pub mod rebalance;
pub mod risk;
pub mod stream;

pub use config::Config;
pub use controller::Controller;
pub use db::{init_db, HistoryStore};
pub use domain::{Decimal, EmergencySignal, Position, PositionSide};
pub use error::AppError;
pub use exchange::{ExchangeAdapter, ExchangeError};
