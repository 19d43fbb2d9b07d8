//! Top-level error type for daemon startup and wiring.

use thiserror::Error;

use crate::config::ConfigError;
use crate::exchange::ExchangeError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
}
