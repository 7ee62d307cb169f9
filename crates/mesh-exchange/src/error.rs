//! Exchange errors

use thiserror::Error;

/// Rejections for malformed orders
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Asset must not be empty")]
    EmptyAsset,

    #[error("Quantity must be positive")]
    ZeroQuantity,

    #[error("Price must be positive")]
    ZeroPrice,

    #[error("Trader must not be empty")]
    EmptyTrader,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
