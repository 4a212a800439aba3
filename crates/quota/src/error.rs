//! Error types for the quota ledger and order admission

use sea_orm::DbErr;
use thiserror::Error;

use crate::ledger::QuotaKey;

/// Error type for quota and order operations
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Quantity is zero, negative, or otherwise unusable
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Request body, query string or path could not be parsed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Order submitted without any lines
    #[error("Order has no lines")]
    EmptyOrder,

    #[error("Unknown product: {0}")]
    UnknownProduct(i64),

    #[error("Unknown territory: {0}")]
    UnknownTerritory(String),

    #[error("Unknown dealer: {0}")]
    UnknownDealer(i64),

    /// Dealer belongs to a different territory than the order
    #[error("Dealer {dealer_id} belongs to territory {dealer_territory}, not {territory}")]
    TerritoryMismatch {
        dealer_id: i64,
        dealer_territory: String,
        territory: String,
    },

    /// Not enough quota left for one of the order lines
    #[error("Insufficient quota for product {} in {} on {}: requested {requested}, remaining {remaining}", .key.product_id, .key.territory, .key.date)]
    InsufficientQuota {
        key: QuotaKey,
        requested: i64,
        remaining: i64,
    },

    /// Requested ceiling is lower than what has already been sold
    #[error("Quota for product {} in {} on {} cannot go below sold quantity {sold} (requested {requested_max})", .key.product_id, .key.territory, .key.date)]
    QuotaBelowConsumed {
        key: QuotaKey,
        requested_max: i64,
        sold: i64,
    },

    /// Quota still has sold units drawn against it
    #[error("Quota for product {} in {} on {} is in use ({sold} sold)", .key.product_id, .key.territory, .key.date)]
    QuotaInUse { key: QuotaKey, sold: i64 },

    #[error("Quota not found for product {} in {} on {}", .0.product_id, .0.territory, .0.date)]
    QuotaNotFound(QuotaKey),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Another order already holds this client request key
    #[error("Request key already used: {0}")]
    DuplicateRequestKey(String),

    /// Quota ledger disagrees with the order ledger
    #[error("Ledger inconsistent: {0}")]
    LedgerInconsistent(String),

    /// A mutation may or may not have committed; verify before retrying
    #[error("Unknown outcome, verify before retry: {0}")]
    UnknownOutcome(String),

    /// Database connection or operation error
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// Generic error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by transports to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    Integrity,
    NotFound,
    Transient,
    Internal,
}

impl QuotaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            QuotaError::InvalidQuantity(_)
            | QuotaError::InvalidRequest(_)
            | QuotaError::EmptyOrder
            | QuotaError::UnknownProduct(_)
            | QuotaError::UnknownTerritory(_)
            | QuotaError::UnknownDealer(_)
            | QuotaError::TerritoryMismatch { .. } => ErrorCategory::Validation,
            QuotaError::InsufficientQuota { .. } | QuotaError::DuplicateRequestKey(_) => {
                ErrorCategory::Conflict
            }
            QuotaError::QuotaBelowConsumed { .. }
            | QuotaError::QuotaInUse { .. }
            | QuotaError::LedgerInconsistent(_) => ErrorCategory::Integrity,
            QuotaError::QuotaNotFound(_) | QuotaError::OrderNotFound(_) => ErrorCategory::NotFound,
            QuotaError::UnknownOutcome(_) => ErrorCategory::Transient,
            QuotaError::Database(e) if crate::database::is_transient(e) => ErrorCategory::Transient,
            QuotaError::Database(_) | QuotaError::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::InvalidQuantity(_) => "INVALID_QUANTITY",
            QuotaError::InvalidRequest(_) => "INVALID_REQUEST",
            QuotaError::EmptyOrder => "EMPTY_ORDER",
            QuotaError::UnknownProduct(_) => "UNKNOWN_PRODUCT",
            QuotaError::UnknownTerritory(_) => "UNKNOWN_TERRITORY",
            QuotaError::UnknownDealer(_) => "UNKNOWN_DEALER",
            QuotaError::TerritoryMismatch { .. } => "TERRITORY_MISMATCH",
            QuotaError::InsufficientQuota { .. } => "INSUFFICIENT_QUOTA",
            QuotaError::QuotaBelowConsumed { .. } => "QUOTA_BELOW_CONSUMED",
            QuotaError::QuotaInUse { .. } => "QUOTA_IN_USE",
            QuotaError::QuotaNotFound(_) => "QUOTA_NOT_FOUND",
            QuotaError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            QuotaError::DuplicateRequestKey(_) => "DUPLICATE_REQUEST_KEY",
            QuotaError::LedgerInconsistent(_) => "LEDGER_INCONSISTENT",
            QuotaError::UnknownOutcome(_) => "UNKNOWN_OUTCOME",
            QuotaError::Database(_) => "DATABASE_ERROR",
            QuotaError::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for quota operations
pub type Result<T> = std::result::Result<T, QuotaError>;
