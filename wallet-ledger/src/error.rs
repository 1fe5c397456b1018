//! Error types for the wallet ledger
//!
//! Business-rule failures (validation, insufficient funds/position, conflicts,
//! catalog outages, missing records) are reported to callers as failed
//! [`OperationResult`](crate::operations::OperationResult)s. Everything else is an
//! infrastructure fault and propagates as `Err`, tagged with the request's
//! correlation id once it leaves the coordinator.

use crate::types::EntryStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range request
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Not enough available balance for a debit
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount the operation needed
        required: Decimal,
        /// Amount that was available
        available: Decimal,
    },

    /// Not enough open lots to cover a sell
    #[error("Insufficient position: required {required}, available {available}")]
    InsufficientPosition {
        /// Amount the operation needed
        required: Decimal,
        /// Amount held in eligible lots
        available: Decimal,
    },

    /// Conflicting writer won; retry budget exhausted or lock wait expired
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Currency catalog failed, timed out, or returned an unusable price
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Journal entry status change not allowed
    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current status
        from: EntryStatus,
        /// Requested status
        to: EntryStatus,
    },

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data contradicts a ledger invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Infrastructure fault that aborted a request
    #[error("Request {correlation_id} failed: {source}")]
    Fault {
        /// Correlation id of the failed request
        correlation_id: Uuid,
        /// Underlying fault
        #[source]
        source: Box<Error>,
    },
}

/// Error category exposed on failed operation results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed request or illegal state change
    Validation,
    /// Cash or asset balance too small
    InsufficientFunds,
    /// Lots too small
    InsufficientPosition,
    /// Concurrent writer conflict
    ConcurrencyConflict,
    /// Price source failure
    ExternalService,
    /// Missing account, wallet, currency or entry
    NotFound,
    /// Infrastructure fault
    Internal,
}

impl ErrorKind {
    /// Label used for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::InsufficientPosition => "insufficient_position",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidTransition { .. } => ErrorKind::Validation,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::InsufficientPosition { .. } => ErrorKind::InsufficientPosition,
            Error::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Error::ExternalService(_) => ErrorKind::ExternalService,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Fault { source, .. } => source.kind(),
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::InvariantViolation(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is a business-rule failure rather than an infrastructure fault
    pub fn is_business(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Whether retrying the whole unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }

    /// Wrap an infrastructure fault with the request correlation id
    pub fn with_correlation(self, correlation_id: Uuid) -> Self {
        match self {
            Error::Fault { .. } => self,
            other => Error::Fault {
                correlation_id,
                source: Box::new(other),
            },
        }
    }

    /// Correlation id, if this error left a coordinated request
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Error::Fault { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            // Lock wait expiry and detected deadlocks surface as Busy/TimedOut/TryAgain
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TimedOut | rocksdb::ErrorKind::TryAgain => {
                Error::ConcurrencyConflict(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::ExternalService(format!("Catalog request failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_errors_are_not_internal() {
        let err = Error::InsufficientFunds {
            required: Decimal::new(150, 0),
            available: Decimal::new(100, 0),
        };
        assert!(err.is_business());
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let err = Error::Storage("disk gone".to_string());
        assert!(!err.is_business());
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_fault_keeps_inner_kind_and_correlation() {
        let id = Uuid::now_v7();
        let err = Error::Storage("boom".to_string()).with_correlation(id);
        assert_eq!(err.correlation_id(), Some(id));
        assert_eq!(err.kind(), ErrorKind::Internal);

        // Wrapping twice keeps the first id
        let err = err.with_correlation(Uuid::now_v7());
        assert_eq!(err.correlation_id(), Some(id));
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(Error::ConcurrencyConflict("x".into()).is_retryable());
        assert!(!Error::Validation("x".into()).is_retryable());
    }
}
