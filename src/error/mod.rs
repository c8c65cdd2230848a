//! Error types and handling for the messaging engine.
//!
//! Every error carries enough structured metadata (category, severity, retry
//! strategy) for callers like the Forwarder and RetryScheduler to decide
//! whether a failure should become a retry, a terminal status, or a dropped
//! packet, without string-matching messages.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error categories for monitoring and dispatch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Crypto,
    Codec,
    Persistence,
    Validation,
    Scheduling,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Crypto => ErrorSeverity::Critical,
            Self::Transport | Self::Persistence => ErrorSeverity::High,
            Self::Scheduling => ErrorSeverity::Medium,
            Self::Validation | Self::Configuration => ErrorSeverity::Low,
            Self::Codec | Self::Internal => ErrorSeverity::Medium,
        }
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Transport => RetryStrategy::ExponentialBackoff { max_retries: 3 },
            Self::Persistence => RetryStrategy::ExponentialBackoff { max_retries: 2 },
            Self::Scheduling => RetryStrategy::LinearBackoff { max_retries: 1 },
            Self::Validation | Self::Crypto | Self::Configuration | Self::Codec => {
                RetryStrategy::NoRetry
            }
            Self::Internal => RetryStrategy::NoRetry,
        }
    }
}

/// Severity levels used for log-level selection and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery strategy recommended for an error category.
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    NoRetry,
    LinearBackoff { max_retries: u32 },
    ExponentialBackoff { max_retries: u32 },
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("no connected peers")]
    NoPeers,

    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    #[error("crypto subsystem unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("message failed integrity check")]
    Tampered,

    #[error("message expired")]
    Expired,

    #[error("duplicate message filtered")]
    DuplicateFiltered,

    #[error("persistence error: {0}")]
    PersistenceError(String),

    #[error("max retry attempts exceeded for {0}")]
    MaxRetriesExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable string code suitable for telemetry and log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Sqlite(_) => "SQLITE_ERROR",
            Error::Configuration(_) => "CONFIGURATION_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Error::NoPeers => "NO_PEERS",
            Error::EncodeFailed(_) => "ENCODE_FAILED",
            Error::DecodeFailed(_) => "DECODE_FAILED",
            Error::CryptoUnavailable(_) => "CRYPTO_UNAVAILABLE",
            Error::Tampered => "TAMPERED",
            Error::Expired => "EXPIRED",
            Error::DuplicateFiltered => "DUPLICATE_FILTERED",
            Error::PersistenceError(_) => "PERSISTENCE_ERROR",
            Error::MaxRetriesExceeded(_) => "MAX_RETRIES_EXCEEDED",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) => ErrorCategory::Internal,
            Error::Database(_) | Error::Sqlite(_) | Error::PersistenceError(_) => {
                ErrorCategory::Persistence
            }
            Error::Configuration(_) => ErrorCategory::Configuration,
            Error::Validation(_) => ErrorCategory::Validation,
            Error::TransportUnavailable(_) | Error::NoPeers => ErrorCategory::Transport,
            Error::EncodeFailed(_) | Error::DecodeFailed(_) => ErrorCategory::Codec,
            Error::CryptoUnavailable(_) | Error::Tampered => ErrorCategory::Crypto,
            Error::Expired | Error::DuplicateFiltered => ErrorCategory::Codec,
            Error::MaxRetriesExceeded(_) => ErrorCategory::Scheduling,
            Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.category().severity()
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        self.category().retry_strategy()
    }

    /// Whether a retry can reasonably recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportUnavailable(_)
                | Error::NoPeers
                | Error::PersistenceError(_)
                | Error::Database(_)
                | Error::Sqlite(_)
        )
    }
}
