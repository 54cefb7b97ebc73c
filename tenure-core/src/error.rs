//! # Error Types
//!
//! Error handling shared by every Tenure crate.

use thiserror::Error;

/// Error types that can occur while contending for a lease.
///
/// Lock conflicts are deliberately absent from this enum: losing a
/// compare-and-swap race is a normal outcome and is reported through
/// [`WriteOutcome::Conflict`](crate::backend::WriteOutcome::Conflict).
///
/// # Error Categories
///
/// - **Transient Errors**: backend unavailability, timeouts, I/O failures.
///   These are retried after the retry period.
/// - **Configuration Errors**: rejected before any election attempt runs.
/// - **Integrity Errors**: a stored lock record that cannot be decoded.
///
/// # Examples
///
/// ```rust
/// use tenure_core::TenureError;
///
/// let error = TenureError::backend("connection reset");
/// if error.is_retryable() {
///     println!("This error can be retried");
/// }
/// ```
#[derive(Error, Debug)]
pub enum TenureError {
    /// Lock backend rejected or failed the request
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Lock backend is temporarily unavailable (rate limited, partitioned)
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    /// Operation exceeded its timeout limit
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// Invalid election configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Stored lock record could not be decoded or failed its integrity check
    #[error("Malformed lock record {lock}: {details}")]
    MalformedRecord { lock: String, details: String },

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File system or network I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results in Tenure.
pub type Result<T> = std::result::Result<T, TenureError>;

impl TenureError {
    /// Creates a new backend error with the given message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new unavailability error with the given message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new configuration error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tenure_core::TenureError;
    ///
    /// let error = TenureError::config("identity must not be empty");
    /// assert!(error.is_fatal());
    /// ```
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a new malformed record error.
    pub fn malformed(lock: impl Into<String>, details: impl Into<String>) -> Self {
        Self::MalformedRecord {
            lock: lock.into(),
            details: details.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Determines if this error condition is transient.
    ///
    /// Retryable errors are absorbed by the election loop: they are logged
    /// and the current attempt carries on after the retry period, bounded by
    /// the renew deadline while leading.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tenure_core::TenureError;
    ///
    /// assert!(TenureError::timeout("read").is_retryable());
    /// assert!(!TenureError::malformed("jobs", "bad checksum").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Unavailable { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Errors that must escape the supervisor to its caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::MalformedRecord { .. } | Self::Serialization(_)
        )
    }
}

impl From<anyhow::Error> for TenureError {
    fn from(err: anyhow::Error) -> Self {
        TenureError::Internal {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TenureError::backend("503").is_retryable());
        assert!(TenureError::unavailable("rate limited").is_retryable());
        assert!(TenureError::Io(std::io::Error::other("disk")).is_retryable());

        assert!(!TenureError::config("bad").is_retryable());
        assert!(!TenureError::internal("bug").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TenureError::config("bad").is_fatal());
        assert!(TenureError::malformed("lock", "crc").is_fatal());
        assert!(!TenureError::timeout("cas").is_fatal());
        assert!(!TenureError::internal("bug").is_fatal());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: TenureError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, TenureError::Internal { ref message } if message == "boom"));
    }
}
