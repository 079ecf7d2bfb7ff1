//! # Sync Error Types
//!
//! Error types for sync, enrollment and rotation.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Provider      │  │     Credentials         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Transient  ↻   │  │  AuthenticationFailed   │ │
//! │  │  ConfigLoad     │  │  Timeout    ↻   │  │  Vault(..)              │ │
//! │  │  Validation     │  │  Rejected       │  │  MissingCredential      │ │
//! │  │                 │  │  InvalidResponse│  │  RotationUnsupported    │ │
//! │  └─────────────────┘  │  TooManyPages   │  │  CircuitOpen            │ │
//! │                       └─────────────────┘  └─────────────────────────┘ │
//! │  ┌─────────────────┐                                                   │
//! │  │    Database     │   ↻ = absorbed by the retry wrapper               │
//! │  │  Database(..)   │                                                   │
//! │  └─────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A skipped sync is NOT an error: the gate returns a structured skip.

use chrono::{DateTime, Utc};
use thiserror::Error;

use tally_core::{ValidationError, VaultError};
use tally_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure a run, an enrollment or a
/// rotation can end with.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Bad caller input; rejected before any side effect.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// Network failure, 408/429 or 5xx from the provider.
    #[error("{provider} unavailable: {message}")]
    TransientProvider { provider: String, message: String },

    /// A provider call exceeded the request timeout.
    #[error("{provider} request timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// The provider refused the request for a reason retrying won't fix.
    #[error("{provider} rejected request ({status}): {message}")]
    ProviderRejected {
        provider: String,
        status: u16,
        message: String,
    },

    /// The provider answered with something we could not decode.
    #[error("{provider} returned an invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    /// Pagination did not terminate within the configured page limit.
    #[error("{provider} returned more than {max_pages} pages")]
    TooManyPages { provider: String, max_pages: u32 },

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// The provider rejected the credential (401/403).
    #[error("{provider} rejected the credential")]
    AuthenticationFailed { provider: String },

    /// Sealing or opening a credential failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// No credential is enrolled for the pair.
    #[error("No credential enrolled for {location_id}/{provider}")]
    MissingCredential {
        location_id: String,
        provider: String,
    },

    /// The provider has no token refresh flow.
    #[error("{provider} does not support credential rotation")]
    RotationUnsupported { provider: String },

    /// The rotation breaker is open.
    #[error("Credential rotation paused until {resume_at}")]
    CircuitOpen { resume_at: DateTime<Utc> },

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Persistence failed.
    #[error(transparent)]
    Database(#[from] DbError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidConfig(format!("invalid URL: {}", err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried immediately.
    ///
    /// ## Retryable Errors
    /// - Transient provider failures (network, 408, 429, 5xx)
    /// - Timeouts
    /// - Database errors that are about availability, not data
    ///
    /// ## Non-Retryable Errors
    /// - Validation and configuration errors
    /// - Authentication failures
    /// - Provider rejections and undecodable responses
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientProvider { .. } | SyncError::Timeout { .. } => true,
            SyncError::Database(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        match self {
            SyncError::InvalidConfig(_) | SyncError::ConfigLoadFailed(_) => true,
            SyncError::Vault(err) => err.is_config_error(),
            _ => false,
        }
    }

    /// Returns true if a credential was refused, by the provider or by the
    /// vault's authentication tag.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed { .. }
                | SyncError::Vault(VaultError::AuthenticationFailed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> SyncError {
        SyncError::TransientProvider {
            provider: "square".into(),
            message: "503".into(),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(transient().is_retryable());
        assert!(SyncError::Timeout {
            provider: "toast".into(),
            secs: 20
        }
        .is_retryable());
        assert!(SyncError::Database(DbError::PoolExhausted).is_retryable());

        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed {
            provider: "clover".into()
        }
        .is_retryable());
        assert!(!SyncError::Database(DbError::Forbidden).is_retryable());
        assert!(!SyncError::ProviderRejected {
            provider: "square".into(),
            status: 400,
            message: "bad cursor".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_vault_key_is_config_error_not_auth() {
        let bad_key: SyncError = VaultError::InvalidKeyMaterial("short".into()).into();
        assert!(bad_key.is_config_error());
        assert!(!bad_key.is_auth_error());

        let tampered: SyncError = VaultError::AuthenticationFailed.into();
        assert!(tampered.is_auth_error());
        assert!(!tampered.is_config_error());
    }

    #[test]
    fn test_forbidden_message_passes_through() {
        let err: SyncError = DbError::Forbidden.into();
        assert_eq!(err.to_string(), "forbidden");
    }

    #[test]
    fn test_validation_message_passes_through() {
        let err: SyncError = ValidationError::UnsupportedProvider {
            provider: "lightspeed".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Unsupported provider: lightspeed");
    }
}
