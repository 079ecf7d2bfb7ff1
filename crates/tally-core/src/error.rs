//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - General domain errors                          │
//! │  ├── ValidationError  - Input validation failures                      │
//! │  └── VaultError       - Key material / AEAD failures                   │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - What the scheduler sees                        │
//! │                                                                         │
//! │  Flow: ValidationError / VaultError → SyncError → scheduler / CLI      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A malformed vault key is a configuration problem and a tag that fails to
//! verify is an authentication problem; the two never share a variant.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored value could not be interpreted as a domain value.
    ///
    /// ## When This Occurs
    /// - A state column holds an unknown variant
    /// - A stored meta object is not valid JSON
    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Vault error (wraps VaultError).
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur before any side effect: bad ids, unsupported
/// providers, empty keys, oversized payloads. They are never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Payload is larger than allowed.
    #[error("{field} must be at most {max} bytes (got {actual})")]
    TooLarge {
        field: String,
        max: usize,
        actual: usize,
    },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid id characters, invalid date).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Provider id is not registered.
    #[error("Unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },

    /// Date range is inverted.
    #[error("Invalid date range: {from} is after {to}")]
    InvertedRange { from: String, to: String },
}

// =============================================================================
// Vault Error
// =============================================================================

/// Credential vault errors.
///
/// ## Categories
/// ```text
/// InvalidKeyMaterial   → configuration error (bad TALLY_VAULT_KEY)
/// MalformedBundle      → stored bundle cannot even be decoded
/// AuthenticationFailed → wrong key, tampered iv / tag / data
/// Payload              → authenticated plaintext is not the expected shape
/// ```
#[derive(Debug, Error)]
pub enum VaultError {
    /// Key material is not 64 hex characters.
    #[error("Invalid vault key material: {0}")]
    InvalidKeyMaterial(String),

    /// A bundle component is not valid base64 or has the wrong length.
    #[error("Malformed cipher bundle: {0}")]
    MalformedBundle(String),

    /// The AEAD tag did not verify.
    #[error("Credential authentication failed")]
    AuthenticationFailed,

    /// The plaintext could not be (de)serialized.
    #[error("Credential payload error: {0}")]
    Payload(String),
}

impl VaultError {
    /// Returns true if this error points at configuration rather than data.
    pub fn is_config_error(&self) -> bool {
        matches!(self, VaultError::InvalidKeyMaterial(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
