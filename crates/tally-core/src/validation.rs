//! # Validation Module
//!
//! Input validation for everything that crosses into Tally from a caller.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Scheduler / CLI                                              │
//! │  └── Argument parsing (clap), date parsing                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Orchestrator / Credential service (Rust)                     │
//! │  ├── THIS MODULE: ids, provider, api key, payload size                 │
//! │  └── Registry lookup (unsupported provider)                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL / CHECK constraints                                      │
//! │  └── UNIQUE (location_id, provider, date)                              │
//! │                                                                         │
//! │  Every check here runs BEFORE any side effect (no run row, no fetch).  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_identifier, validate_api_key};
//!
//! validate_identifier("location_id", "loc-42").unwrap();
//! assert!(validate_api_key("   ").is_err());
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::ConsumptionInput;
use crate::MAX_META_BYTES;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_PROVIDER_LEN: usize = 32;
const MAX_API_KEY_LEN: usize = 4096;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a client or location identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Letters, digits, `-`, `_`, `.`, `:` only
///
/// ## Example
/// ```rust
/// use tally_core::validation::validate_identifier;
///
/// assert!(validate_identifier("location_id", "loc-1").is_ok());
/// assert!(validate_identifier("location_id", "").is_err());
/// assert!(validate_identifier("location_id", "has space").is_err());
/// ```
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only letters, numbers, '-', '_', '.', ':'".to_string(),
        });
    }

    Ok(())
}

/// Validates the shape of a provider id.
///
/// Whether the provider is actually registered is the registry's call;
/// this only rejects ids that could never be registered.
pub fn validate_provider_id(provider: &str) -> ValidationResult<()> {
    if provider.is_empty() {
        return Err(ValidationError::Required {
            field: "provider".to_string(),
        });
    }

    if provider.len() > MAX_PROVIDER_LEN {
        return Err(ValidationError::TooLong {
            field: "provider".to_string(),
            max: MAX_PROVIDER_LEN,
        });
    }

    if !provider
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ValidationError::UnsupportedProvider {
            provider: provider.to_string(),
        });
    }

    Ok(())
}

/// Validates a provider API key before it is sent anywhere.
pub fn validate_api_key(api_key: &str) -> ValidationResult<()> {
    if api_key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "api_key".to_string(),
        });
    }

    if api_key.len() > MAX_API_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "api_key".to_string(),
            max: MAX_API_KEY_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Payload Validators
// =============================================================================

/// Validates that a meta object is a JSON object within [`MAX_META_BYTES`].
pub fn validate_meta(meta: &Value) -> ValidationResult<()> {
    if !meta.is_object() {
        return Err(ValidationError::InvalidFormat {
            field: "meta".to_string(),
            reason: "must be a JSON object".to_string(),
        });
    }

    let size = meta.to_string().len();
    if size > MAX_META_BYTES {
        return Err(ValidationError::TooLarge {
            field: "meta".to_string(),
            max: MAX_META_BYTES,
            actual: size,
        });
    }

    Ok(())
}

/// Validates a consumption upsert before it reaches the database.
pub fn validate_consumption(input: &ConsumptionInput) -> ValidationResult<()> {
    validate_identifier("client_id", &input.client_id)?;
    validate_identifier("location_id", &input.location_id)?;
    validate_provider_id(&input.provider)?;

    if input.orders < 0 {
        return Err(ValidationError::OutOfRange {
            field: "orders".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    if !input.items.is_finite() {
        return Err(ValidationError::InvalidFormat {
            field: "items".to_string(),
            reason: "must be a finite number".to_string(),
        });
    }

    validate_meta(&input.meta)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use chrono::NaiveDate;
    use serde_json::json;

    fn input() -> ConsumptionInput {
        ConsumptionInput {
            client_id: "client-1".into(),
            location_id: "loc-1".into(),
            provider: "square".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            total: Money::from_cents(1000),
            orders: 3,
            items: 4.0,
            discounts: Money::zero(),
            taxes: Money::zero(),
            meta: json!({ "provider": "square" }),
        }
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("location_id", "loc-1").is_ok());
        assert!(validate_identifier("location_id", "org:store.12_a").is_ok());

        assert!(validate_identifier("location_id", "").is_err());
        assert!(validate_identifier("location_id", "   ").is_err());
        assert!(validate_identifier("location_id", "a/b").is_err());
        assert!(validate_identifier("location_id", &"a".repeat(200)).is_err());
    }

    #[test]
    fn test_validate_provider_id() {
        assert!(validate_provider_id("square").is_ok());
        assert!(validate_provider_id("").is_err());
        assert!(matches!(
            validate_provider_id("Square!"),
            Err(ValidationError::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sq0atp-abc").is_ok());
        assert!(matches!(
            validate_api_key(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(validate_api_key(&"k".repeat(5000)).is_err());
    }

    #[test]
    fn test_validate_meta() {
        assert!(validate_meta(&json!({})).is_ok());
        assert!(validate_meta(&json!([1, 2])).is_err());

        let huge = json!({ "blob": "x".repeat(MAX_META_BYTES) });
        assert!(matches!(
            validate_meta(&huge),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_consumption() {
        assert!(validate_consumption(&input()).is_ok());

        let mut bad = input();
        bad.orders = -1;
        assert!(validate_consumption(&bad).is_err());

        let mut bad = input();
        bad.items = f64::NAN;
        assert!(validate_consumption(&bad).is_err());

        let mut bad = input();
        bad.client_id = String::new();
        assert!(validate_consumption(&bad).is_err());
    }
}
