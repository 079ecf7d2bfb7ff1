//! # Credential Service
//!
//! Enrollment and decryption of provider credentials.
//!
//! ## Enrollment order
//! ```text
//! validate input ──► provider.validate(key) ──► seal ──► upsert row
//!      │                    │
//!      ▼                    ▼
//!  ValidationError    AuthenticationFailed        (nothing stored)
//! ```
//! A key is only stored after the provider accepted it.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::provider::{AdapterContext, ProviderRegistry};
use tally_core::validation::{validate_api_key, validate_identifier, validate_provider_id};
use tally_core::vault::{open, seal};
use tally_core::{CredentialPayload, CredentialRecord, VaultKey};
use tally_db::CredentialRepository;

/// Seals, stores and opens provider credentials.
#[derive(Clone)]
pub struct CredentialService {
    repo: CredentialRepository,
    key: VaultKey,
    registry: ProviderRegistry,
}

impl CredentialService {
    pub fn new(repo: CredentialRepository, key: VaultKey, registry: ProviderRegistry) -> Self {
        CredentialService {
            repo,
            key,
            registry,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Checks a key with the provider, then stores it sealed.
    ///
    /// Replaces any existing credential for the pair.
    ///
    /// ## Returns
    /// The stored row's version.
    ///
    /// ## Errors
    /// * `SyncError::Validation` - bad ids, unknown provider, empty key
    /// * `SyncError::AuthenticationFailed` - the provider refused the key
    pub async fn enroll(
        &self,
        location_id: &str,
        provider: &str,
        payload: CredentialPayload,
        now: DateTime<Utc>,
    ) -> SyncResult<i64> {
        validate_identifier("location_id", location_id)?;
        validate_provider_id(provider)?;
        validate_api_key(&payload.api_key)?;

        let adapter = self.registry.create(
            provider,
            AdapterContext::for_credential(location_id, payload.clone()),
        )?;
        if !adapter.validate(&payload.api_key).await? {
            warn!(location_id, provider, "Provider refused credential at enrollment");
            return Err(SyncError::AuthenticationFailed {
                provider: provider.to_string(),
            });
        }

        let bundle = seal(&self.key, &payload)?;
        let version = self
            .repo
            .upsert(location_id, provider, &bundle, payload.expires_at, now)
            .await?;

        info!(location_id, provider, version, "Credential enrolled");
        Ok(version)
    }

    /// The stored row for a pair.
    ///
    /// ## Errors
    /// * `SyncError::MissingCredential` - nothing enrolled
    pub async fn record(&self, location_id: &str, provider: &str) -> SyncResult<CredentialRecord> {
        self.repo
            .get(location_id, provider)
            .await?
            .ok_or_else(|| SyncError::MissingCredential {
                location_id: location_id.to_string(),
                provider: provider.to_string(),
            })
    }

    /// Decrypts a stored row.
    pub fn decrypt(&self, record: &CredentialRecord) -> SyncResult<CredentialPayload> {
        let payload: CredentialPayload = open(&self.key, &record.bundle)?;
        debug!(
            location_id = %record.location_id,
            provider = %record.provider,
            version = record.version,
            "Opened credential"
        );
        Ok(payload)
    }

    /// Loads and decrypts the credential for a pair.
    pub async fn load_payload(
        &self,
        location_id: &str,
        provider: &str,
    ) -> SyncResult<CredentialPayload> {
        let record = self.record(location_id, provider).await?;
        self.decrypt(&record)
    }

    /// Seals `payload` and swaps it in iff the row is still at
    /// `expected_version`.
    pub async fn swap(
        &self,
        record: &CredentialRecord,
        payload: &CredentialPayload,
        now: DateTime<Utc>,
    ) -> SyncResult<i64> {
        let bundle = seal(&self.key, payload)?;
        let version = self
            .repo
            .swap(
                &record.location_id,
                &record.provider,
                record.version,
                &bundle,
                payload.expires_at,
                now,
            )
            .await?;
        Ok(version)
    }

    /// Credentials expiring at or before `deadline`.
    pub async fn due(&self, deadline: DateTime<Utc>) -> SyncResult<Vec<CredentialRecord>> {
        Ok(self.repo.list_due(deadline).await?)
    }
}
