//! Wires config and database into the services the scheduler calls.

use chrono::Utc;
use tracing::info;

use crate::config::TallyConfig;
use crate::credentials::CredentialService;
use crate::error::SyncResult;
use crate::orchestrator::{SyncOrchestrator, SyncOutcome, SyncRequest};
use crate::provider::ProviderRegistry;
use crate::rotation::{RotationJob, RotationReport};
use tally_core::{CredentialPayload, SyncRun, SyncStatus};
use tally_db::{Database, DbConfig};

/// Everything a scheduler tick needs, built once per process.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    credentials: CredentialService,
    orchestrator: SyncOrchestrator,
    rotation: RotationJob,
}

impl SyncEngine {
    /// Builds the engine over an already open database.
    pub fn new(db: Database, config: &TallyConfig) -> SyncResult<Self> {
        let registry = ProviderRegistry::builtin(config)?;
        Self::with_registry(db, config, registry)
    }

    /// Builds the engine with a caller-supplied provider registry.
    pub fn with_registry(
        db: Database,
        config: &TallyConfig,
        registry: ProviderRegistry,
    ) -> SyncResult<Self> {
        let credentials = CredentialService::new(db.credentials(), config.vault_key()?, registry);
        let orchestrator = SyncOrchestrator::from_config(&db, config, credentials.clone());
        let rotation = RotationJob::from_config(&db, config, credentials.clone());
        Ok(SyncEngine {
            db,
            credentials,
            orchestrator,
            rotation,
        })
    }

    /// Opens the configured database and builds the engine.
    pub async fn open(config: &TallyConfig) -> SyncResult<Self> {
        let path = config.database_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::new(
            DbConfig::new(&path).max_connections(config.database.max_connections),
        )
        .await?;
        info!(path = %path.display(), "Database opened");
        Self::new(db, config)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub async fn sync(&self, request: &SyncRequest) -> SyncResult<SyncOutcome> {
        self.orchestrator.run_pos_sync(request).await
    }

    pub async fn rotate(&self) -> SyncResult<RotationReport> {
        self.rotation.run(Utc::now()).await
    }

    pub async fn enroll(
        &self,
        location_id: &str,
        provider: &str,
        payload: CredentialPayload,
    ) -> SyncResult<i64> {
        self.credentials
            .enroll(location_id, provider, payload, Utc::now())
            .await
    }

    /// Gate row and the latest runs for a pair.
    pub async fn status(
        &self,
        location_id: &str,
        provider: &str,
        runs: u32,
    ) -> SyncResult<(Option<SyncStatus>, Vec<SyncRun>)> {
        let log = self.db.sync_log();
        let status = log.get_status(location_id, provider).await?;
        let recent = log.recent_runs(location_id, provider, runs).await?;
        Ok((status, recent))
    }
}
