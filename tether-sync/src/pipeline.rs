//! Shared pipeline entrypoint used by CLI and daemon.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tether_core::{paths, schema, Config};
use tether_store::{RecordStore, SqliteRecordStore};

use crate::coordinator::{PendingUpload, SessionReport, SyncScope, SyncSettings, UploadCoordinator};
use crate::error::SyncError;
use crate::format::FormatterRegistry;
use crate::relay::RelayIngester;
use crate::transport::{transport_for, Transport};

/// Result of [`Pipeline::sync`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SyncRun {
    Uploaded(SessionReport),
    /// `--dry-run`: what would have been uploaded.
    Planned { cutoff: i64, pending: Vec<PendingUpload> },
}

/// Store, coordinator and relay ingester wired from one config.
pub struct Pipeline {
    config: Config,
    store: Arc<dyn RecordStore>,
    coordinator: Arc<UploadCoordinator>,
    relay: RelayIngester,
}

impl Pipeline {
    /// Open the store under `<home>/.tether/store` and wire the configured transport.
    pub fn open(home: &Path, config: Config) -> Result<Self, SyncError> {
        let transport = transport_for(&config);
        Self::open_with(home, config, transport)
    }

    /// As [`Pipeline::open`] with an explicit transport.
    pub fn open_with(
        home: &Path,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let store = SqliteRecordStore::open(paths::store_dir(home))?.with_tables(schema::builtin())?;
        Ok(Self::from_parts(config, Arc::new(store), transport))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let coordinator = Arc::new(UploadCoordinator::new(
            store.clone(),
            transport,
            FormatterRegistry::builtin(),
            SyncSettings::from_config(&config),
        ));
        let relay = RelayIngester::new(store.clone());
        Self {
            config,
            store,
            coordinator,
            relay,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<UploadCoordinator> {
        &self.coordinator
    }

    pub fn relay(&self) -> &RelayIngester {
        &self.relay
    }

    /// Run one upload session, or only count pending rows when `dry_run`.
    pub async fn sync(
        &self,
        scope: &SyncScope,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<SyncRun, SyncError> {
        if dry_run {
            let cutoff = Utc::now().timestamp_millis();
            let pending = self.coordinator.pending(cutoff, scope).await?;
            return Ok(SyncRun::Planned { cutoff, pending });
        }
        let report = self.coordinator.run_session(scope, cancel).await?;
        Ok(SyncRun::Uploaded(report))
    }
}
