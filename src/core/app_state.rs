use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::models::{
    AssetSource, DownloadHandle, ModelAcquisitionManager, ModelDownloadService, ModelState,
};
use crate::quota::{NetworkTimeSource, QuotaLedger, RefreshOutcome};
use crate::store::{JsonFileStore, KeyValueStore};

use super::settings::GatekeeperConfig;

/// Both gatekeeping components wired to one store.
pub struct Gatekeeper {
    store: Arc<dyn KeyValueStore>,
    models: Arc<ModelAcquisitionManager>,
    ledger: Arc<QuotaLedger>,
    downloads: Mutex<Option<ModelDownloadService>>,
}

impl Gatekeeper {
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        let store_path = config.store_path()?;
        let store = JsonFileStore::open(&store_path)
            .with_context(|| format!("open state store {store_path:?}"))?;
        tracing::debug!("state store at {}", store_path.display());
        Self::with_components(
            config,
            Arc::new(store),
            Arc::new(config.asset_source()),
            Arc::new(config.time_source()),
        )
    }

    /// Composes the components from explicit collaborators.
    pub fn with_components(
        config: &GatekeeperConfig,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn AssetSource>,
        clock: Arc<dyn NetworkTimeSource>,
    ) -> Result<Self> {
        let models = ModelAcquisitionManager::new(
            config.descriptor(),
            config.models_root()?,
            Arc::clone(&store),
            source,
        );
        let ledger = QuotaLedger::open(Arc::clone(&store), clock, config.policy()?)
            .context("open credit ledger")?;
        Ok(Self {
            store,
            models: Arc::new(models),
            ledger: Arc::new(ledger),
            downloads: Mutex::new(None),
        })
    }

    /// Reconciles the model record against the disk and, when network time
    /// is reachable, applies any pending weekly reset.
    pub fn start(&self) -> ModelState {
        let state = self.models.reconcile();
        tracing::info!(%state, "model state reconciled");
        match self.ledger.refresh() {
            Ok(RefreshOutcome::Reset { boundary_ms }) => {
                tracing::info!(boundary_ms, "credits renewed for the new week")
            }
            Ok(RefreshOutcome::Unchanged) => {}
            Err(error) => tracing::warn!("Credit refresh skipped: {error}"),
        }
        state
    }

    pub fn models(&self) -> &Arc<ModelAcquisitionManager> {
        &self.models
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn model_root(&self) -> PathBuf {
        self.models.root().to_path_buf()
    }

    /// Queues a background download, starting the worker on first use.
    pub fn queue_model_download(&self) -> Result<DownloadHandle> {
        let mut guard = self.downloads.lock();
        let service = match guard.as_ref() {
            Some(service) => service.clone(),
            None => {
                let service = ModelDownloadService::new(Arc::clone(&self.models))?;
                *guard = Some(service.clone());
                service
            }
        };
        service.queue()
    }
}
