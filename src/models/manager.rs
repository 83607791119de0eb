use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::store::{keys, Edit, KeyValueStore};

use super::{
    download::{self, AssetSource, CancelToken, DownloadProgress},
    error::ModelError,
    flight::SingleFlight,
    metadata::{available_space, compute_sha256, file_len, is_non_empty_file},
};

pub const DEFAULT_SIZE_TOLERANCE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    NotReady,
    Downloading,
    Ready,
    Error,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::NotReady => "NOT_READY",
            ModelState::Downloading => "DOWNLOADING",
            ModelState::Ready => "READY",
            ModelState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NOT_READY" => Ok(ModelState::NotReady),
            "DOWNLOADING" => Ok(ModelState::Downloading),
            "READY" => Ok(ModelState::Ready),
            "ERROR" => Ok(ModelState::Error),
            other => Err(format!("unknown model state {other:?}")),
        }
    }
}

/// Optional companion file (e.g. a multimodal projector).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryAsset {
    pub object_key: String,
    pub file_name: String,
}

/// Everything the manager needs to know about the asset it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub display_name: String,
    pub version: String,
    pub base_url: String,
    pub object_key: String,
    pub file_name: String,
    /// Zero when the size is not known up front.
    pub expected_size_bytes: u64,
    pub size_tolerance_bytes: u64,
    pub sha256: Option<String>,
    pub secondary: Option<SecondaryAsset>,
}

impl AssetDescriptor {
    #[must_use]
    pub fn primary_url(&self) -> String {
        join_url(&self.base_url, &self.object_key)
    }

    #[must_use]
    pub fn secondary_url(&self) -> Option<String> {
        self.secondary
            .as_ref()
            .map(|asset| join_url(&self.base_url, &asset.object_key))
    }

    fn size_within_tolerance(&self, size: u64) -> bool {
        size.abs_diff(self.expected_size_bytes) <= self.size_tolerance_bytes
    }
}

fn join_url(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub size_mb: u64,
    pub file_name: String,
}

/// Files the inference engine is started with.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineAssets {
    pub model: PathBuf,
    pub projector: Option<PathBuf>,
}

/// Owns the lifecycle of the on-device inference asset.
///
/// The persisted state can disagree with what is on disk after a crash or
/// after the user clears storage; call [`reconcile`](Self::reconcile) once at
/// startup before trusting [`state`](Self::state).
pub struct ModelAcquisitionManager {
    descriptor: AssetDescriptor,
    root: PathBuf,
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn AssetSource>,
    flight: SingleFlight<Result<PathBuf, ModelError>>,
    /// Held across a whole reconcile and while a download claims the record.
    reconciling: Mutex<()>,
}

impl ModelAcquisitionManager {
    pub fn new(
        descriptor: AssetDescriptor,
        root: impl Into<PathBuf>,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn AssetSource>,
    ) -> Self {
        Self {
            descriptor,
            root: root.into(),
            store,
            source,
            flight: SingleFlight::new(),
            reconciling: Mutex::new(()),
        }
    }

    pub fn descriptor(&self) -> &AssetDescriptor {
        &self.descriptor
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Persisted state as-is. Unreadable or unknown values read as `NotReady`.
    pub fn state(&self) -> ModelState {
        match self.store.get(keys::MODEL_STATE) {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!("Invalid model state, defaulting to NOT_READY: {err}");
                ModelState::NotReady
            }),
            Ok(None) => ModelState::NotReady,
            Err(error) => {
                tracing::warn!("Failed to read model state: {error}");
                ModelState::NotReady
            }
        }
    }

    /// Recomputed from the filesystem on every call.
    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
            && is_non_empty_file(&self.primary_file())
            && self.secondary_present()
    }

    pub fn is_downloading(&self) -> bool {
        self.flight.is_running()
    }

    pub fn primary_asset_path(&self) -> Option<PathBuf> {
        if self.state() != ModelState::Ready {
            return None;
        }
        match self.store.get(keys::MODEL_PATH) {
            Ok(path) => path.map(PathBuf::from),
            Err(error) => {
                tracing::warn!("Failed to read model path: {error}");
                None
            }
        }
    }

    pub fn secondary_asset_path(&self) -> Option<PathBuf> {
        self.secondary_file()
            .filter(|path| is_non_empty_file(path))
    }

    pub fn installed_version(&self) -> Option<String> {
        self.store.get(keys::MODEL_VERSION).ok().flatten()
    }

    pub fn engine_assets(&self) -> Option<EngineAssets> {
        if !self.is_ready() {
            return None;
        }
        Some(EngineAssets {
            model: self.primary_asset_path()?,
            projector: self.secondary_asset_path(),
        })
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.descriptor.display_name.clone(),
            version: self.descriptor.version.clone(),
            size_mb: self.descriptor.expected_size_bytes / (1024 * 1024),
            file_name: self.descriptor.file_name.clone(),
        }
    }

    pub fn download<F>(&self, progress: F) -> Result<PathBuf, ModelError>
    where
        F: FnMut(DownloadProgress),
    {
        self.download_with_cancel(progress, &CancelToken::new())
    }

    /// Downloads (or adopts an intact copy of) the asset and marks it ready.
    ///
    /// Overlapping calls share one transfer: later callers block until the
    /// first finishes and receive its result without progress updates.
    pub fn download_with_cancel<F>(
        &self,
        mut progress: F,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ModelError>
    where
        F: FnMut(DownloadProgress),
    {
        self.flight
            .run(|| self.run_download(&mut progress, cancel))
    }

    /// Repairs divergence between the persisted state and the files on disk.
    pub fn reconcile(&self) -> ModelState {
        // a download started after this check blocks in `run_download` until we finish
        let _claim = self.reconciling.lock();
        if self.flight.is_running() {
            tracing::debug!("download in flight, skipping reconciliation");
            return self.state();
        }

        let state = self.state();
        let primary = self.primary_file();
        tracing::debug!(
            %state,
            primary_exists = primary.exists(),
            primary_mb = file_len(&primary).unwrap_or(0) / (1024 * 1024),
            "reconciling model state"
        );

        match state {
            ModelState::Downloading => {
                self.clear_transient_files();
                self.demote();
                ModelState::NotReady
            }
            ModelState::Ready => {
                if self.invariant_holds() {
                    tracing::debug!("Model files verified, keeping READY state");
                    ModelState::Ready
                } else {
                    // metadata is untrusted, the primary bytes may still be reusable
                    self.clear_transient_files();
                    self.demote();
                    tracing::warn!("Model files incomplete, changed to NOT_READY");
                    ModelState::NotReady
                }
            }
            other => {
                self.clear_transient_files();
                other
            }
        }
    }

    pub fn delete(&self) -> Result<(), ModelError> {
        tracing::debug!("Deleting AI model");
        self.store.commit(&[
            Edit::set(keys::MODEL_STATE, ModelState::NotReady),
            Edit::remove(keys::MODEL_PATH),
            Edit::remove(keys::MODEL_VERSION),
        ])?;
        if self.root.exists() {
            if let Err(error) = fs::remove_dir_all(&self.root) {
                tracing::warn!(
                    "Failed to delete model directory {} completely: {error}",
                    self.root.display()
                );
            }
        }
        Ok(())
    }

    fn run_download(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<PathBuf, ModelError> {
        {
            let _claim = self.reconciling.lock();
            self.persist_state(ModelState::Downloading)?;
        }
        match self.acquire(progress, cancel) {
            Ok(path) => Ok(path),
            Err(ModelError::Cancelled) => {
                tracing::info!("Model download cancelled; transient files left for reconciliation");
                Err(ModelError::Cancelled)
            }
            Err(error) => {
                tracing::warn!("Model download failed: {error}");
                remove_if_present(&self.lock_file());
                if let Err(store_error) = self.persist_state(ModelState::Error) {
                    tracing::warn!("Failed to persist model error state: {store_error}");
                }
                Err(error)
            }
        }
    }

    fn acquire(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<PathBuf, ModelError> {
        fs::create_dir_all(&self.root)
            .map_err(|err| ModelError::io("create model directory", err))?;
        self.clear_transient_files();
        self.write_lock_marker()?;

        let primary = self.primary_file();
        if self.primary_reusable() {
            tracing::info!(
                "Model file already exists and size matches: {}MB (skip re-download)",
                file_len(&primary).unwrap_or(0) / (1024 * 1024)
            );
            progress(DownloadProgress::complete(self.descriptor.expected_size_bytes));
        } else {
            if let Some(len) = file_len(&primary) {
                tracing::warn!(
                    "Existing model file size mismatch: {}MB, will re-download",
                    len / (1024 * 1024)
                );
                fs::remove_file(&primary)
                    .map_err(|err| ModelError::io("remove mismatched model file", err))?;
            }
            self.ensure_free_space()?;
            self.fetch_primary(progress, cancel)?;
        }

        if let (Some(secondary), Some(url)) = (self.secondary_file(), self.descriptor.secondary_url())
        {
            if let Err(error) = self.fetch_secondary(&url, &secondary, cancel) {
                if matches!(error, ModelError::Cancelled) {
                    return Err(error);
                }
                tracing::warn!("Secondary asset download failed (optional): {error}");
            }
        }

        remove_if_present(&self.lock_file());

        let primary_ok = is_non_empty_file(&primary);
        let secondary_ok = self.secondary_present();
        if !(primary_ok && secondary_ok) {
            return Err(ModelError::Incomplete {
                primary_ok,
                secondary_ok,
            });
        }

        let path = absolute(&primary);
        self.store.commit(&[
            Edit::set(keys::MODEL_STATE, ModelState::Ready),
            Edit::set(keys::MODEL_PATH, path.display()),
            Edit::set(keys::MODEL_VERSION, &self.descriptor.version),
        ])?;
        tracing::info!("Model state updated: READY, path: {}", path.display());
        Ok(path)
    }

    fn fetch_primary(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<(), ModelError> {
        let url = self.descriptor.primary_url();
        let staging = self.temp_file();
        tracing::debug!("Downloading main model from: {url}");

        let body = self.source.open(&url)?;
        let announced = body.content_length;
        let received = download::stream_to_file(body, &staging, cancel, &mut |update| {
            progress(update)
        })?;

        if let Err(error) = self.verify_staged(&staging, announced, received) {
            remove_if_present(&staging);
            return Err(error);
        }
        download::replace_file(&staging, &self.primary_file())?;
        tracing::debug!(
            "Model download completed successfully: {}",
            self.primary_file().display()
        );
        Ok(())
    }

    fn verify_staged(
        &self,
        staging: &Path,
        announced: Option<u64>,
        received: u64,
    ) -> Result<(), ModelError> {
        if let Some(expected) = announced {
            if received < expected {
                return Err(ModelError::Truncated { expected, received });
            }
        }
        if self.descriptor.expected_size_bytes > 0 && !self.descriptor.size_within_tolerance(received)
        {
            return Err(ModelError::SizeMismatch {
                expected: self.descriptor.expected_size_bytes,
                actual: received,
            });
        }
        if let Some(expected) = &self.descriptor.sha256 {
            let actual = compute_sha256(staging)
                .map_err(|err| ModelError::io("hash downloaded model", err))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ModelError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn fetch_secondary(
        &self,
        url: &str,
        target: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ModelError> {
        tracing::debug!("Downloading secondary asset from: {url}");
        let staging = part_path(target);
        let body = self.source.open(url)?;
        let announced = body.content_length;
        let received = download::stream_to_file(body, &staging, cancel, &mut |_| {})?;
        if let Some(expected) = announced {
            if received < expected {
                remove_if_present(&staging);
                return Err(ModelError::Truncated { expected, received });
            }
        }
        download::replace_file(&staging, target)
    }

    fn ensure_free_space(&self) -> Result<(), ModelError> {
        let required = self.descriptor.expected_size_bytes;
        if required == 0 {
            return Ok(());
        }
        match available_space(&self.root) {
            Some(available) if available < required => {
                Err(ModelError::InsufficientStorage {
                    required,
                    available,
                })
            }
            _ => Ok(()),
        }
    }

    fn write_lock_marker(&self) -> Result<(), ModelError> {
        let started = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut marker = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.lock_file())
            .map_err(|err| ModelError::io("create download lock", err))?;
        writeln!(marker, "pid={}\nstarted={started}", std::process::id())
            .map_err(|err| ModelError::io("write download lock", err))
    }

    fn primary_reusable(&self) -> bool {
        self.descriptor.expected_size_bytes > 0
            && file_len(&self.primary_file())
                .map_or(false, |len| self.descriptor.size_within_tolerance(len))
    }

    fn invariant_holds(&self) -> bool {
        let primary_ok = match file_len(&self.primary_file()) {
            Some(len) if self.descriptor.expected_size_bytes > 0 => {
                self.descriptor.size_within_tolerance(len)
            }
            Some(len) => len > 0,
            None => false,
        };
        primary_ok && self.secondary_present()
    }

    fn secondary_present(&self) -> bool {
        self.secondary_file()
            .map_or(true, |path| is_non_empty_file(&path))
    }

    fn demote(&self) {
        if let Err(error) = self.persist_state(ModelState::NotReady) {
            tracing::warn!("Failed to persist NOT_READY during reconciliation: {error}");
        }
    }

    fn persist_state(&self, state: ModelState) -> Result<(), ModelError> {
        tracing::debug!(%state, "persisting model state");
        self.store.set(keys::MODEL_STATE, state.as_str())?;
        Ok(())
    }

    fn clear_transient_files(&self) {
        remove_if_present(&self.temp_file());
        remove_if_present(&self.lock_file());
        if let Some(secondary) = self.secondary_file() {
            remove_if_present(&part_path(&secondary));
        }
    }

    fn primary_file(&self) -> PathBuf {
        self.root.join(&self.descriptor.file_name)
    }

    fn secondary_file(&self) -> Option<PathBuf> {
        self.descriptor
            .secondary
            .as_ref()
            .map(|asset| self.root.join(&asset.file_name))
    }

    fn temp_file(&self) -> PathBuf {
        part_path(&self.primary_file())
    }

    fn lock_file(&self) -> PathBuf {
        self.root
            .join(format!("{}.lock", self.descriptor.file_name))
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("removed stale {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("Failed to remove {}: {err}", path.display()),
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
