mod download;
mod error;
mod flight;
mod manager;
mod metadata;
mod resolver;
mod service;

pub use download::{
    AssetSource, CancelToken, DownloadProgress, HttpAssetSource, RemoteBody,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
pub use error::{ModelError, ModelErrorKind};
pub use manager::{
    AssetDescriptor, EngineAssets, ModelAcquisitionManager, ModelInfo, ModelState,
    SecondaryAsset, DEFAULT_SIZE_TOLERANCE_BYTES,
};
pub use metadata::compute_sha256;
pub use resolver::{HostResolver, StaticHostResolver, SystemResolver};
pub use service::{DownloadHandle, ModelDownloadService};
