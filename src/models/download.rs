use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::blocking::Client;
use serde::Serialize;

use super::{
    error::ModelError,
    resolver::{pinned_address, HostResolver},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const CHUNK_SIZE: usize = 64 * 1024;
const BYTES_PER_MB: f32 = 1024.0 * 1024.0;

/// One progress observation. `None` means the server did not announce a size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded_mb: f32,
    pub total_mb: Option<f32>,
    pub percentage: Option<u8>,
}

impl DownloadProgress {
    pub(crate) fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self {
            downloaded_mb: downloaded as f32 / BYTES_PER_MB,
            total_mb: total.map(|bytes| bytes as f32 / BYTES_PER_MB),
            percentage: total.map(|bytes| percentage_of(downloaded, bytes)),
        }
    }

    /// Synthetic 100% report used when an intact file is already on disk.
    pub(crate) fn complete(total: u64) -> Self {
        Self {
            downloaded_mb: total as f32 / BYTES_PER_MB,
            total_mb: Some(total as f32 / BYTES_PER_MB),
            percentage: Some(100),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.percentage.map_or(false, |value| value >= 100)
    }
}

fn percentage_of(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((downloaded.min(total) as u128 * 100) / total as u128) as u8
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An open response body ready to be streamed to disk.
pub struct RemoteBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

/// Where asset bytes come from.
pub trait AssetSource: Send + Sync {
    fn open(&self, url: &str) -> Result<RemoteBody, ModelError>;
}

/// Blocking HTTP source with bounded timeouts and pluggable host resolution.
pub struct HttpAssetSource {
    resolver: Arc<dyn HostResolver>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HttpAssetSource {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    fn client_for(&self, url: &str) -> Result<Client, ModelError> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout);
        if let Some((host, address)) = pinned_address(self.resolver.as_ref(), url) {
            tracing::debug!(%host, %address, "pinned host resolution");
            builder = builder.resolve(&host, address);
        }
        Ok(builder.build()?)
    }
}

impl AssetSource for HttpAssetSource {
    fn open(&self, url: &str) -> Result<RemoteBody, ModelError> {
        let client = self.client_for(url)?;
        tracing::debug!(%url, "HTTP request: GET");
        let response = client.get(url).send()?;
        let status = response.status();
        let content_length = response.content_length().filter(|len| *len > 0);
        tracing::debug!(%status, ?content_length, "HTTP response");
        if !status.is_success() {
            return Err(ModelError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(RemoteBody {
            content_length,
            reader: Box::new(response),
        })
    }
}

/// Streams `body` into `path`, reporting progress as bytes arrive.
///
/// Known totals are reported only when the whole percentage advances;
/// unknown totals are reported on every chunk. A cancelled transfer leaves
/// the partial file where it is.
pub(crate) fn stream_to_file<F>(
    mut body: RemoteBody,
    path: &Path,
    cancel: &CancelToken,
    progress: &mut F,
) -> Result<u64, ModelError>
where
    F: FnMut(DownloadProgress),
{
    let mut file = File::create(path)
        .map_err(|err| ModelError::io(format!("create {}", path.display()), err))?;
    let total = body.content_length;
    let mut downloaded = 0u64;
    let mut last_percentage: Option<u8> = None;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        let read = match body.reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_error(err)),
        };
        file.write_all(&buffer[..read])
            .map_err(|err| ModelError::io("write download chunk", err))?;
        downloaded += read as u64;

        let update = DownloadProgress::new(downloaded, total);
        match update.percentage {
            Some(current) if last_percentage.map_or(false, |last| current <= last) => {}
            percentage => {
                last_percentage = percentage;
                progress(update);
            }
        }
    }
    file.flush()
        .map_err(|err| ModelError::io("flush download", err))?;
    file.sync_all()
        .map_err(|err| ModelError::io("sync download", err))?;
    Ok(downloaded)
}

fn read_error(err: io::Error) -> ModelError {
    if err.kind() == io::ErrorKind::TimedOut {
        return ModelError::Http {
            url: String::new(),
            message: err.to_string(),
            timed_out: true,
        };
    }
    // reqwest surfaces body failures as io errors wrapping its own error type
    match err.get_ref().and_then(|inner| inner.downcast_ref::<reqwest::Error>()) {
        Some(_) => ModelError::Http {
            url: String::new(),
            message: err.to_string(),
            timed_out: false,
        },
        None => ModelError::io("read download chunk", err),
    }
}

/// Moves `staging` over `target`. Delete-then-rename: replacing in one step
/// is not guaranteed on every filesystem.
pub(crate) fn replace_file(staging: &Path, target: &Path) -> Result<(), ModelError> {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(ModelError::io(
                format!("remove previous {}", target.display()),
                err,
            ))
        }
    }
    fs::rename(staging, target).map_err(|source| ModelError::Rename {
        from: staging.to_path_buf(),
        to: target.to_path_buf(),
        source: Arc::new(source),
    })
}
