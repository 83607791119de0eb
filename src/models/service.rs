use std::{path::PathBuf, sync::Arc, thread};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use super::{CancelToken, DownloadProgress, ModelAcquisitionManager, ModelError};

struct DownloadJob {
    cancel: CancelToken,
    progress: Sender<DownloadProgress>,
    done: Sender<Result<PathBuf, ModelError>>,
}

/// Runs downloads on a dedicated worker thread so callers never block on I/O.
#[derive(Clone)]
pub struct ModelDownloadService {
    sender: Sender<DownloadJob>,
}

impl ModelDownloadService {
    pub fn new(manager: Arc<ModelAcquisitionManager>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name("model-download".into())
            .spawn(move || worker_loop(receiver, manager))
            .context("spawn model download worker")?;
        Ok(Self { sender })
    }

    pub fn queue(&self) -> Result<DownloadHandle> {
        let (progress_tx, progress_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let cancel = CancelToken::new();
        self.sender
            .send(DownloadJob {
                cancel: cancel.clone(),
                progress: progress_tx,
                done: done_tx,
            })
            .context("send model download job to worker")?;
        Ok(DownloadHandle {
            progress: progress_rx,
            done: done_rx,
            cancel,
            latest: None,
        })
    }
}

fn worker_loop(receiver: Receiver<DownloadJob>, manager: Arc<ModelAcquisitionManager>) {
    for job in receiver.iter() {
        if job.cancel.is_cancelled() {
            let _ = job.done.send(Err(ModelError::Cancelled));
            continue;
        }
        let progress = job.progress;
        let result = manager.download_with_cancel(
            |update| {
                // the handle may already be gone; the download still completes
                let _ = progress.send(update);
            },
            &job.cancel,
        );
        if let Err(error) = &result {
            tracing::warn!("Queued model download finished with error: {error}");
        }
        let _ = job.done.send(result);
    }
    tracing::debug!("model download worker stopped");
}

/// Caller side of one queued download.
pub struct DownloadHandle {
    progress: Receiver<DownloadProgress>,
    done: Receiver<Result<PathBuf, ModelError>>,
    cancel: CancelToken,
    latest: Option<DownloadProgress>,
}

impl DownloadHandle {
    pub fn progress(&self) -> &Receiver<DownloadProgress> {
        &self.progress
    }

    /// Most recent observation, draining anything queued since the last call.
    pub fn latest_progress(&mut self) -> Option<DownloadProgress> {
        if let Some(update) = self.progress.try_iter().last() {
            self.latest = Some(update);
        }
        self.latest
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn wait(self) -> Result<PathBuf, ModelError> {
        self.done.recv().unwrap_or(Err(ModelError::Interrupted))
    }

    /// `None` while the download is still running.
    pub fn try_result(&self) -> Option<Result<PathBuf, ModelError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ModelError::Interrupted)),
        }
    }
}
