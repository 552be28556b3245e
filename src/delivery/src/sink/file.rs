use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::Record;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SinkClient;
use crate::{DeliveryError, DeliveryResult};

/// Newline-delimited JSON written to `{base}-{timestamp}` files.
///
/// A rotation task owned by the sink swaps in a fresh file every
/// `rotation_interval`. Writers and the rotation task serialize on the same lock,
/// so a handle never has two concurrent writers.
pub struct FileSink {
    base_path: PathBuf,
    state: Arc<Mutex<FileState>>,
    rotation_token: CancellationToken,
    rotation_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct FileState {
    file: Option<File>,
    path: PathBuf,
}

/// Name of the file opened at this instant for `base`
pub fn timestamped_path(base: &Path) -> PathBuf {
    let suffix = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-{suffix}"));
    PathBuf::from(name)
}

async fn open_file(base: &Path) -> DeliveryResult<(File, PathBuf)> {
    if let Some(parent) = base.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let path = timestamped_path(base);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    Ok((file, path))
}

impl FileSink {
    /// Open the first file and start the rotation task
    pub async fn open(base_path: PathBuf, rotation_interval: Duration) -> DeliveryResult<Self> {
        let (file, path) = open_file(&base_path).await?;
        log::info!("Opened file sink at {}", path.display());

        let state = Arc::new(Mutex::new(FileState {
            file: Some(file),
            path,
        }));
        let rotation_token = CancellationToken::new();
        let handle = tokio::spawn(rotate_periodically(
            base_path.clone(),
            state.clone(),
            rotation_interval,
            rotation_token.clone(),
        ));

        Ok(Self {
            base_path,
            state,
            rotation_token,
            rotation_handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Path of the file currently receiving records
    pub async fn current_path(&self) -> PathBuf {
        self.state.lock().await.path.clone()
    }

    /// Close the current file and continue in a new one
    pub async fn rotate(&self) -> DeliveryResult<()> {
        rotate_once(&self.base_path, &self.state).await
    }
}

async fn rotate_once(base_path: &Path, state: &Mutex<FileState>) -> DeliveryResult<()> {
    let mut state = state.lock().await;
    let Some(old) = state.file.as_mut() else {
        return Err(DeliveryError::SinkClosed);
    };
    old.flush().await?;

    let (file, path) = open_file(base_path).await?;
    let previous = std::mem::replace(&mut state.path, path);
    state.file = Some(file);

    tracing::info!(
        previous = %previous.display(),
        current = %state.path.display(),
        "Rotated file sink"
    );
    Ok(())
}

async fn rotate_periodically(
    base_path: PathBuf,
    state: Arc<Mutex<FileState>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match rotate_once(&base_path, &state).await {
                    Ok(()) => {}
                    Err(DeliveryError::SinkClosed) => break,
                    Err(e) => log::error!(
                        "Failed to rotate file sink {}: {}",
                        base_path.display(),
                        e
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl SinkClient for FileSink {
    fn describe(&self) -> String {
        format!("file:{}", self.base_path.display())
    }

    async fn send(&self, record: &Record) -> DeliveryResult<()> {
        let mut line = record.to_json()?;
        line.push('\n');

        let mut state = self.state.lock().await;
        let file = state.file.as_mut().ok_or(DeliveryError::SinkClosed)?;
        file.write_all(line.as_bytes()).await?;
        // tokio hands writes to a blocking thread; flush waits for completion
        file.flush().await?;
        Ok(())
    }

    async fn close(&self) -> DeliveryResult<()> {
        self.rotation_token.cancel();

        let handle = self
            .rotation_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!(
                    "File rotation task for {} ended abnormally: {e}",
                    self.base_path.display()
                );
            }
        }

        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            log::info!("Closed file sink at {}", state.path.display());
        }
        Ok(())
    }
}
