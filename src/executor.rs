use crate::asset::AssetDescriptor;
use crate::config::OverwritePolicy;
use crate::error::FetchError;
use crate::source::Source;
use futures_util::StreamExt;
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

const HASH_BUFFER: usize = 64 * 1024;

/// What a successful fetch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub bytes_written: u64,
    /// False when the destination already satisfied the descriptor.
    pub transferred: bool,
}

/// Temporary file next to the destination. Removed on drop unless it was
/// renamed into place.
struct PartialFile {
    path: PathBuf,
    file: Option<File>,
}

impl PartialFile {
    async fn create(destination: &Path) -> Result<Self, FetchError> {
        let dir = parent_dir(destination);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FetchError::io(&dir, e))?;

        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());
        remove_stale_partials(&dir, &name).await;
        let unique = PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(".{name}.{}-{unique}.partial", std::process::id()));

        let file = File::create(&path)
            .await
            .map_err(|e| FetchError::io(&path, e))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk)
                .await
                .map_err(|e| FetchError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Flushes and syncs so the data is on disk before the rename.
    async fn close(&mut self) -> Result<(), FetchError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| FetchError::io(&self.path, e))?;
            file.sync_all()
                .await
                .map_err(|e| FetchError::io(&self.path, e))?;
        }
        Ok(())
    }

    async fn persist(mut self, destination: &Path) -> Result<(), FetchError> {
        self.close().await?;
        tokio::fs::rename(&self.path, destination)
            .await
            .map_err(|e| FetchError::io(destination, e))?;
        self.path = PathBuf::new();
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        drop(self.file.take());
        if !self.path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Removes temp files for `name` left by a process that was killed before
/// it could clean up. Files of the current process belong to live transfers.
async fn remove_stale_partials(dir: &Path, name: &str) {
    let prefix = format!(".{name}.");
    let own = format!("{prefix}{}-", std::process::id());
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(rest) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        let stale = file_name.ends_with(".partial")
            && !file_name.starts_with(&own)
            && rest.trim_end_matches(".partial").contains('-');
        if stale {
            debug!("Removing stale partial file {:?}", entry.path());
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Transfers single assets. Cheap to share between tasks.
pub struct Executor {
    http: reqwest::Client,
    s3: Option<aws_sdk_s3::Client>,
    overwrite: OverwritePolicy,
    read_timeout: Duration,
}

impl Executor {
    pub fn new(
        http: reqwest::Client,
        s3: Option<aws_sdk_s3::Client>,
        overwrite: OverwritePolicy,
        read_timeout: Duration,
    ) -> Self {
        Self {
            http,
            s3,
            overwrite,
            read_timeout,
        }
    }

    pub async fn fetch(
        &self,
        descriptor: &AssetDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Transfer, FetchError> {
        let uri = descriptor.source_uri();
        let destination = descriptor.destination_path();
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                uri: uri.to_string(),
            });
        }

        if self.is_satisfied(descriptor).await? {
            debug!("{} already present at {:?}", descriptor.key(), destination);
            return Ok(Transfer {
                bytes_written: 0,
                transferred: false,
            });
        }

        let source = Source::parse(uri)?;
        let mut partial = PartialFile::create(destination).await?;
        debug!("Fetching {uri} to {:?}", partial.path);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled { uri: uri.to_string() }),
            opened = tokio::time::timeout(
                self.read_timeout,
                source.open(uri, &self.http, self.s3.as_ref()),
            ) => opened.map_err(|_| FetchError::Transport {
                uri: uri.to_string(),
                message: format!("no response within {:?}", self.read_timeout),
            })??,
        };

        let expected_size = descriptor.expected_size();
        if let (Some(expected), Some(announced)) = (expected_size, opened.length) {
            if expected != announced {
                return Err(FetchError::SizeMismatch {
                    uri: uri.to_string(),
                    expected,
                    actual: announced,
                });
            }
        }

        let mut hasher = descriptor.expected_checksum().map(|c| c.algorithm.hasher());
        let mut body = opened.body;
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled { uri: uri.to_string() }),
                next = tokio::time::timeout(self.read_timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(FetchError::Transport {
                        uri: uri.to_string(),
                        message: format!("no data received for {:?}", self.read_timeout),
                    })
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            written += chunk.len() as u64;
            if let Some(expected) = expected_size {
                if written > expected {
                    return Err(FetchError::SizeMismatch {
                        uri: uri.to_string(),
                        expected,
                        actual: written,
                    });
                }
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            partial.write(&chunk).await?;
        }
        partial.close().await?;

        if let Some(expected) = expected_size {
            if written != expected {
                return Err(FetchError::SizeMismatch {
                    uri: uri.to_string(),
                    expected,
                    actual: written,
                });
            }
        }
        if let (Some(expected), Some(hasher)) = (descriptor.expected_checksum(), hasher) {
            let actual = hasher.finalize_hex();
            if actual != expected.digest {
                return Err(FetchError::ChecksumMismatch {
                    uri: uri.to_string(),
                    expected: expected.digest.clone(),
                    actual,
                });
            }
        }

        partial.persist(destination).await?;
        debug!("Wrote {written} bytes to {:?}", destination);
        Ok(Transfer {
            bytes_written: written,
            transferred: true,
        })
    }

    /// Whether the file at the destination can stand in for a transfer
    /// under the configured overwrite policy.
    async fn is_satisfied(&self, descriptor: &AssetDescriptor) -> Result<bool, FetchError> {
        let destination = descriptor.destination_path();
        if self.overwrite == OverwritePolicy::Always {
            return Ok(false);
        }
        let metadata = match tokio::fs::metadata(destination).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FetchError::io(destination, e)),
        };
        if self.overwrite == OverwritePolicy::SkipIfPresent {
            return Ok(true);
        }

        if let Some(expected) = descriptor.expected_size() {
            if metadata.len() != expected {
                debug!(
                    "{:?} has {} bytes, expected {expected}",
                    destination,
                    metadata.len()
                );
                return Ok(false);
            }
        }
        if let Some(expected) = descriptor.expected_checksum() {
            let mut file = File::open(destination)
                .await
                .map_err(|e| FetchError::io(destination, e))?;
            let mut hasher = expected.algorithm.hasher();
            let mut buffer = vec![0u8; HASH_BUFFER];
            loop {
                let n = file
                    .read(&mut buffer)
                    .await
                    .map_err(|e| FetchError::io(destination, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            if hasher.finalize_hex() != expected.digest {
                debug!("{:?} does not match {expected}", destination);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
