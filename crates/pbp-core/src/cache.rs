//! Local download cache for remote objects
//!
//! Entries are named `{crc64(uri):016x}-{simple name}` under the download
//! directory. Every download goes to a private `.part` file that is renamed
//! into place once complete, so day-workers sharing the directory never read a
//! half-written entry; concurrent downloads of one uri simply race to an
//! identical rename.

use crate::config::CacheConfig;
use crate::error::{PbpError, Result};
use crate::retry::{with_retry, RetryPolicy, RetryResult};
use crate::storage_backend::{ObjectLocation, StoreRegistry};
use crc::{Crc, CRC_64_ECMA_182};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

const URI_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

static PART_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An object available on the local filesystem
#[derive(Debug)]
pub struct Localized {
    pub location: ObjectLocation,
    pub path: PathBuf,
    /// Held open so a concurrent release cannot pull the file away mid-read
    pub file: File,
    /// Whether the path is a cache entry rather than the original file
    pub downloaded: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadCache {
    download_dir: PathBuf,
    assume_downloaded: bool,
    retain: bool,
    retry: RetryPolicy,
}

impl DownloadCache {
    pub fn new(config: &CacheConfig, retry: RetryPolicy) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            assume_downloaded: config.assume_downloaded_files,
            retain: config.retain_downloaded_files,
            retry,
        }
    }

    pub fn download_dir(&self) -> &std::path::Path {
        &self.download_dir
    }

    /// Cache entry path for a remote object
    pub fn cache_path(&self, location: &ObjectLocation) -> PathBuf {
        let hash = URI_HASH.checksum(location.uri().as_bytes());
        self.download_dir
            .join(format!("{:016x}-{}", hash, location.simple_name()))
    }

    /// Make `location` readable locally, retrying remote fetches
    pub fn localize(&self, stores: &StoreRegistry, location: &ObjectLocation) -> Result<Localized> {
        self.localize_with(stores, location, &self.retry)
    }

    /// Like [`localize`](Self::localize) but with a single attempt
    pub fn localize_once(
        &self,
        stores: &StoreRegistry,
        location: &ObjectLocation,
    ) -> Result<Localized> {
        self.localize_with(stores, location, &RetryPolicy::no_retry())
    }

    fn localize_with(
        &self,
        stores: &StoreRegistry,
        location: &ObjectLocation,
        policy: &RetryPolicy,
    ) -> Result<Localized> {
        if let ObjectLocation::Local(path) = location {
            let file = File::open(path).map_err(|e| {
                PbpError::retrieval(path.display().to_string(), e, false)
            })?;
            return Ok(Localized {
                location: location.clone(),
                path: path.clone(),
                file,
                downloaded: false,
            });
        }

        let uri = location.uri();
        let path = self.cache_path(location);

        if self.assume_downloaded && path.is_file() {
            if let Ok(file) = File::open(&path) {
                log::debug!("Assuming already downloaded: {} -> {}", uri, path.display());
                return Ok(Localized {
                    location: location.clone(),
                    path,
                    file,
                    downloaded: true,
                });
            }
        }

        let outcome = with_retry(policy, &uri, || {
            self.download(stores, location, &path)?;
            // Opened inside the retried step: a sibling worker may release
            // the entry between our rename and this open.
            Ok(File::open(&path)?)
        });

        match outcome {
            RetryResult::Success(file) => Ok(Localized {
                location: location.clone(),
                path,
                file,
                downloaded: true,
            }),
            RetryResult::Failure(e) => Err(e),
            RetryResult::Exhausted {
                last_error,
                attempts,
            } => Err(PbpError::retrieval(
                uri,
                format!("giving up after {attempts} attempts: {last_error}"),
                false,
            )),
        }
    }

    fn download(
        &self,
        stores: &StoreRegistry,
        location: &ObjectLocation,
        path: &std::path::Path,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.download_dir)?;

        let part = path.with_file_name(format!(
            "{}.part-{}-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id(),
            PART_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        log::debug!("Downloading {} -> {}", location.uri(), path.display());
        let fetched = stores
            .fetch(location, &part)
            .and_then(|_| std::fs::rename(&part, path).map_err(PbpError::from));
        if fetched.is_err() {
            let _ = std::fs::remove_file(&part);
        }
        fetched
    }

    /// Done with an object: downloaded copies are deleted unless retained
    pub fn release(&self, localized: Localized) {
        let Localized {
            path,
            file,
            downloaded,
            ..
        } = localized;
        drop(file);

        if !downloaded || self.retain {
            return;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed downloaded file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Cannot remove {}: {}", path.display(), e),
        }
    }
}
