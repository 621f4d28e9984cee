use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs::File, io::AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DownloadCacheError {
    #[error("Invalid cache key: '{0}'")]
    InvalidCacheKey(String),
    #[error("Download failed: {0}")]
    Network(String),
    #[error("Cache io error: {0}")]
    Io(String),
    #[error("Can't decompress artifact: {0}")]
    Decompression(String),
}

/// A remote artifact and the name it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub url: String,
    pub cache_key: String,
    pub decompress: bool,
}

impl ArtifactRequest {
    /// Keys the artifact by the last segment of its url. Gzip archives are
    /// unpacked and cached without their `.gz` suffix.
    pub fn from_url(url: &str) -> Self {
        let file_name = url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let (cache_key, decompress) = match file_name.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };
        Self {
            url: url.to_string(),
            cache_key: cache_key.to_string(),
            decompress,
        }
    }
}

/// Receives `(total, downloaded, percent)` ticks. Parallel downloads may call
/// one observer from several tasks.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, total: u64, downloaded: u64, percent: u8);
}

impl<F> ProgressObserver for F
where
    F: Fn(u64, u64, u8) + Send + Sync,
{
    fn on_progress(&self, total: u64, downloaded: u64, percent: u8) {
        self(total, downloaded, percent)
    }
}

#[async_trait]
pub trait ArtifactStream: Send {
    fn total_size(&self) -> Option<u64>;
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadCacheError>;
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn ArtifactStream>, DownloadCacheError>;
}

/// Name keyed artifact cache. Nothing is ever visible under a key before it
/// is complete.
pub struct DownloadCache {
    directory: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl DownloadCache {
    pub fn new(directory: PathBuf, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { directory, fetcher }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn get_or_fetch(
        &self,
        request: &ArtifactRequest,
        progress: &dyn ProgressObserver,
    ) -> Result<PathBuf, DownloadCacheError> {
        Self::validate_key(&request.cache_key)?;
        let target = self.directory.join(&request.cache_key);
        if tokio::fs::try_exists(&target).await.map_err(io_error)? {
            debug!("Cache hit for {}", request.cache_key);
            let size = tokio::fs::metadata(&target).await.map_err(io_error)?.len();
            progress.on_progress(size, size, 100);
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_error)?;
        let staging_id = Uuid::new_v4();
        let download_path = self
            .directory
            .join(format!(".{}.{}.download", request.cache_key, staging_id));
        let decompressed_path = self
            .directory
            .join(format!(".{}.{}.partial", request.cache_key, staging_id));

        let result = self
            .materialize(request, &download_path, &decompressed_path, &target, progress)
            .await;
        for staged in [&download_path, &decompressed_path] {
            if let Err(err) = tokio::fs::remove_file(staged).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Can't remove staging file {:?}: {}", staged, err);
                }
            }
        }
        result
    }

    /// Fetches every request concurrently and returns the paths in request order.
    pub async fn get_or_fetch_all<'a>(
        &self,
        requests: &[ArtifactRequest],
        observer_for: impl Fn(&ArtifactRequest) -> Box<dyn ProgressObserver + 'a>,
    ) -> Result<Vec<PathBuf>, DownloadCacheError> {
        let observers: Vec<_> = requests.iter().map(&observer_for).collect();
        let downloads = requests
            .iter()
            .zip(observers.iter())
            .map(|(request, observer)| self.get_or_fetch(request, observer.as_ref()));
        join_all(downloads).await.into_iter().collect()
    }

    async fn materialize(
        &self,
        request: &ArtifactRequest,
        download_path: &Path,
        decompressed_path: &Path,
        target: &Path,
        progress: &dyn ProgressObserver,
    ) -> Result<PathBuf, DownloadCacheError> {
        let downloaded = self.download(&request.url, download_path, progress).await?;
        let staged = if request.decompress {
            Self::decompress(download_path, decompressed_path).await?;
            decompressed_path
        } else {
            download_path
        };
        Self::publish(staged, target).await?;
        info!(
            "Cached {} ({} bytes downloaded) as {:?}",
            request.url, downloaded, target
        );
        Ok(target.to_path_buf())
    }

    async fn download(
        &self,
        url: &str,
        path: &Path,
        progress: &dyn ProgressObserver,
    ) -> Result<u64, DownloadCacheError> {
        debug!("Downloading {} to {:?}", url, path);
        let mut stream = self.fetcher.open(url).await?;
        let total = stream.total_size().unwrap_or_default();
        let mut file = File::create(path).await.map_err(io_error)?;
        let mut downloaded = 0u64;
        let mut last_percent = None;
        while let Some(chunk) = stream.next_chunk().await? {
            file.write_all(&chunk).await.map_err(io_error)?;
            downloaded += chunk.len() as u64;
            let percent = if total > 0 {
                (downloaded * 100 / total).min(100) as u8
            } else {
                0
            };
            // Ticks only on percent changes.
            if last_percent != Some(percent) {
                progress.on_progress(total, downloaded, percent);
                last_percent = Some(percent);
            }
        }
        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        if last_percent != Some(100) {
            progress.on_progress(total.max(downloaded), downloaded, 100);
        }
        Ok(downloaded)
    }

    async fn decompress(source: &Path, destination: &Path) -> Result<(), DownloadCacheError> {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || {
            use flate2::read::MultiGzDecoder;

            let compressed = std::fs::File::open(&source).map_err(io_error)?;
            let mut decoder = MultiGzDecoder::new(io::BufReader::new(compressed));
            let mut output = std::fs::File::create(&destination).map_err(io_error)?;
            io::copy(&mut decoder, &mut output)
                .map_err(|err| DownloadCacheError::Decompression(err.to_string()))?;
            output.sync_all().map_err(io_error)
        })
        .await
        .map_err(|err| DownloadCacheError::Decompression(format!("task panicked: {}", err)))?
    }

    /// Links the staged file under its final name. An existing file wins.
    async fn publish(staged: &Path, target: &Path) -> Result<(), DownloadCacheError> {
        match tokio::fs::hard_link(staged, target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{:?} was cached concurrently, keeping it", target);
                Ok(())
            }
            // File systems without hard links.
            Err(_) => tokio::fs::rename(staged, target).await.map_err(io_error),
        }
    }

    fn validate_key(cache_key: &str) -> Result<(), DownloadCacheError> {
        let valid = !cache_key.is_empty()
            && !cache_key.starts_with('.')
            && !cache_key.contains(['/', '\\'])
            && Path::new(cache_key).file_name() == Some(cache_key.as_ref());
        if valid {
            Ok(())
        } else {
            Err(DownloadCacheError::InvalidCacheKey(cache_key.to_string()))
        }
    }
}

fn io_error(err: io::Error) -> DownloadCacheError {
    DownloadCacheError::Io(err.to_string())
}
