//! Download of raw source imagery from the GLAD ARD archive.
//!
//! Source assets are addressed as `<base_url>/<lat band>/<tile>/<interval>.tif`
//! and protected by HTTP basic auth. Downloads are streamed into a `.part`
//! file next to the destination and renamed into place once complete, so a
//! destination path never holds a truncated file.

use crate::tile::TileId;
use crate::{RasterError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Default archive location.
pub const DEFAULT_SOURCE_URL: &str = "https://glad.umd.edu/dataset/landsat_v1.1";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Something that can deliver the raw image for a (tile, interval) pair.
pub trait SourceFetcher: Send + Sync {
    /// Download the raw asset into `dest`, returning the number of bytes written.
    fn fetch(&self, tile: &TileId, interval: u32, dest: &Path) -> Result<u64>;
}

/// Download statistics for the fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Number of assets downloaded this session.
    pub assets_downloaded: usize,
    /// Total bytes downloaded this session.
    pub bytes_downloaded: u64,
}

/// Credentials for the archive.
#[derive(Clone, Default)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Blocking HTTP fetcher for the GLAD ARD archive.
///
/// Safe to share between threads; statistics are kept in atomics.
pub struct HttpSourceFetcher {
    base_url: String,
    credentials: Option<Credentials>,
    client: reqwest::blocking::Client,
    assets_downloaded: AtomicUsize,
    bytes_downloaded: AtomicU64,
}

impl std::fmt::Debug for HttpSourceFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSourceFetcher")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl HttpSourceFetcher {
    /// Create a fetcher for the given archive base URL.
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            client,
            assets_downloaded: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        })
    }

    /// URL of the raw asset for a (tile, interval) pair.
    pub fn source_url(&self, tile: &TileId, interval: u32) -> String {
        format!("{}/{}/{}/{}.tif", self.base_url, tile.lat_band(), tile, interval)
    }

    /// Get download statistics for this session.
    pub fn download_stats(&self) -> DownloadStats {
        DownloadStats {
            assets_downloaded: self.assets_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    fn download(&self, url: &str, tile: &TileId, interval: u32, partial: &Path) -> Result<u64> {
        let mut request = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, credentials.password.as_ref());
        }
        let mut response = request.send()?;

        if !response.status().is_success() {
            return Err(RasterError::DownloadFailed {
                tile: tile.to_string(),
                interval,
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mut file = fs::File::create(partial)?;
        let bytes = response.copy_to(&mut file)?;
        file.sync_all()?;
        Ok(bytes)
    }
}

impl SourceFetcher for HttpSourceFetcher {
    fn fetch(&self, tile: &TileId, interval: u32, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = self.source_url(tile, interval);
        let partial = partial_path(dest);

        tracing::debug!(%tile, interval, %url, "downloading source asset");
        let bytes = match self.download(&url, tile, interval, &partial) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial) {
                    tracing::debug!(path = %partial.display(), error = %cleanup, "partial download not removed");
                }
                return Err(e);
            }
        };
        fs::rename(&partial, dest)?;

        self.assets_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        tracing::debug!(%tile, interval, bytes, "downloaded source asset");
        Ok(bytes)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
