//! Artifact store keyed by (tile, interval, product level).
//!
//! Writes go to a staging file under the store root and are renamed into
//! place, so an artifact is either absent or complete under its final key.
//!
//! Key layout: `<root>/<tile>/<interval>/<level>.tif`.

use crate::error::StoreError;
use crate::registry::IntervalId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use treewatch_raster::TileId;

const STAGING_DIR: &str = ".staging";

/// Product level of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductLevel {
    /// Validated source imagery: 8 bands of u16, nodata 0.
    Raw,
    /// True-colour RGBA composite, u8.
    Composite,
    /// Tree-loss signal: one band of u8, 0/1 with nodata 255.
    Change,
}

impl ProductLevel {
    /// All levels.
    pub const ALL: [ProductLevel; 3] = [ProductLevel::Raw, ProductLevel::Composite, ProductLevel::Change];

    /// Lowercase name used in keys and URLs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProductLevel::Raw => "raw",
            ProductLevel::Composite => "composite",
            ProductLevel::Change => "change",
        }
    }
}

impl fmt::Display for ProductLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ProductLevel::Raw),
            "composite" | "rgba" => Ok(ProductLevel::Composite),
            "change" | "treecover" => Ok(ProductLevel::Change),
            other => Err(format!("unknown product level '{}'", other)),
        }
    }
}

/// Address of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    /// Tile.
    pub tile: TileId,
    /// Interval.
    pub interval: IntervalId,
    /// Product level.
    pub level: ProductLevel,
}

impl ArtifactKey {
    /// Create a key.
    pub fn new(tile: TileId, interval: IntervalId, level: ProductLevel) -> Self {
        Self { tile, interval, level }
    }

    /// Path of the artifact relative to the store root, with a leading `/`.
    pub fn url_path(&self) -> String {
        format!("/{}/{}/{}.tif", self.tile, self.interval, self.level)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tile, self.interval, self.level)
    }
}

/// Storage for published artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Whether the artifact exists.
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError>;

    /// Store bytes under a key, replacing any previous artifact.
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Store a local file under a key, replacing any previous artifact.
    /// Returns the artifact size.
    fn put_file(&self, key: &ArtifactKey, path: &Path) -> Result<u64, StoreError>;

    /// Copy an artifact to a local path.
    fn fetch_to(&self, key: &ArtifactKey, dest: &Path) -> Result<u64, StoreError>;

    /// URL for an artifact. Time-limited when the store signs its URLs.
    fn get_url(&self, key: &ArtifactKey, ttl: Duration) -> Result<String, StoreError>;

    /// Delete every level of one (tile, interval). Returns the number removed.
    fn delete_all(&self, tile: &TileId, interval: IntervalId) -> Result<usize, StoreError>;

    /// Tiles with at least one artifact, sorted.
    fn list_tiles(&self) -> Result<Vec<TileId>, StoreError>;

    /// Intervals of a tile with at least one artifact, ascending.
    fn list_intervals(&self, tile: &TileId) -> Result<Vec<IntervalId>, StoreError>;

    /// Levels present for one (tile, interval).
    fn list_levels(&self, tile: &TileId, interval: IntervalId) -> Result<Vec<ProductLevel>, StoreError>;
}

/// Signature for an artifact path: hex SHA-256 of `secret:path:expires`.
pub fn sign_path(secret: &str, path: &str, expires: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(expires.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a signature produced by [`sign_path`] that has not yet expired.
pub fn verify_url_signature(secret: &str, path: &str, expires: u64, signature: &str, now: u64) -> bool {
    if expires <= now || path.contains("..") {
        return false;
    }
    let expected = sign_path(secret, path, expires);
    // Compare without early exit
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn unix_ts_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Artifact store on the local filesystem.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Option<String>,
    staging_counter: AtomicU64,
}

impl FsArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>, signing_key: Option<String>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            root,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signing_key,
            staging_counter: AtomicU64::new(0),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an artifact.
    pub fn path_of(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.tile.as_str())
            .join(key.interval.to_string())
            .join(format!("{}.tif", key.level))
    }

    /// Unsigned public URL of an artifact.
    pub fn public_url(&self, key: &ArtifactKey) -> String {
        format!("{}{}", self.public_base_url, key.url_path())
    }

    /// Signed URL expiring at the given unix time.
    pub fn url_expiring_at(&self, key: &ArtifactKey, expires: u64) -> Result<String, StoreError> {
        let secret = self.signing_key.as_deref().ok_or(StoreError::MissingSigningKey)?;
        let path = key.url_path();
        let signature = sign_path(secret, &path, expires);
        Ok(format!(
            "{}{}?expires={}&signature={}",
            self.public_base_url, path, expires, signature
        ))
    }

    fn staging_path(&self, key: &ArtifactKey) -> PathBuf {
        let n = self.staging_counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(STAGING_DIR).join(format!(
            "{}_{}_{}.{}.{}.tmp",
            key.tile,
            key.interval,
            key.level,
            std::process::id(),
            n
        ))
    }

    fn publish(&self, staged: &Path, key: &ArtifactKey) -> Result<(), StoreError> {
        let dest = self.path_of(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(e) = fs::rename(staged, &dest) {
            let _ = fs::remove_file(staged);
            return Err(e.into());
        }
        tracing::debug!(key = %key, "published artifact");
        Ok(())
    }

    fn sorted_dir_names<T, F>(dir: &Path, parse: F) -> Result<Vec<T>, StoreError>
    where
        T: Ord,
        F: Fn(&str) -> Option<T>,
    {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(value) = entry.file_name().to_str().and_then(&parse) {
                names.push(value);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        Ok(self.path_of(key).is_file())
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError> {
        let staged = self.staging_path(key);
        let written = fs::File::create(&staged).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        self.publish(&staged, key)
    }

    fn put_file(&self, key: &ArtifactKey, path: &Path) -> Result<u64, StoreError> {
        let staged = self.staging_path(key);
        let bytes = match fs::copy(path, &staged) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&staged);
                return Err(e.into());
            }
        };
        self.publish(&staged, key)?;
        Ok(bytes)
    }

    fn fetch_to(&self, key: &ArtifactKey, dest: &Path) -> Result<u64, StoreError> {
        let src = self.path_of(key);
        if !src.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::copy(src, dest)?)
    }

    fn get_url(&self, key: &ArtifactKey, ttl: Duration) -> Result<String, StoreError> {
        match self.signing_key {
            Some(_) => self.url_expiring_at(key, unix_ts_seconds() + ttl.as_secs()),
            None => Ok(self.public_url(key)),
        }
    }

    fn delete_all(&self, tile: &TileId, interval: IntervalId) -> Result<usize, StoreError> {
        let mut removed = 0;
        for level in ProductLevel::ALL {
            match fs::remove_file(self.path_of(&ArtifactKey::new(tile.clone(), interval, level))) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Drop now-empty directories so listings stay accurate
        let interval_dir = self.root.join(tile.as_str()).join(interval.to_string());
        let _ = fs::remove_dir(&interval_dir);
        let _ = fs::remove_dir(self.root.join(tile.as_str()));

        tracing::debug!(%tile, interval, removed, "deleted artifacts");
        Ok(removed)
    }

    fn list_tiles(&self) -> Result<Vec<TileId>, StoreError> {
        Self::sorted_dir_names(&self.root, |name| TileId::parse(name).ok())
    }

    fn list_intervals(&self, tile: &TileId) -> Result<Vec<IntervalId>, StoreError> {
        let intervals = Self::sorted_dir_names(&self.root.join(tile.as_str()), |name| name.parse().ok())?;
        Ok(intervals
            .into_iter()
            .filter(|&interval| self.list_levels(tile, interval).is_ok_and(|levels| !levels.is_empty()))
            .collect())
    }

    fn list_levels(&self, tile: &TileId, interval: IntervalId) -> Result<Vec<ProductLevel>, StoreError> {
        let mut levels = Vec::new();
        for level in ProductLevel::ALL {
            if self.exists(&ArtifactKey::new(tile.clone(), interval, level))? {
                levels.push(level);
            }
        }
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile() -> TileId {
        TileId::parse("105W_40N").unwrap()
    }

    fn store(dir: &Path) -> FsArtifactStore {
        FsArtifactStore::new(dir, "https://tiles.example.org/", Some("secret".to_string())).unwrap()
    }

    #[test]
    fn test_put_exists_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ArtifactKey::new(tile(), 1012, ProductLevel::Raw);

        assert!(!store.exists(&key).unwrap());
        store.put(&key, b"first").unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.path_of(&key), dir.path().join("105W_40N/1012/raw.tif"));

        // Overwrite is idempotent
        store.put(&key, b"second").unwrap();
        let dest = dir.path().join("out/raw.tif");
        assert_eq!(store.fetch_to(&key, &dest).unwrap(), 6);
        assert_eq!(fs::read(&dest).unwrap(), b"second");

        // No staging leftovers
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_fetch_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ArtifactKey::new(tile(), 1, ProductLevel::Change);
        assert!(matches!(
            store.fetch_to(&key, &dir.path().join("x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_listing_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let other = TileId::parse("012E_05S").unwrap();

        store.put(&ArtifactKey::new(tile(), 1012, ProductLevel::Raw), b"r").unwrap();
        store.put(&ArtifactKey::new(tile(), 1012, ProductLevel::Change), b"c").unwrap();
        store.put(&ArtifactKey::new(tile(), 998, ProductLevel::Raw), b"r").unwrap();
        store.put(&ArtifactKey::new(other.clone(), 5, ProductLevel::Raw), b"r").unwrap();

        assert_eq!(store.list_tiles().unwrap(), vec![other.clone(), tile()]);
        assert_eq!(store.list_intervals(&tile()).unwrap(), vec![998, 1012]);
        assert_eq!(
            store.list_levels(&tile(), 1012).unwrap(),
            vec![ProductLevel::Raw, ProductLevel::Change]
        );

        assert_eq!(store.delete_all(&tile(), 1012).unwrap(), 2);
        assert_eq!(store.list_intervals(&tile()).unwrap(), vec![998]);
        assert_eq!(store.delete_all(&tile(), 1012).unwrap(), 0);

        store.delete_all(&other, 5).unwrap();
        assert_eq!(store.list_tiles().unwrap(), vec![tile()]);
    }

    #[test]
    fn test_signed_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ArtifactKey::new(tile(), 1012, ProductLevel::Composite);

        let url = store.url_expiring_at(&key, 2_000_000_000).unwrap();
        let signature = sign_path("secret", "/105W_40N/1012/composite.tif", 2_000_000_000);
        assert_eq!(
            url,
            format!(
                "https://tiles.example.org/105W_40N/1012/composite.tif?expires=2000000000&signature={}",
                signature
            )
        );
        assert_eq!(signature.len(), 64);

        let path = key.url_path();
        assert!(verify_url_signature("secret", &path, 2_000_000_000, &signature, 1_900_000_000));
        assert!(!verify_url_signature("secret", &path, 2_000_000_000, &signature, 2_000_000_000));
        assert!(!verify_url_signature("other", &path, 2_000_000_000, &signature, 1_900_000_000));
        assert!(!verify_url_signature("secret", "/105W_40N/1012/raw.tif", 2_000_000_000, &signature, 0));
    }

    #[test]
    fn test_unsigned_store_issues_plain_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "http://x/", None).unwrap();
        let key = ArtifactKey::new(tile(), 1, ProductLevel::Raw);
        assert_eq!(store.get_url(&key, Duration::from_secs(60)).unwrap(), "http://x/105W_40N/1/raw.tif");
        assert!(matches!(
            store.url_expiring_at(&key, 2_000_000_000),
            Err(StoreError::MissingSigningKey)
        ));
    }

    #[test]
    fn test_level_names() {
        for level in ProductLevel::ALL {
            assert_eq!(level.as_str().parse::<ProductLevel>().unwrap(), level);
        }
        assert_eq!("rgba".parse::<ProductLevel>().unwrap(), ProductLevel::Composite);
        assert!("ndvi".parse::<ProductLevel>().is_err());
    }
}
