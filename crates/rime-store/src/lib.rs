//! The on-disk home of trimmed metadata documents.
//!
//! The store owns the cache directory outright: every component that reads or
//! mutates a cached entry goes through [`Store`], and nothing else touches the
//! files. Each package maps to exactly one file (`<encoded-name>.json`); a
//! `raw/` subdirectory holds upstream bodies that are still waiting to be
//! trimmed.

use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use rime_types::PackageName;

pub use locks::Locks;

mod locks;

/// The on-disk cache of trimmed metadata documents.
///
/// Reads are a single open+read; writes publish via a same-directory temp
/// file and rename, so concurrent readers observe either the prior bytes or
/// the new bytes, never a torn file. Writes to the same package are
/// serialized last-writer-wins through a per-key lock.
#[derive(Debug)]
pub struct Store {
    cache: PathBuf,
    raw: PathBuf,
    locks: Locks,
}

impl Store {
    /// Open the store rooted at `cache_dir`, creating the cache and raw
    /// staging directories if needed.
    pub fn init(cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache = cache_dir.into();
        let raw = cache.join("raw");
        fs_err::create_dir_all(&cache)?;
        fs_err::create_dir_all(&raw)?;
        Ok(Self {
            cache,
            raw,
            locks: Locks::default(),
        })
    }

    /// The directory holding the trimmed entries.
    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }

    fn entry(&self, name: &PackageName) -> PathBuf {
        self.cache.join(format!("{}.json", name.file_stem()))
    }

    fn raw_entry(&self, name: &PackageName) -> PathBuf {
        self.raw.join(format!("{}.json", name.file_stem()))
    }

    /// Read the cached document for `name`. A missing file is a normal miss;
    /// any other I/O failure propagates.
    pub async fn get(&self, name: &PackageName) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.entry(name)).await
    }

    /// Persist the trimmed document for `name`, replacing any prior entry.
    pub async fn put(&self, name: &PackageName, bytes: &[u8]) -> io::Result<()> {
        let lock = self.locks.acquire(name).await;
        let _guard = lock.lock().await;
        trace!("Writing cache entry for {name} ({} bytes)", bytes.len());
        write_atomic(&self.entry(name), bytes).await
    }

    /// Remove the cached document for `name`. Removing an absent entry is
    /// not an error.
    pub async fn delete(&self, name: &PackageName) -> io::Result<()> {
        let lock = self.locks.acquire(name).await;
        let _guard = lock.lock().await;
        trace!("Deleting cache entry for {name}");
        remove_optional(&self.entry(name)).await
    }

    /// The on-disk length of the cached document, without reading it.
    pub async fn size(&self, name: &PackageName) -> io::Result<Option<u64>> {
        match fs_err::tokio::metadata(self.entry(name)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether a trimmed document for `name` is present.
    pub async fn contains(&self, name: &PackageName) -> io::Result<bool> {
        Ok(self.size(name).await?.is_some())
    }

    /// Stage a raw upstream body for `name` ahead of trimming.
    pub async fn raw_put(&self, name: &PackageName, bytes: &[u8]) -> io::Result<()> {
        let lock = self.locks.acquire(name).await;
        let _guard = lock.lock().await;
        write_atomic(&self.raw_entry(name), bytes).await
    }

    /// Read a staged raw body, if one is in flight.
    pub async fn raw_get(&self, name: &PackageName) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.raw_entry(name)).await
    }

    /// Drop the staged raw body once trimming has landed.
    pub async fn raw_delete(&self, name: &PackageName) -> io::Result<()> {
        let lock = self.locks.acquire(name).await;
        let _guard = lock.lock().await;
        remove_optional(&self.raw_entry(name)).await
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs_err::tokio::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn remove_optional(path: &Path) -> io::Result<()> {
    match fs_err::tokio::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Write `data` to a sibling temp file, then rename it over `path`.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {}", path.display()),
        ));
    };
    let temp = path.with_file_name(format!(".{file_name}.{:016x}.tmp", fastrand::u64(..)));
    fs_err::tokio::write(&temp, data).await?;
    fs_err::tokio::rename(&temp, path).await
}
