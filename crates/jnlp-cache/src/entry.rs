use crate::cache::ResourceCache;
use crate::error::Result;
use crate::layout::info_file_for;
use crate::lock::CacheLock;
use crate::resource::ResourceInfo;
use crate::version::VersionId;
use jnlp_properties::Properties;
use std::path::{Path, PathBuf};
use url::Url;

pub const KEY_CONTENT_LENGTH: &str = "content-length";
pub const KEY_LAST_MODIFIED: &str = "last-modified";
pub const KEY_LAST_UPDATED: &str = "last-updated";
pub const KEY_JNLP_PATH: &str = "jnlp-path";
pub const KEY_DELETE: &str = "delete";

/// A cached artifact and its `<artifact>.info` metadata.
///
/// Missing or malformed numbers read as `0`: an entry without metadata is simply
/// "never downloaded".
///
/// Writes go through [`CacheEntry::lock`] / [`CacheEntry::store`]. While locked, the
/// entry holds the cross-process lock on the `.info` file and must not be locked a
/// second time from the same thread.
#[derive(Debug)]
pub struct CacheEntry {
    location: Url,
    version: Option<VersionId>,
    cache_file: PathBuf,
    info_file: PathBuf,
    properties: Properties,
    lock: Option<CacheLock>,
}

impl CacheEntry {
    /// Resolve (allocating if necessary) the cache file for `location`.
    pub fn new(cache: &ResourceCache, location: &Url, version: Option<&VersionId>) -> Result<Self> {
        let cache_file = cache.get_cache_file(location, version)?;
        Ok(Self::for_cache_file(location.clone(), version.cloned(), cache_file))
    }

    pub(crate) fn for_cache_file(
        location: Url,
        version: Option<VersionId>,
        cache_file: PathBuf,
    ) -> Self {
        let info_file = info_file_for(&cache_file);
        let properties = read_info_file(&info_file);
        Self {
            location,
            version,
            cache_file,
            info_file,
            properties,
            lock: None,
        }
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn version(&self) -> Option<&VersionId> {
        self.version.as_ref()
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    pub fn info_file(&self) -> &Path {
        &self.info_file
    }

    /// Recorded content length in bytes.
    pub fn size(&self) -> u64 {
        self.number(KEY_CONTENT_LENGTH)
    }

    pub fn set_size(&mut self, size: u64) {
        self.properties.set(KEY_CONTENT_LENGTH, size.to_string());
    }

    /// Remote last-modified time recorded at download, epoch millis.
    pub fn last_modified(&self) -> u64 {
        self.number(KEY_LAST_MODIFIED)
    }

    pub fn set_last_modified(&mut self, millis: u64) {
        self.properties.set(KEY_LAST_MODIFIED, millis.to_string());
    }

    /// When the artifact was downloaded, epoch millis.
    pub fn downloaded_at(&self) -> u64 {
        self.number(KEY_LAST_UPDATED)
    }

    pub fn set_downloaded_at(&mut self, millis: u64) {
        self.properties.set(KEY_LAST_UPDATED, millis.to_string());
    }

    pub fn jnlp_path(&self) -> Option<&str> {
        self.properties.get(KEY_JNLP_PATH).filter(|p| !p.is_empty())
    }

    pub fn is_marked_for_delete(&self) -> bool {
        is_delete_flag_set(&self.properties)
    }

    /// The artifact exists and its length equals the recorded content length.
    pub fn is_cached(&self) -> bool {
        match std::fs::metadata(&self.cache_file) {
            Ok(meta) => meta.is_file() && meta.len() == self.size(),
            Err(_) => false,
        }
    }

    /// Cached, and the remote copy (last modified `remote_last_modified`) is not
    /// newer than ours. An unknown remote time (`0`) is never current.
    pub fn is_current(&self, remote_last_modified: u64) -> bool {
        self.is_cached() && remote_last_modified > 0 && remote_last_modified <= self.last_modified()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Take the cross-process lock on the `.info` file and reload it, so values
    /// written by other processes are not overwritten blindly.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let lock = CacheLock::lock_exclusive(&self.info_file)?;
        let on_disk = lock.read_properties()?;
        // Local values win; keys only present on disk are kept.
        let mut merged = on_disk;
        for (key, value) in self.properties.iter() {
            merged.set(key, value);
        }
        self.properties = merged;
        self.lock = Some(lock);
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }

    /// Write the metadata if this entry holds the lock; returns `false` (and
    /// writes nothing) otherwise.
    pub fn store(&self) -> Result<bool> {
        let Some(lock) = &self.lock else {
            tracing::debug!(
                target = "jnlp.cache",
                path = %self.info_file.display(),
                "skipping metadata store without holding its lock"
            );
            return Ok(false);
        };
        lock.write_properties(&self.properties, None)?;
        Ok(true)
    }

    /// Re-read the metadata from disk, dropping unsaved changes.
    pub fn reload(&mut self) -> Result<()> {
        self.properties = match &self.lock {
            Some(lock) => lock.read_properties()?,
            None => read_info_file(&self.info_file),
        };
        Ok(())
    }

    /// Record the transfer metadata of a completed download.
    pub fn store_info(&mut self, info: &ResourceInfo) -> Result<()> {
        self.with_lock(|entry| {
            entry.set_size(info.size());
            entry.set_last_modified(info.last_modified());
            entry.set_downloaded_at(info.downloaded_at());
            entry.store()
        })
    }

    /// Flag the artifact for removal by the next clean pass.
    pub fn mark_for_delete(&mut self) -> Result<()> {
        self.with_lock(|entry| {
            entry.properties.set(KEY_DELETE, "true");
            entry.store()
        })
    }

    fn with_lock(&mut self, write: impl FnOnce(&mut Self) -> Result<bool>) -> Result<()> {
        let was_locked = self.is_locked();
        self.lock()?;
        let result = write(self);
        if !was_locked {
            self.unlock();
        }
        result.map(|_| ())
    }

    fn number(&self, key: &str) -> u64 {
        parse_number(self.properties.get(key))
    }
}

pub(crate) fn parse_number(value: Option<&str>) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

pub(crate) fn is_delete_flag_set(properties: &Properties) -> bool {
    properties
        .get(KEY_DELETE)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Best-effort unlocked read; a missing or unreadable file reads as empty.
pub(crate) fn read_info_file(info_file: &Path) -> Properties {
    match std::fs::File::open(info_file) {
        Ok(file) => Properties::read_from(file).unwrap_or_else(|err| {
            tracing::debug!(
                target = "jnlp.cache",
                path = %info_file.display(),
                error = %err,
                "failed to read cache metadata"
            );
            Properties::new()
        }),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "jnlp.cache",
                    path = %info_file.display(),
                    error = %err,
                    "failed to open cache metadata"
                );
            }
            Properties::new()
        }
    }
}
