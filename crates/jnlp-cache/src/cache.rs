use crate::config::CacheConfig;
use crate::entry::{is_delete_flag_set, read_info_file, CacheEntry, KEY_DELETE, KEY_JNLP_PATH};
use crate::error::{CacheError, Result};
use crate::holder::LruCacheIndexHolder;
use crate::ids::{collect_cache_ids, info_matches_id, walk_info_files, CacheId};
use crate::index::LruCacheIndex;
use crate::layout::{ensure_cacheable, info_file_for, is_cacheable, CacheLayout};
use crate::lock::CacheLock;
use crate::resource::ResourceInfo;
use crate::util::{atomic_write_from, remove_dir_all_nofollow, validate_under_root};
use crate::version::{VersionId, VersionString};
use jnlp_properties::Properties;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use url::Url;

/// Why a clean pass dropped an index entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    MarkedForDeletion,
    /// The artifact is no longer on disk.
    Missing,
    OverBudget,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvictedEntry {
    pub id: String,
    pub resource_href: String,
    pub reason: EvictionReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheCleanFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result summary from a clean pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheCleanReport {
    /// Bytes of artifacts kept, measured on disk.
    pub retained_bytes: u64,
    /// Number of index entries kept.
    pub kept: usize,
    pub evicted: Vec<EvictedEntry>,
    /// Numbered directories removed, including ones no index entry referred to.
    pub deleted_dirs: Vec<PathBuf>,
    pub failed: Vec<CacheCleanFailure>,
}

/// Permission to run a destructive operation.
///
/// Holds the exclusive lock on the main lock file (when it exists) until dropped,
/// so no launcher can start using the cache in the meantime.
#[derive(Debug)]
pub struct ClearCacheGuard {
    _lock: Option<CacheLock>,
}

/// The cache used by every launcher process sharing one cache root.
///
/// All index access goes through [`LruCacheIndexHolder`], so each call observes the
/// changes other processes made before it.
#[derive(Debug, Clone)]
pub struct ResourceCache {
    config: CacheConfig,
    layout: CacheLayout,
    index: LruCacheIndexHolder,
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_root)?;
        if let Some(parent) = config.index_file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            layout: CacheLayout::new(&config.cache_root),
            index: LruCacheIndexHolder::new(&config.index_file),
            config,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(CacheConfig::from_env()?)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// The holder guarding this cache's index.
    ///
    /// Calling any `ResourceCache` operation from inside one of the holder's actions
    /// deadlocks, because the index lock is not reentrant.
    pub fn index(&self) -> &LruCacheIndexHolder {
        &self.index
    }

    /// The cache file for `location`, allocating a fresh numbered directory when the
    /// resource is not known yet. A known entry is marked as accessed.
    pub fn get_cache_file(&self, location: &Url, version: Option<&VersionId>) -> Result<PathBuf> {
        ensure_cacheable(location)?;
        self.index
            .get_synchronized(|index| self.resolve_slot(index, location, version))
    }

    /// Store a downloaded resource and its transfer metadata.
    ///
    /// A resource that is already fully cached gets a new slot; the old one is
    /// marked for deletion and reclaimed by the next clean pass.
    pub fn add_to_cache(&self, info: &ResourceInfo, content: &mut impl io::Read) -> Result<PathBuf> {
        let location = info.location();
        let version = info.version();
        ensure_cacheable(location)?;

        let cache_file = self.index.get_synchronized(|index| {
            let fully_cached = index
                .find(location, version)
                .map(|entry| self.layout.cache_file(entry.id(), location))
                .is_some_and(|path| {
                    CacheEntry::for_cache_file(location.clone(), version.cloned(), path).is_cached()
                });
            if fully_cached {
                self.replace_in_index(index, location, version)
            } else {
                self.resolve_slot(index, location, version)
            }
        })?;

        let written = atomic_write_from(&cache_file, content)?;
        if written != info.size() {
            tracing::warn!(
                target = "jnlp.cache",
                url = %location,
                expected = info.size(),
                written,
                "downloaded size differs from the announced size"
            );
        }

        let mut entry = CacheEntry::for_cache_file(location.clone(), version.cloned(), cache_file);
        entry.store_info(info)?;
        tracing::debug!(
            target = "jnlp.cache",
            url = %location,
            path = %entry.cache_file().display(),
            "added resource to cache"
        );
        Ok(entry.cache_file().to_path_buf())
    }

    /// Whether the resource is present and complete. Never allocates a slot.
    pub fn is_cached(&self, location: &Url, version: Option<&VersionId>) -> Result<bool> {
        Ok(self
            .lookup_entry(location, version)?
            .is_some_and(|entry| entry.is_cached()))
    }

    /// Whether the cached copy is at least as new as the remote one. Never
    /// allocates a slot.
    pub fn is_up_to_date(
        &self,
        location: &Url,
        version: Option<&VersionId>,
        remote_last_modified: u64,
    ) -> Result<bool> {
        Ok(self
            .lookup_entry(location, version)?
            .is_some_and(|entry| entry.is_current(remote_last_modified)))
    }

    /// Fully cached versions of `location` within `versions`, highest first.
    pub fn get_all_matching_versions_in_cache(
        &self,
        location: &Url,
        versions: &VersionString,
    ) -> Result<Vec<VersionId>> {
        if !is_cacheable(location) {
            return Ok(Vec::new());
        }
        let candidates: Vec<(VersionId, PathBuf)> = self.index.get_synchronized(|index| {
            Ok(index
                .find_all(location, Some(versions))
                .into_iter()
                .filter_map(|entry| {
                    let version = entry.version()?.clone();
                    Some((version, self.layout.cache_file(entry.id(), location)))
                })
                .collect())
        })?;

        let mut cached: Vec<VersionId> = candidates
            .into_iter()
            .filter(|(version, path)| {
                CacheEntry::for_cache_file(location.clone(), Some(version.clone()), path.clone())
                    .is_cached()
            })
            .map(|(version, _)| version)
            .collect();
        cached.sort_by(|a, b| b.cmp(a));
        cached.dedup();
        Ok(cached)
    }

    pub fn get_best_matching_version_in_cache(
        &self,
        location: &Url,
        versions: &VersionString,
    ) -> Result<Option<VersionId>> {
        Ok(self
            .get_all_matching_versions_in_cache(location, versions)?
            .into_iter()
            .next())
    }

    /// Without a version string this is [`Self::is_cached`] for the unversioned
    /// resource.
    pub fn is_any_cached(&self, location: &Url, versions: Option<&VersionString>) -> Result<bool> {
        match versions {
            None => self.is_cached(location, None),
            Some(versions) => Ok(!self
                .get_all_matching_versions_in_cache(location, versions)?
                .is_empty()),
        }
    }

    /// The cache file of the best recorded match, marking it as accessed.
    ///
    /// `None` when nothing matches or the best match is not fully downloaded.
    pub fn get_best_cache_file(
        &self,
        location: &Url,
        versions: Option<&VersionString>,
    ) -> Result<Option<PathBuf>> {
        if !is_cacheable(location) {
            return Ok(None);
        }
        let best = self.index.get_synchronized(|index| {
            Ok(index
                .find_best_and_mark_as_accessed(location, versions)
                .map(|entry| {
                    let path = self.layout.cache_file(entry.id(), location);
                    (entry.version().cloned(), path)
                }))
        })?;
        Ok(best.and_then(|(version, path)| {
            let entry = CacheEntry::for_cache_file(location.clone(), version, path);
            entry.is_cached().then(|| entry.cache_file().to_path_buf())
        }))
    }

    /// Allocate a new slot for a resource, marking the current one (if any) for
    /// deletion. The old files stay readable until the next clean pass.
    pub fn replace_existing_cache_file(
        &self,
        location: &Url,
        version: Option<&VersionId>,
    ) -> Result<PathBuf> {
        ensure_cacheable(location)?;
        self.index
            .get_synchronized(|index| self.replace_in_index(index, location, version))
    }

    /// Remove every cached version of `location` matching `versions` (all of them
    /// when `None`) from the index and from disk. Returns the number of entries
    /// removed.
    ///
    /// Returns `None` without touching anything while the cache is in use.
    pub fn delete_from_cache(
        &self,
        location: &Url,
        versions: Option<&VersionString>,
    ) -> Result<Option<usize>> {
        ensure_cacheable(location)?;
        let Some(_guard) = self.ok_to_clear_cache() else {
            tracing::info!(
                target = "jnlp.cache",
                url = %location,
                "cache is in use; not deleting resource"
            );
            return Ok(None);
        };

        let removed = self.index.get_synchronized_then(
            |index| {
                let doomed: Vec<String> = index
                    .find_all(location, versions)
                    .into_iter()
                    .map(|entry| entry.id().to_owned())
                    .collect();
                for id in &doomed {
                    index.remove_entry(id);
                }
                Ok(doomed)
            },
            |doomed| {
                for id in &doomed {
                    let dir = self.layout.root().join(id);
                    if let Err(err) = self.remove_numbered_dir(&dir) {
                        tracing::warn!(
                            target = "jnlp.cache",
                            path = %dir.display(),
                            error = %err,
                            "failed to delete cached resource"
                        );
                    }
                }
                tracing::debug!(
                    target = "jnlp.cache",
                    url = %location,
                    removed = doomed.len(),
                    "deleted resource from cache"
                );
                Ok(doomed.len())
            },
        )?;
        Ok(Some(removed))
    }

    /// Mark every artifact belonging to `id` (a descriptor path or a domain) for
    /// deletion, then run a clean pass.
    ///
    /// Returns `false` without touching anything while the cache is in use.
    pub fn delete_from_cache_by_id(&self, id: &str) -> Result<bool> {
        let Some(_guard) = self.ok_to_clear_cache() else {
            return Ok(false);
        };

        let marked = self.index.get_synchronized(|_| {
            let mut marked = 0usize;
            for info_file in walk_info_files(self.layout.root()) {
                let lock = CacheLock::lock_exclusive(&info_file)?;
                let mut properties = lock.read_properties()?;
                if info_matches_id(&self.layout, &info_file, &properties, id) {
                    properties.set(KEY_DELETE, "true");
                    lock.write_properties(&properties, None)?;
                    marked += 1;
                }
            }
            Ok(marked)
        })?;
        tracing::info!(target = "jnlp.cache", id, marked, "marked cache id for deletion");

        self.clean_cache_unguarded()?;
        Ok(true)
    }

    /// Delete the numbered directory owning `path`, dropping its index entry.
    ///
    /// Returns whether anything was removed.
    pub fn delete_cache_file(&self, path: &Path) -> Result<bool> {
        validate_under_root(self.layout.root(), path)?;
        let Some(dir) = self.layout.numbered_dir(path) else {
            return Ok(false);
        };
        if dir == self.config.index_file || dir == self.config.main_lock_file {
            return Err(CacheError::PathNotUnderCacheRoot {
                path: path.to_path_buf(),
                cache_root: self.layout.root().to_path_buf(),
            });
        }
        let Some(id) = dir.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            return Ok(false);
        };

        self.index.get_synchronized_then(
            |index| Ok(index.remove_entry(&id)),
            |removed_entry| {
                let existed = dir.exists();
                self.remove_numbered_dir(&dir)?;
                Ok(removed_entry || existed)
            },
        )
    }

    /// Delete everything under the cache root and empty the index.
    ///
    /// Returns `false` while the cache is in use, or when some files could not be
    /// removed.
    pub fn clear_cache(&self) -> Result<bool> {
        let Some(_guard) = self.ok_to_clear_cache() else {
            tracing::info!(target = "jnlp.cache", "cache is in use; not clearing it");
            return Ok(false);
        };

        self.index.get_synchronized(|index| {
            let mut failed = 0usize;
            for child in fs::read_dir(self.layout.root())? {
                let path = child?.path();
                // The index file stays: its lock is held right now.
                if path == self.config.index_file || path == self.config.main_lock_file {
                    continue;
                }
                if let Err(err) = remove_dir_all_nofollow(&path) {
                    tracing::warn!(
                        target = "jnlp.cache",
                        path = %path.display(),
                        error = %err,
                        "failed to delete cache contents"
                    );
                    failed += 1;
                }
            }
            index.clear();
            tracing::info!(target = "jnlp.cache", failed, "cleared cache");
            Ok(failed == 0)
        })
    }

    /// Bring the cache within its size budget.
    ///
    /// Entries are visited most recently used first; an entry is kept when it is
    /// not marked for deletion, its artifact exists and it still fits the budget.
    /// Everything else, plus numbered directories unknown to the index, is removed.
    ///
    /// Returns `None` without touching anything while the cache is in use.
    pub fn clean_cache(&self) -> Result<Option<CacheCleanReport>> {
        let Some(_guard) = self.ok_to_clear_cache() else {
            tracing::info!(target = "jnlp.cache", "cache is in use; skipping clean");
            return Ok(None);
        };
        self.clean_cache_unguarded().map(Some)
    }

    /// A guard when no launcher is using the cache, `None` otherwise.
    ///
    /// Never blocks. A missing main lock file means no launcher ever ran, and the
    /// guard then holds nothing.
    pub fn ok_to_clear_cache(&self) -> Option<ClearCacheGuard> {
        let path = &self.config.main_lock_file;
        match CacheLock::try_lock_existing(path) {
            Ok(Some(lock)) => Some(ClearCacheGuard { _lock: Some(lock) }),
            Ok(None) => {
                tracing::debug!(
                    target = "jnlp.cache",
                    path = %path.display(),
                    "main lock file is held by a running instance"
                );
                None
            }
            Err(CacheError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                Some(ClearCacheGuard { _lock: None })
            }
            Err(err) => {
                tracing::warn!(
                    target = "jnlp.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to check the main lock file; assuming the cache is in use"
                );
                None
            }
        }
    }

    /// Group cached files by descriptor path and/or domain. `filter` is a regular
    /// expression that must match a whole id.
    pub fn get_cache_ids(
        &self,
        filter: &str,
        include_jnlp_path: bool,
        include_domain: bool,
    ) -> Result<Vec<CacheId>> {
        collect_cache_ids(&self.layout, filter, include_jnlp_path, include_domain)
    }

    fn clean_cache_unguarded(&self) -> Result<CacheCleanReport> {
        let max_bytes = self.config.max_size.max_bytes();
        self.index.get_synchronized_then(
            |index| {
                let mut report = CacheCleanReport::default();
                let mut kept: HashSet<PathBuf> = HashSet::new();
                let mut doomed: BTreeSet<PathBuf> = BTreeSet::new();

                for entry in index.entries().to_vec() {
                    let id = entry.id().to_owned();
                    let cache_file = self.layout.cache_file(&id, entry.resource_href());
                    let dir = self.layout.root().join(&id);

                    let reason = if entry.is_marked_for_deletion()
                        || is_delete_flag_set(&read_info_file(&info_file_for(&cache_file)))
                    {
                        Some(EvictionReason::MarkedForDeletion)
                    } else {
                        match fs::symlink_metadata(&cache_file) {
                            Ok(meta) if meta.is_file() => {
                                let total = report.retained_bytes.saturating_add(meta.len());
                                if max_bytes.is_some_and(|max| total > max) {
                                    Some(EvictionReason::OverBudget)
                                } else {
                                    report.retained_bytes = total;
                                    None
                                }
                            }
                            _ => Some(EvictionReason::Missing),
                        }
                    };

                    match reason {
                        None => {
                            kept.insert(dir);
                            report.kept += 1;
                            remove_stray_siblings(&cache_file);
                        }
                        Some(reason) => {
                            doomed.insert(dir);
                            index.remove_entry(&id);
                            report.evicted.push(EvictedEntry {
                                id,
                                resource_href: entry.resource_href().to_string(),
                                reason,
                            });
                        }
                    }
                }

                let tracked: HashSet<&PathBuf> = kept.iter().chain(doomed.iter()).collect();
                let untracked = self.untracked_numbered_dirs(&tracked)?;
                doomed.extend(untracked);
                Ok((report, doomed))
            },
            |(mut report, doomed)| {
                for dir in doomed {
                    match self.remove_numbered_dir(&dir) {
                        Ok(()) => report.deleted_dirs.push(dir),
                        Err(err) => {
                            tracing::warn!(
                                target = "jnlp.cache",
                                path = %dir.display(),
                                error = %err,
                                "failed to delete cache directory"
                            );
                            report.failed.push(CacheCleanFailure {
                                path: dir,
                                error: err.to_string(),
                            });
                        }
                    }
                }
                tracing::info!(
                    target = "jnlp.cache",
                    kept = report.kept,
                    evicted = report.evicted.len(),
                    deleted_dirs = report.deleted_dirs.len(),
                    failed = report.failed.len(),
                    retained_bytes = report.retained_bytes,
                    "cleaned cache"
                );
                Ok(report)
            },
        )
    }

    /// Numbered directories with no index entry, left behind by crashed or
    /// interrupted writers.
    fn untracked_numbered_dirs(&self, tracked: &HashSet<&PathBuf>) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for child in fs::read_dir(self.layout.root())? {
            let child = child?;
            let name = child.file_name();
            let numbered = name
                .to_str()
                .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
            let path = child.path();
            if numbered && child.file_type()?.is_dir() && !tracked.contains(&path) {
                out.push(path);
            }
        }
        Ok(out)
    }

    fn lookup_entry(&self, location: &Url, version: Option<&VersionId>) -> Result<Option<CacheEntry>> {
        if !is_cacheable(location) {
            return Ok(None);
        }
        let cache_file = self.index.get_synchronized(|index| {
            Ok(index
                .find(location, version)
                .map(|entry| self.layout.cache_file(entry.id(), location)))
        })?;
        Ok(cache_file
            .map(|path| CacheEntry::for_cache_file(location.clone(), version.cloned(), path)))
    }

    fn resolve_slot(
        &self,
        index: &mut LruCacheIndex,
        location: &Url,
        version: Option<&VersionId>,
    ) -> Result<PathBuf> {
        if let Some(entry) = index.find_and_mark_as_accessed(location, version) {
            let cache_file = self.layout.cache_file(entry.id(), location);
            if cache_file.parent().is_some_and(Path::is_dir) {
                return Ok(cache_file);
            }
            tracing::debug!(
                target = "jnlp.cache",
                id = entry.id(),
                url = %location,
                "cache directory vanished; allocating a new one"
            );
            index.remove_entry(entry.id());
        }
        self.make_new_cache_file(index, location, version)
    }

    fn replace_in_index(
        &self,
        index: &mut LruCacheIndex,
        location: &Url,
        version: Option<&VersionId>,
    ) -> Result<PathBuf> {
        if let Some(id) = index.find(location, version).map(|entry| entry.id().to_owned()) {
            index.mark_entry_for_deletion(&id);
        }
        self.make_new_cache_file(index, location, version)
    }

    fn make_new_cache_file(
        &self,
        index: &mut LruCacheIndex,
        location: &Url,
        version: Option<&VersionId>,
    ) -> Result<PathBuf> {
        let id = self.next_free_id(index)?;
        let cache_file = self.layout.cache_file(&id, location);
        if let Some(parent) = cache_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut info = Properties::new();
        if let Some(jnlp_path) = &self.config.launch_jnlp_path {
            info.set(KEY_JNLP_PATH, jnlp_path.as_str());
        }
        CacheLock::lock_exclusive(&info_file_for(&cache_file))?.write_properties(&info, None)?;

        index.create_entry(id.as_str(), location, version);
        tracing::debug!(
            target = "jnlp.cache",
            id = %id,
            url = %location,
            "allocated cache directory"
        );
        Ok(cache_file)
    }

    /// The lowest id that is neither in the index nor present on disk.
    fn next_free_id(&self, index: &LruCacheIndex) -> Result<String> {
        (0..u64::MAX)
            .map(|n| n.to_string())
            .find(|id| {
                !index.contains_id(id)
                    && matches!(
                        fs::symlink_metadata(self.layout.root().join(id)),
                        Err(err) if err.kind() == io::ErrorKind::NotFound
                    )
            })
            .ok_or_else(|| io::Error::other("no free cache directory id").into())
    }

    fn remove_numbered_dir(&self, dir: &Path) -> Result<()> {
        validate_under_root(self.layout.root(), dir)?;
        remove_dir_all_nofollow(dir)?;
        Ok(())
    }
}

/// Remove files next to a kept artifact that are neither the artifact nor its
/// `.info` file.
fn remove_stray_siblings(cache_file: &Path) {
    let (Some(parent), Some(name)) = (cache_file.parent(), cache_file.file_name()) else {
        return;
    };
    let info_name = info_file_for(cache_file);
    let Ok(children) = fs::read_dir(parent) else {
        return;
    };
    for child in children.flatten() {
        let path = child.path();
        if child.file_name() == name || path == info_name {
            continue;
        }
        if let Err(err) = remove_dir_all_nofollow(&path) {
            tracing::debug!(
                target = "jnlp.cache",
                path = %path.display(),
                error = %err,
                "failed to remove stray cache file"
            );
        }
    }
}
