use crate::error::Result;
use crate::index::LruCacheIndex;
use crate::lock::CacheLock;
use std::path::{Path, PathBuf};

const INDEX_FILE_COMMENT: &str = "cache index: <id>.href, <id>.version, <id>.lastAccessed, <id>.delete";

/// Serialized access to the shared on-disk index.
///
/// Every call takes the in-process mutex and the cross-process file lock for the
/// index file (both held by one [`CacheLock`]), reloads the index from disk, runs
/// the action and writes the index back only if the action changed it. Nothing is
/// cached between calls, so changes made by other processes are always observed.
///
/// The lock is not reentrant. An action must not call back into this holder or into
/// a [`ResourceCache`](crate::ResourceCache) on the same root: that call waits on the
/// lock the action already holds and never returns. Work with the `&mut
/// LruCacheIndex` handed to the action instead.
#[derive(Debug, Clone)]
pub struct LruCacheIndexHolder {
    index_file: PathBuf,
}

impl LruCacheIndexHolder {
    pub fn new(index_file: impl Into<PathBuf>) -> Self {
        Self {
            index_file: index_file.into(),
        }
    }

    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    pub fn run_synchronized(&self, action: impl FnOnce(&mut LruCacheIndex)) -> Result<()> {
        self.get_synchronized(|index| {
            action(index);
            Ok(())
        })
    }

    pub fn get_synchronized<T>(
        &self,
        action: impl FnOnce(&mut LruCacheIndex) -> Result<T>,
    ) -> Result<T> {
        self.get_synchronized_then(action, Ok)
    }

    /// Like [`Self::get_synchronized`], then runs `after_store` with the action's
    /// result once the index has been written, while the lock is still held.
    pub fn get_synchronized_then<T, R>(
        &self,
        action: impl FnOnce(&mut LruCacheIndex) -> Result<T>,
        after_store: impl FnOnce(T) -> Result<R>,
    ) -> Result<R> {
        let lock = CacheLock::lock_exclusive(&self.index_file)?;
        let mut index = self.load(&lock)?;
        let value = action(&mut index)?;
        if index.is_dirty() {
            lock.write_properties(index.properties(), Some(INDEX_FILE_COMMENT))?;
        }
        let out = after_store(value);
        drop(lock);
        out
    }

    fn load(&self, lock: &CacheLock) -> Result<LruCacheIndex> {
        let properties = lock.read_properties()?;
        let (index, healed) = LruCacheIndex::from_properties(properties);
        if healed {
            tracing::warn!(
                target = "jnlp.cache",
                path = %self.index_file.display(),
                "cache index contained corrupt entries which were discarded; \
                 if cached applications misbehave, clear the cache completely"
            );
        }
        Ok(index)
    }
}
