use crate::error::CacheError;
use fs2::FileExt as _;
use jnlp_properties::Properties;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, TryLockError};

/// A filesystem-backed lock that is safe to share across multiple launcher processes.
///
/// The lock is taken on the file itself, and the locked handle is also the one used to
/// read and rewrite the file, so the file is never replaced by a rename while locked.
/// The lock is released when the returned value is dropped.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    // `fs2` file locks do not reliably exclude other threads of the same process on
    // every platform. Keep an in-process mutex guard to ensure mutual exclusion
    // between threads, while the file lock provides cross-process coordination.
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Acquire an exclusive lock on `path`, creating the file (owner-only permissions)
    /// if needed.
    ///
    /// This call blocks until the lock is available. Locking the same path twice on
    /// one thread deadlocks.
    pub fn lock_exclusive(path: &Path) -> Result<Self, CacheError> {
        let mutex = process_lock_for_path(path);
        let guard = mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let file = open_restricted(path)?;
        file.lock_exclusive()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    /// Try to take an exclusive lock on an *existing* file without blocking.
    ///
    /// Returns `Ok(None)` when another holder (thread or process) has the lock.
    /// Returns `Err` with `NotFound` when the file does not exist; the file is never
    /// created here.
    pub fn try_lock_existing(path: &Path) -> Result<Option<Self>, CacheError> {
        let mutex = process_lock_for_path(path);
        let guard = match mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
                _guard: guard,
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole locked file as a properties document.
    pub(crate) fn read_properties(&self) -> Result<Properties, CacheError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        Ok(Properties::read_from(file)?)
    }

    /// Replace the contents of the locked file in place.
    pub(crate) fn write_properties(
        &self,
        props: &Properties,
        comment: Option<&str>,
    ) -> Result<(), CacheError> {
        let mut file = &self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        props.write_to(file, comment)?;
        file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// A shared lock a running launcher holds on the main instance lock file for its
/// whole lifetime.
///
/// While any process holds one, [`crate::ResourceCache::ok_to_clear_cache`] in every
/// other process reports the cache as busy and destructive operations are refused.
#[derive(Debug)]
pub struct RunningInstanceLock {
    file: File,
    path: PathBuf,
}

impl RunningInstanceLock {
    /// Mark this process as a running cache user. Blocks while a destructive cache
    /// operation holds the lock exclusively.
    pub fn acquire(path: &Path) -> Result<Self, CacheError> {
        let file = open_restricted(path)?;
        file.lock_shared()?;
        tracing::debug!(
            target = "jnlp.cache",
            path = %path.display(),
            "acquired running instance lock"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunningInstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

pub(crate) fn open_restricted(path: &Path) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.create(true).truncate(false).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn try_lock_reports_busy_while_another_handle_holds_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("instance.lock");
        std::fs::write(&path, b"").unwrap();

        let other = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        other.lock_shared().unwrap();
        assert!(CacheLock::try_lock_existing(&path).unwrap().is_none());

        other.unlock().unwrap();
        assert!(CacheLock::try_lock_existing(&path).unwrap().is_some());
    }

    #[test]
    fn try_lock_does_not_create_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.lock");
        let err = CacheLock::try_lock_existing(&path).unwrap_err();
        assert!(matches!(err, CacheError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound));
        assert!(!path.exists());
    }

    #[test]
    fn write_properties_replaces_contents_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.jar.info");
        std::fs::write(&path, "content-length=123456789\nstale=1\n").unwrap();

        let lock = CacheLock::lock_exclusive(&path).unwrap();
        let mut props = lock.read_properties().unwrap();
        props.remove("stale");
        props.set("content-length", "5");
        lock.write_properties(&props, None).unwrap();
        drop(lock);

        let mut text = String::new();
        File::open(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "content-length=5\n");
    }

    #[cfg(unix)]
    #[test]
    fn created_lock_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("recently_used");
        drop(CacheLock::lock_exclusive(&path).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
