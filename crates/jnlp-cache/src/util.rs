use crate::error::CacheError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            // System clock set before 1970. Log at most once.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "jnlp.cache",
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `path` by streaming into a unique sibling temp file and renaming it into
/// place, so readers in other processes never observe a half-written artifact.
///
/// Returns the number of bytes written.
pub(crate) fn atomic_write_from(path: &Path, reader: &mut impl io::Read) -> Result<u64, CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> io::Result<u64> {
        let written = io::copy(reader, &mut file)?;
        file.sync_all()?;
        Ok(written)
    })();
    let written = match write_result {
        Ok(written) => written,
        Err(err) => {
            drop(file);
            remove_file_best_effort(&tmp_path, "atomic_write_from.write_failed");
            return Err(err.into());
        }
    };
    drop(file);

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write_from.rename_failed");
        return Err(err.into());
    }
    Ok(written)
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows) && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) =>
            {
                // On Windows, `rename` doesn't overwrite; retry until we win.
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }
                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "jnlp.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Remove `path` recursively without following symlinks. A missing path is not an
/// error.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() {
        return remove_non_dir(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(io::Error::other(err)),
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            remove_non_dir(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn remove_non_dir(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::IsADirectory => fs::remove_dir(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
}

pub(crate) fn modified_millis(path: &Path) -> Option<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            // Cache entries can race with deletion; only log unexpected errors.
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "jnlp.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat file while reading modified time"
                );
            }
            return None;
        }
    };

    meta.modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}

/// Lexical check only; symlinks are not resolved.
pub(crate) fn validate_under_root(cache_root: &Path, path: &Path) -> Result<(), CacheError> {
    if path == cache_root || path.strip_prefix(cache_root).is_err() {
        return Err(CacheError::PathNotUnderCacheRoot {
            path: path.to_path_buf(),
            cache_root: cache_root.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_streams_and_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("0/http/example.com/a.jar");
        let written = atomic_write_from(&path, &mut &b"hello"[..]).unwrap();
        assert_eq!(written, 5);
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        let siblings: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings, vec![std::ffi::OsString::from("a.jar")]);
    }

    #[test]
    fn remove_dir_all_nofollow_ignores_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        remove_dir_all_nofollow(&tmp.path().join("nope")).unwrap();

        let dir = tmp.path().join("7/http/host");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.jar"), b"jar").unwrap();
        remove_dir_all_nofollow(&tmp.path().join("7")).unwrap();
        assert!(!tmp.path().join("7").exists());
    }
}
