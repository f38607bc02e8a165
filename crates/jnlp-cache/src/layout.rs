//! Mapping between resource URLs and paths under the cache root.
//!
//! An artifact lives at `<root>/<id>/<protocol>/<host>[:port]/<path...>` with its
//! metadata next to it in `<artifact>.info`. The numbered `<id>` directory is the
//! unit of allocation and eviction.

use crate::error::CacheError;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use url::Url;

pub const INFO_SUFFIX: &str = ".info";

/// Longest single path segment most filesystems accept.
const MAX_SEGMENT_BYTES: usize = 255;

#[cfg(windows)]
const PORT_SEPARATOR: char = '_';
#[cfg(not(windows))]
const PORT_SEPARATOR: char = ':';

/// Whether `url` may be stored in the cache at all.
///
/// Local resources (`file:`) and nested archive URLs (`jar:`) are read in place, and a
/// URL without a host has no cache location.
pub fn is_cacheable(url: &Url) -> bool {
    !matches!(url.scheme(), "file" | "jar") && url.host_str().is_some_and(|h| !h.is_empty())
}

pub(crate) fn ensure_cacheable(url: &Url) -> Result<(), CacheError> {
    if is_cacheable(url) {
        Ok(())
    } else {
        Err(CacheError::NotCacheable {
            url: url.to_string(),
        })
    }
}

/// The cache-relative location of `url`, without the numbered directory.
pub fn url_to_relative_path(url: &Url) -> PathBuf {
    let mut path = PathBuf::from(url.scheme());

    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => path.push(format!("{host}{PORT_SEPARATOR}{port}")),
        None => path.push(host),
    }

    let mut segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty() && *s != "." && *s != "..")
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    if url.path().ends_with('/') || segments.is_empty() {
        segments.push("index".to_owned());
    }

    if let Some(query) = url.query() {
        if let Some(last) = segments.last_mut() {
            *last = with_hash_before_extension(last, &short_digest(query));
        }
    }

    for segment in segments {
        if segment.len() > MAX_SEGMENT_BYTES {
            path.push(hashed_segment(&segment));
        } else {
            path.push(segment);
        }
    }
    path
}

fn short_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..8])
}

fn with_hash_before_extension(name: &str, hash: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{hash}.{ext}"),
        _ => format!("{name}.{hash}"),
    }
}

fn hashed_segment(segment: &str) -> String {
    let digest = hex::encode(Sha256::digest(segment.as_bytes()));
    match segment.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 16 => format!("{digest}.{ext}"),
        _ => digest,
    }
}

/// Paths under one cache root.
#[derive(Clone, Debug)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_file(&self, id: &str, url: &Url) -> PathBuf {
        self.root.join(id).join(url_to_relative_path(url))
    }

    /// The numbered directory (`<root>/<id>`) that owns `path`.
    pub fn numbered_dir(&self, path: &Path) -> Option<PathBuf> {
        match path.strip_prefix(&self.root).ok()?.components().next()? {
            Component::Normal(first) => Some(self.root.join(first)),
            _ => None,
        }
    }

    /// `path` with the root and numbered directory stripped.
    pub fn relative_url_path(&self, path: &Path) -> Option<PathBuf> {
        let mut components = path.strip_prefix(&self.root).ok()?.components();
        components.next()?;
        let rest = components.as_path();
        (!rest.as_os_str().is_empty()).then(|| rest.to_path_buf())
    }

    /// Host part of the `<protocol>/<host>[:port]` segment of a cached path.
    pub fn domain_of(&self, path: &Path) -> Option<String> {
        let relative = self.relative_url_path(path)?;
        let mut components = relative.components();
        components.next()?;
        let host = components.next()?.as_os_str().to_string_lossy().into_owned();
        Some(match host.rsplit_once(PORT_SEPARATOR) {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_owned(),
            _ => host,
        })
    }
}

pub fn info_file_for(cache_file: &Path) -> PathBuf {
    let mut name = cache_file
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(INFO_SUFFIX);
    cache_file.with_file_name(name)
}

/// Inverse of [`info_file_for`]; `None` when `path` is not an `.info` file.
pub fn cache_file_for_info(info_file: &Path) -> Option<PathBuf> {
    let name = info_file.file_name()?.to_str()?;
    let artifact = name.strip_suffix(INFO_SUFFIX)?;
    (!artifact.is_empty()).then(|| info_file.with_file_name(artifact))
}
