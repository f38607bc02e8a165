use crate::version::VersionId;
use url::Url;

/// Identity of a cached resource: its remote location and optional version.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub location: Url,
    pub version: Option<VersionId>,
}

impl CacheKey {
    pub fn new(location: Url, version: Option<VersionId>) -> Self {
        Self { location, version }
    }
}

/// Remote identity and transfer metadata of a downloaded resource.
///
/// Timestamps are epoch milliseconds; `0` means unknown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceInfo {
    key: CacheKey,
    size: u64,
    last_modified: u64,
    downloaded_at: u64,
}

impl ResourceInfo {
    pub fn new(
        location: Url,
        version: Option<VersionId>,
        size: u64,
        last_modified: u64,
        downloaded_at: u64,
    ) -> Self {
        Self {
            key: CacheKey::new(location, version),
            size,
            last_modified,
            downloaded_at,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn location(&self) -> &Url {
        &self.key.location
    }

    pub fn version(&self) -> Option<&VersionId> {
        self.key.version.as_ref()
    }

    /// Expected length of the artifact in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    pub fn downloaded_at(&self) -> u64 {
        self.downloaded_at
    }
}
