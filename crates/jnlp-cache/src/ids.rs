//! Grouping of cached files by the application that downloaded them (its
//! descriptor path) or by the host they came from.

use crate::entry::{read_info_file, KEY_JNLP_PATH};
use crate::error::Result;
use crate::layout::{cache_file_for_info, CacheLayout, INFO_SUFFIX};
use crate::util::{is_not_found, modified_millis};
use jnlp_properties::Properties;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheIdKind {
    /// The descriptor path recorded in `.info` files.
    JnlpPath,
    /// The host a resource was downloaded from.
    Domain,
}

/// One cached artifact, as listed by [`crate::ResourceCache::get_cache_ids`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheFileRow {
    pub path: PathBuf,
    pub parent_dir: PathBuf,
    /// Lower-cased file extension (`jar`, `jnlp`, ...), empty when there is none.
    pub type_label: String,
    pub domain: String,
    pub size: u64,
    /// File modification time, epoch millis; `0` when unknown.
    pub last_modified: u64,
    pub jnlp_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheId {
    pub id: String,
    pub kind: CacheIdKind,
    pub files: Vec<CacheFileRow>,
}

/// Every `.info` file under `root`, in a stable (sorted) order.
///
/// Walk errors are logged and skipped; the result is advisory.
pub(crate) fn walk_info_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .min_depth(2)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if !is_not_found(&err) {
                    tracing::debug!(
                        target = "jnlp.cache",
                        path = err.path().map(|p| p.display().to_string()),
                        error = %err,
                        "failed to walk cache directory"
                    );
                }
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(INFO_SUFFIX))
        {
            out.push(entry.into_path());
        }
    }
    out
}

struct ListedFile {
    cache_file: PathBuf,
    properties: Properties,
    domain: Option<String>,
}

impl ListedFile {
    fn jnlp_path(&self) -> Option<&str> {
        self.properties
            .get(KEY_JNLP_PATH)
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    fn row(&self) -> CacheFileRow {
        let size = std::fs::metadata(&self.cache_file)
            .map(|m| m.len())
            .unwrap_or(0);
        CacheFileRow {
            path: self.cache_file.clone(),
            parent_dir: self
                .cache_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            type_label: self
                .cache_file
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
            domain: self.domain.clone().unwrap_or_default(),
            size,
            last_modified: modified_millis(&self.cache_file).unwrap_or(0),
            jnlp_path: self.jnlp_path().map(str::to_owned),
        }
    }
}

pub(crate) fn collect_cache_ids(
    layout: &CacheLayout,
    filter: &str,
    include_jnlp_path: bool,
    include_domain: bool,
) -> Result<Vec<CacheId>> {
    let filter = Regex::new(&format!("^(?:{filter})$"))?;

    let listed: Vec<ListedFile> = walk_info_files(layout.root())
        .into_iter()
        .filter_map(|info_file| {
            let cache_file = cache_file_for_info(&info_file)?;
            if !cache_file.is_file() {
                return None;
            }
            Some(ListedFile {
                domain: layout.domain_of(&cache_file),
                properties: read_info_file(&info_file),
                cache_file,
            })
        })
        .collect();

    let mut ids: BTreeMap<(CacheIdKind, String), CacheId> = BTreeMap::new();
    for file in &listed {
        let mut candidates = Vec::with_capacity(2);
        if include_jnlp_path {
            if let Some(jnlp_path) = file.jnlp_path() {
                candidates.push((CacheIdKind::JnlpPath, jnlp_path));
            }
        }
        if include_domain {
            if let Some(domain) = file.domain.as_deref() {
                candidates.push((CacheIdKind::Domain, domain));
            }
        }
        for (kind, id) in candidates {
            if filter.is_match(id) {
                ids.entry((kind, id.to_owned())).or_insert_with(|| CacheId {
                    id: id.to_owned(),
                    kind,
                    files: Vec::new(),
                });
            }
        }
    }

    for ((kind, id), cache_id) in ids.iter_mut() {
        cache_id.files = listed
            .iter()
            .filter(|file| match kind {
                CacheIdKind::JnlpPath => file.jnlp_path() == Some(id.as_str()),
                CacheIdKind::Domain => file.domain.as_deref() == Some(id.as_str()),
            })
            .map(ListedFile::row)
            .collect();
    }

    Ok(ids.into_values().collect())
}

/// Whether an `.info` file belongs to the logical group `id` (descriptor path or
/// domain, compared case-insensitively).
pub(crate) fn info_matches_id(
    layout: &CacheLayout,
    info_file: &Path,
    properties: &Properties,
    id: &str,
) -> bool {
    let by_jnlp = properties
        .get(KEY_JNLP_PATH)
        .is_some_and(|p| !p.trim().is_empty() && p.trim().eq_ignore_ascii_case(id));
    let by_domain = || {
        cache_file_for_info(info_file)
            .and_then(|cache_file| layout.domain_of(&cache_file))
            .is_some_and(|domain| domain.eq_ignore_ascii_case(id))
    };
    by_jnlp || by_domain()
}
