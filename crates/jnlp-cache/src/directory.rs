//! Read-only view of the cache tree for reporting.
//!
//! The tree mirrors `<root>/<id>/<protocol>/<host>/<path...>`; artifact files are the
//! leaves and carry their `.info` file instead of listing it as a sibling. Building
//! the tree takes no lock, so it may observe a cache that is being modified.

use crate::cache::ResourceCache;
use crate::error::Result;
use crate::layout::INFO_SUFFIX;
use crate::util::is_not_found;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryNode {
    name: String,
    path: PathBuf,
    is_dir: bool,
    info_file: Option<PathBuf>,
    children: Vec<DirectoryNode>,
}

impl DirectoryNode {
    fn new(path: PathBuf, is_dir: bool) -> Self {
        Self {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            is_dir,
            info_file: None,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The metadata file of a cached artifact, when present.
    pub fn info_file(&self) -> Option<&Path> {
        self.info_file.as_deref()
    }

    pub fn children(&self) -> &[DirectoryNode] {
        &self.children
    }

    /// Artifact files are leaves; directories are not, even when empty.
    pub fn is_leaf(&self) -> bool {
        !self.is_dir
    }

    /// All artifact files below this node, depth first in name order.
    pub fn leaves(&self) -> Vec<&DirectoryNode> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a DirectoryNode>) {
        if self.is_leaf() {
            out.push(self);
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }

    pub fn find(&self, path: &Path) -> Option<&DirectoryNode> {
        if path == self.path {
            return Some(self);
        }
        let relative = path.strip_prefix(&self.path).ok()?;
        let mut node = self;
        for component in relative.components() {
            node = node
                .children
                .iter()
                .find(|child| child.path.file_name() == Some(component.as_os_str()))?;
        }
        Some(node)
    }

    fn find_mut(&mut self, path: &Path) -> Option<&mut DirectoryNode> {
        let relative = path.strip_prefix(&self.path).ok()?.to_path_buf();
        let mut node = self;
        for component in relative.components() {
            node = node
                .children
                .iter_mut()
                .find(|child| child.path.file_name() == Some(component.as_os_str()))?;
        }
        Some(node)
    }

    fn insert(&mut self, relative: &Path, is_dir: bool) {
        let components: Vec<_> = relative.components().collect();
        let mut current = self.path.clone();
        let mut node = self;
        for (i, component) in components.iter().enumerate() {
            current.push(component.as_os_str());
            let last = i + 1 == components.len();
            let pos = match node.children.iter().position(|child| child.path == current) {
                Some(pos) => pos,
                None => {
                    node.children
                        .push(DirectoryNode::new(current.clone(), !last || is_dir));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[pos];
        }
    }
}

pub struct CacheDirectory;

impl CacheDirectory {
    /// Build the tree of numbered directories under `root`. Files directly in the
    /// root (the index, lock files) are not part of it.
    pub fn build(root: &Path) -> DirectoryNode {
        let mut tree = DirectoryNode::new(root.to_path_buf(), true);
        let mut info_files = Vec::new();

        let walker = walkdir::WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || entry.file_type().is_dir());
        for entry in walker {
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
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let is_info = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(INFO_SUFFIX));
            if is_info {
                info_files.push(entry.path().to_path_buf());
            } else {
                tree.insert(relative, entry.file_type().is_dir());
            }
        }

        for info_file in info_files {
            let Some(name) = info_file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(artifact) = name.strip_suffix(INFO_SUFFIX) else {
                continue;
            };
            let artifact = info_file.with_file_name(artifact);
            if let Some(node) = tree.find_mut(&artifact).filter(|node| node.is_leaf()) {
                node.info_file = Some(info_file);
            }
        }
        tree
    }

    /// Drop the node at `path` and every ancestor directory left empty by it. The
    /// root itself is never removed. Memory only; the disk is not touched.
    pub fn remove(root: &mut DirectoryNode, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&root.path) else {
            return false;
        };
        let components: Vec<OsString> = relative
            .components()
            .map(|c| c.as_os_str().to_owned())
            .collect();
        remove_below(root, &components)
    }
}

fn remove_below(node: &mut DirectoryNode, components: &[OsString]) -> bool {
    let Some((first, rest)) = components.split_first() else {
        return false;
    };
    let Some(pos) = node
        .children
        .iter()
        .position(|child| child.path.file_name() == Some(first.as_os_str()))
    else {
        return false;
    };
    if rest.is_empty() {
        node.children.remove(pos);
        return true;
    }
    let removed = remove_below(&mut node.children[pos], rest);
    let child = &node.children[pos];
    if removed && child.is_dir && child.children.is_empty() {
        node.children.remove(pos);
    }
    removed
}

impl ResourceCache {
    /// Delete the resource owning `path` through the cache, then drop its numbered
    /// directory from the in-memory tree.
    pub fn delete_tree_entry(&self, tree: &mut DirectoryNode, path: &Path) -> Result<bool> {
        let deleted = self.delete_cache_file(path)?;
        if let Some(dir) = self.layout().numbered_dir(path) {
            CacheDirectory::remove(tree, &dir);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn builds_numbered_tree_with_info_attached() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        touch(&root.join("recently_used"), "");
        touch(&root.join("0/http/x/a.jar"), "aa");
        touch(&root.join("0/http/x/a.jar.info"), "content-length=2\n");
        touch(&root.join("1/https/y/lib/b.jar"), "b");

        let tree = CacheDirectory::build(root);
        let names: Vec<_> = tree.children().iter().map(DirectoryNode::name).collect();
        assert_eq!(names, vec!["0", "1"]);

        let leaves: Vec<_> = tree.leaves().into_iter().map(|n| n.path().to_path_buf()).collect();
        assert_eq!(
            leaves,
            vec![root.join("0/http/x/a.jar"), root.join("1/https/y/lib/b.jar")]
        );

        let a = tree.find(&root.join("0/http/x/a.jar")).unwrap();
        assert!(a.is_leaf());
        assert_eq!(a.info_file(), Some(root.join("0/http/x/a.jar.info").as_path()));
        assert_eq!(tree.find(&root.join("1/https/y/lib/b.jar")).unwrap().info_file(), None);
        assert!(tree.find(&root.join("0/http/x/a.jar.info")).is_none());
    }

    #[test]
    fn remove_prunes_empty_ancestors_only() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        touch(&root.join("0/http/x/a.jar"), "a");
        touch(&root.join("0/http/x/b.jar"), "b");
        touch(&root.join("1/http/y/c.jar"), "c");
        let mut tree = CacheDirectory::build(root);

        assert!(CacheDirectory::remove(&mut tree, &root.join("0/http/x/a.jar")));
        assert!(tree.find(&root.join("0/http/x")).is_some());

        assert!(CacheDirectory::remove(&mut tree, &root.join("1/http/y/c.jar")));
        assert!(tree.find(&root.join("1")).is_none());
        assert!(!CacheDirectory::remove(&mut tree, &root.join("1/http/y/c.jar")));

        // The disk is untouched.
        assert!(root.join("1/http/y/c.jar").exists());
    }
}
