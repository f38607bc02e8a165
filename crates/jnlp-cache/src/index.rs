//! The least-recently-used index of cached resources.
//!
//! On disk the index is a flat `.properties` file shared by every launcher
//! process. Each entry is stored as a group of dotted keys:
//!
//! ```text
//! 3.href=https://example.com/app/main.jar
//! 3.version=1.2
//! 3.lastAccessed=1700000000000
//! 3.delete=true
//! ```
//!
//! The in-memory [`LruCacheIndex`] keeps the raw [`Properties`] and the typed
//! entries side by side; every mutation updates both, so storing the index is a
//! plain write of the properties.

use crate::util::now_millis;
use crate::version::{VersionId, VersionString};
use jnlp_properties::Properties;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

pub const KEY_HREF: &str = "href";
pub const KEY_VERSION: &str = "version";
pub const KEY_LAST_ACCESSED: &str = "lastAccessed";
pub const KEY_DELETE: &str = "delete";

const ALL_KEYS: [&str; 4] = [KEY_HREF, KEY_VERSION, KEY_LAST_ACCESSED, KEY_DELETE];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Live { last_accessed: u64 },
    MarkedForDeletion,
}

/// A single resource known to the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    id: String,
    state: EntryState,
    resource_href: Url,
    version: Option<VersionId>,
}

impl IndexEntry {
    /// Name of the numbered cache directory holding this resource.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_href(&self) -> &Url {
        &self.resource_href
    }

    pub fn version(&self) -> Option<&VersionId> {
        self.version.as_ref()
    }

    /// `None` for entries marked for deletion.
    pub fn last_accessed(&self) -> Option<u64> {
        match self.state {
            EntryState::Live { last_accessed } => Some(last_accessed),
            EntryState::MarkedForDeletion => None,
        }
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.state == EntryState::MarkedForDeletion
    }

    fn matches(&self, url: &Url, version: Option<&VersionId>) -> bool {
        !self.is_marked_for_deletion()
            && self.resource_href == *url
            && self.version.as_ref() == version
    }

    fn matches_range(&self, url: &Url, versions: Option<&VersionString>) -> bool {
        if self.is_marked_for_deletion() || self.resource_href != *url {
            return false;
        }
        match (versions, &self.version) {
            (None, _) => true,
            (Some(range), Some(version)) => range.contains(version),
            (Some(_), None) => false,
        }
    }
}

fn mru_order(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    match (a.state, b.state) {
        (EntryState::Live { last_accessed: x }, EntryState::Live { last_accessed: y }) => {
            y.cmp(&x).then_with(|| a.id.cmp(&b.id))
        }
        (EntryState::Live { .. }, EntryState::MarkedForDeletion) => Ordering::Less,
        (EntryState::MarkedForDeletion, EntryState::Live { .. }) => Ordering::Greater,
        (EntryState::MarkedForDeletion, EntryState::MarkedForDeletion) => a.id.cmp(&b.id),
    }
}

fn property_key(id: &str, field: &str) -> String {
    format!("{id}.{field}")
}

#[derive(Default)]
struct RawGroup<'a> {
    href: Option<&'a str>,
    version: Option<&'a str>,
    last_accessed: Option<&'a str>,
    delete: Option<&'a str>,
}

/// Rebuild typed entries from raw index properties.
///
/// Keys that are not exactly `<id>.<field>` with a known field are removed from
/// `properties`. An id whose href (or version, when present) does not parse, or
/// which is live but lacks a parsable `lastAccessed`, is broken and all of its keys
/// are removed. Returns the entries in most-recently-used order and whether anything
/// was discarded, in which case the caller must store `properties` again.
pub fn convert_properties_to_entries(properties: &mut Properties) -> (Vec<IndexEntry>, bool) {
    let mut groups: BTreeMap<String, RawGroup<'_>> = BTreeMap::new();
    let mut bad_keys = Vec::new();

    for (key, value) in properties.iter() {
        let parts: Vec<&str> = key.split('.').collect();
        let [id, field] = parts.as_slice() else {
            bad_keys.push(key.to_owned());
            continue;
        };
        if id.is_empty() {
            bad_keys.push(key.to_owned());
            continue;
        }
        let group = groups.entry((*id).to_owned()).or_default();
        match *field {
            KEY_HREF => group.href = Some(value),
            KEY_VERSION => group.version = Some(value),
            KEY_LAST_ACCESSED => group.last_accessed = Some(value),
            KEY_DELETE => group.delete = Some(value),
            _ => bad_keys.push(key.to_owned()),
        }
    }

    let mut entries = Vec::with_capacity(groups.len());
    let mut broken_ids = BTreeSet::new();
    for (id, group) in &groups {
        match entry_from_group(id, group) {
            Some(entry) => entries.push(entry),
            None => {
                broken_ids.insert(id.clone());
            }
        }
    }
    drop(groups);

    for key in &bad_keys {
        properties.remove(key);
    }
    for id in &broken_ids {
        tracing::debug!(target = "jnlp.cache", id = %id, "discarding broken cache index entry");
        for field in ALL_KEYS {
            properties.remove(&property_key(id, field));
        }
    }

    entries.sort_by(mru_order);
    let discarded = !bad_keys.is_empty() || !broken_ids.is_empty();
    (entries, discarded)
}

fn entry_from_group(id: &str, group: &RawGroup<'_>) -> Option<IndexEntry> {
    let resource_href = Url::parse(group.href?.trim()).ok()?;
    let version = match group.version.map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(VersionId::parse(raw).ok()?),
    };
    let marked = group
        .delete
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));
    let state = if marked {
        EntryState::MarkedForDeletion
    } else {
        EntryState::Live {
            last_accessed: group.last_accessed?.trim().parse().ok()?,
        }
    };
    Some(IndexEntry {
        id: id.to_owned(),
        state,
        resource_href,
        version,
    })
}

/// In-memory view of the index for the duration of one locked session.
#[derive(Debug, Default)]
pub struct LruCacheIndex {
    properties: Properties,
    entries: Vec<IndexEntry>,
    dirty: bool,
}

impl LruCacheIndex {
    /// Build the index from raw properties, healing corrupt records.
    ///
    /// A healed index starts out dirty so the repaired file is written back.
    pub fn from_properties(mut properties: Properties) -> (Self, bool) {
        let (entries, discarded) = convert_properties_to_entries(&mut properties);
        let index = Self {
            properties,
            entries,
            dirty: discarded,
        };
        (index, discarded)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// All entries, most recently used first, entries marked for deletion last.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn find(&self, url: &Url, version: Option<&VersionId>) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.matches(url, version))
    }

    pub fn find_and_mark_as_accessed(
        &mut self,
        url: &Url,
        version: Option<&VersionId>,
    ) -> Option<IndexEntry> {
        let pos = self.entries.iter().position(|e| e.matches(url, version))?;
        Some(self.mark_as_accessed(pos))
    }

    /// Live entries for `url` whose version lies in `versions`.
    ///
    /// Without a version string every live entry for `url` matches, in MRU order.
    pub fn find_all(&self, url: &Url, versions: Option<&VersionString>) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches_range(url, versions))
            .collect()
    }

    /// The highest matching version, or the most recently used match when no
    /// version string is given.
    pub fn find_best_and_mark_as_accessed(
        &mut self,
        url: &Url,
        versions: Option<&VersionString>,
    ) -> Option<IndexEntry> {
        let candidates = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.matches_range(url, versions));
        let pos = match versions {
            None => candidates.map(|(pos, _)| pos).next()?,
            // `max_by` keeps the last maximum; iterate in reverse so the most recently
            // used of equal versions wins.
            Some(_) => {
                let candidates: Vec<_> = candidates.collect();
                candidates
                    .into_iter()
                    .rev()
                    .max_by(|(_, a), (_, b)| a.version.cmp(&b.version))
                    .map(|(pos, _)| pos)?
            }
        };
        Some(self.mark_as_accessed(pos))
    }

    /// Register a new live entry as the most recently used one.
    pub fn create_entry(
        &mut self,
        id: impl Into<String>,
        url: &Url,
        version: Option<&VersionId>,
    ) -> IndexEntry {
        let id = id.into();
        self.remove_entry(&id);

        let last_accessed = self.next_access_timestamp();
        self.properties
            .set(property_key(&id, KEY_HREF), url.as_str());
        if let Some(version) = version {
            self.properties
                .set(property_key(&id, KEY_VERSION), version.as_str());
        }
        self.properties
            .set(property_key(&id, KEY_LAST_ACCESSED), last_accessed.to_string());

        let entry = IndexEntry {
            id,
            state: EntryState::Live { last_accessed },
            resource_href: url.clone(),
            version: version.cloned(),
        };
        self.entries.insert(0, entry.clone());
        self.dirty = true;
        entry
    }

    /// Turn a live entry into a tombstone; the next clean pass removes it.
    pub fn mark_entry_for_deletion(&mut self, id: &str) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        if self.entries[pos].is_marked_for_deletion() {
            return true;
        }
        let mut entry = self.entries.remove(pos);
        entry.state = EntryState::MarkedForDeletion;
        self.properties.set(property_key(id, KEY_DELETE), "true");

        let insert_at = self
            .entries
            .iter()
            .position(|e| mru_order(&entry, e) == Ordering::Less)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_at, entry);
        self.dirty = true;
        true
    }

    /// Erase an entry and all of its keys.
    pub fn remove_entry(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let mut removed = self.entries.len() != before;
        for field in ALL_KEYS {
            removed |= self.properties.remove(&property_key(id, field)).is_some();
        }
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.properties.clear();
        self.dirty = true;
    }

    fn mark_as_accessed(&mut self, pos: usize) -> IndexEntry {
        let last_accessed = self.next_access_timestamp();
        let mut entry = self.entries.remove(pos);
        entry.state = EntryState::Live { last_accessed };
        self.properties.set(
            property_key(&entry.id, KEY_LAST_ACCESSED),
            last_accessed.to_string(),
        );
        self.entries.insert(0, entry.clone());
        self.dirty = true;
        entry
    }

    /// Access timestamps are strictly increasing so MRU order survives a store and
    /// reload even when several accesses fall into the same millisecond.
    fn next_access_timestamp(&self) -> u64 {
        let newest = self
            .entries
            .iter()
            .filter_map(IndexEntry::last_accessed)
            .max();
        match newest {
            Some(newest) => now_millis().max(newest.saturating_add(1)),
            None => now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jnlp_properties::parse;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn version(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    #[test]
    fn keys_without_exactly_two_parts_are_dropped() {
        let mut props = parse(
            "garbage=1\n\
             a.b.c=2\n\
             0.href=http://x/a.jar\n\
             0.lastAccessed=10\n",
        );
        let (entries, discarded) = convert_properties_to_entries(&mut props);
        assert!(discarded);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), "0");
        assert!(!props.contains_key("garbage"));
        assert!(!props.contains_key("a.b.c"));

        // A second pass over the healed properties is clean.
        let (again, discarded) = convert_properties_to_entries(&mut props);
        assert!(!discarded);
        assert_eq!(again, entries);
    }

    #[test]
    fn broken_ids_lose_all_their_keys() {
        let mut props = parse(
            "1.href=http://x/a.jar\n\
             1.lastAccessed=not-a-number\n\
             1.version=1.0\n\
             2.href=::not a url::\n\
             2.lastAccessed=5\n\
             3.href=http://x/c.jar\n\
             3.lastAccessed=7\n",
        );
        let (entries, discarded) = convert_properties_to_entries(&mut props);
        assert!(discarded);
        assert_eq!(
            entries.iter().map(IndexEntry::id).collect::<Vec<_>>(),
            vec!["3"]
        );
        assert_eq!(props.keys().collect::<Vec<_>>(), vec!["3.href", "3.lastAccessed"]);
    }

    #[test]
    fn tombstones_ignore_timestamps_and_sort_last() {
        let mut props = parse(
            "1.href=http://x/a.jar\n\
             1.delete=true\n\
             1.lastAccessed=garbage\n\
             2.href=http://x/b.jar\n\
             2.lastAccessed=100\n\
             3.href=http://x/c.jar\n\
             3.lastAccessed=200\n",
        );
        let (entries, discarded) = convert_properties_to_entries(&mut props);
        assert!(!discarded);
        let ids: Vec<_> = entries.iter().map(IndexEntry::id).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);
        assert!(entries[2].is_marked_for_deletion());
        assert_eq!(entries[2].last_accessed(), None);
    }

    #[test]
    fn find_and_mark_moves_entry_to_front() {
        let mut index = LruCacheIndex::default();
        let a = url("http://x/a.jar");
        let b = url("http://x/b.jar");
        index.create_entry("0", &a, None);
        index.create_entry("1", &b, None);
        assert_eq!(index.entries()[0].id(), "1");

        let found = index.find_and_mark_as_accessed(&a, None).unwrap();
        assert_eq!(found.id(), "0");
        assert_eq!(index.entries()[0].id(), "0");
        assert!(index.entries()[0].last_accessed() > index.entries()[1].last_accessed());
        assert_eq!(
            index.properties().get("0.lastAccessed"),
            Some(found.last_accessed().unwrap().to_string().as_str())
        );
    }

    #[test]
    fn find_matches_exact_version_only() {
        let mut index = LruCacheIndex::default();
        let a = url("http://x/a.jar");
        index.create_entry("0", &a, Some(&version("1.0")));
        assert!(index.find(&a, Some(&version("1.0"))).is_some());
        assert!(index.find(&a, Some(&version("2.0"))).is_none());
        assert!(index.find(&a, None).is_none());
    }

    #[test]
    fn best_match_picks_highest_version_in_range() {
        let mut index = LruCacheIndex::default();
        let a = url("http://x/a.jar");
        index.create_entry("0", &a, Some(&version("1.2")));
        index.create_entry("1", &a, Some(&version("1.10")));
        index.create_entry("2", &a, Some(&version("2.0")));
        index.create_entry("3", &a, None);

        let range = VersionString::parse("1.0+&1*").unwrap();
        assert_eq!(index.find_all(&a, Some(&range)).len(), 2);
        let best = index
            .find_best_and_mark_as_accessed(&a, Some(&range))
            .unwrap();
        assert_eq!(best.id(), "1");
        assert_eq!(index.entries()[0].id(), "1");

        // Without a version string the most recently used match wins.
        let mru = index.find_best_and_mark_as_accessed(&a, None).unwrap();
        assert_eq!(mru.id(), "1");
    }

    #[test]
    fn tombstoned_entries_are_invisible_to_lookups() {
        let mut index = LruCacheIndex::default();
        let a = url("http://x/a.jar");
        index.create_entry("0", &a, None);
        index.create_entry("1", &url("http://x/b.jar"), None);
        assert!(index.mark_entry_for_deletion("0"));

        assert!(index.find(&a, None).is_none());
        assert!(index.find_all(&a, None).is_empty());
        assert_eq!(index.properties().get("0.delete"), Some("true"));
        assert_eq!(index.entries().last().unwrap().id(), "0");
        assert!(index.contains_id("0"));
    }

    #[test]
    fn remove_entry_erases_every_key() {
        let mut index = LruCacheIndex::default();
        let a = url("http://x/a.jar");
        index.create_entry("0", &a, Some(&version("1")));
        index.mark_entry_for_deletion("0");
        assert!(index.remove_entry("0"));
        assert!(index.properties().is_empty());
        assert!(index.entries().is_empty());
        assert!(!index.remove_entry("0"));
    }

    #[test]
    fn clean_load_is_not_dirty() {
        let props = parse("0.href=http://x/a.jar\n0.lastAccessed=1\n");
        let (index, healed) = LruCacheIndex::from_properties(props);
        assert!(!healed);
        assert!(!index.is_dirty());
    }
}
