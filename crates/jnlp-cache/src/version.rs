//! JNLP version ids and version strings.
//!
//! A version id is a sequence of elements separated by `.`, `-` or `_`
//! (`1.4.2_05`). A version string is a space separated list of ranges, where each
//! range is an exact id (`1.4`), a "this or later" id (`1.4+`), a prefix (`1.4*`),
//! or an `&` conjunction of those (`1.4+&1.5*`).

use crate::error::CacheError;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

const SEPARATORS: &[char] = &['.', '-', '_'];

#[derive(Clone, Debug)]
pub struct VersionId {
    raw: String,
    elements: Vec<String>,
}

impl VersionId {
    pub fn parse(value: &str) -> Result<Self, CacheError> {
        let invalid = || CacheError::InvalidVersion {
            value: value.to_owned(),
        };
        if value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '&' | '+' | '*'))
        {
            return Err(invalid());
        }
        let elements: Vec<String> = value.split(SEPARATORS).map(str::to_owned).collect();
        if elements.iter().any(String::is_empty) {
            return Err(invalid());
        }
        Ok(Self {
            raw: value.to_owned(),
            elements,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the first elements of `self` (padded with `0`) equal all elements of
    /// `prefix`.
    pub fn starts_with(&self, prefix: &VersionId) -> bool {
        prefix
            .elements
            .iter()
            .enumerate()
            .all(|(idx, element)| compare_elements(self.element(idx), element) == Ordering::Equal)
    }

    fn element(&self, idx: usize) -> &str {
        self.elements.get(idx).map(String::as_str).unwrap_or("0")
    }

    /// Elements with trailing zero elements removed; `1.0.0` and `1` are equal.
    fn significant(&self) -> &[String] {
        let mut len = self.elements.len();
        while len > 0 && compare_elements(&self.elements[len - 1], "0") == Ordering::Equal {
            len -= 1;
        }
        &self.elements[..len]
    }
}

fn compare_elements(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        // Numeric elements sort below non-numeric ones.
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl Ord for VersionId {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.elements.len().max(other.elements.len());
        (0..len)
            .map(|idx| compare_elements(self.element(idx), other.element(idx)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for VersionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionId {}

impl Hash for VersionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for element in self.significant() {
            match element.parse::<u64>() {
                Ok(number) => number.hash(state),
                Err(_) => element.hash(state),
            }
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SimpleRange {
    Exact(VersionId),
    AtLeast(VersionId),
    Prefix(VersionId),
}

impl SimpleRange {
    fn parse(value: &str) -> Result<Self, CacheError> {
        if let Some(id) = value.strip_suffix('+') {
            Ok(Self::AtLeast(VersionId::parse(id)?))
        } else if let Some(id) = value.strip_suffix('*') {
            Ok(Self::Prefix(VersionId::parse(id)?))
        } else {
            Ok(Self::Exact(VersionId::parse(value)?))
        }
    }

    fn contains(&self, version: &VersionId) -> bool {
        match self {
            Self::Exact(id) => version == id,
            Self::AtLeast(id) => version >= id,
            Self::Prefix(id) => version.starts_with(id),
        }
    }
}

/// A JNLP version string: any of its ranges may match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionString {
    raw: String,
    ranges: Vec<Vec<SimpleRange>>,
}

impl VersionString {
    pub fn parse(value: &str) -> Result<Self, CacheError> {
        let ranges = value
            .split_whitespace()
            .map(|range| range.split('&').map(SimpleRange::parse).collect())
            .collect::<Result<Vec<Vec<_>>, _>>()?;
        if ranges.is_empty() {
            return Err(CacheError::InvalidVersion {
                value: value.to_owned(),
            });
        }
        Ok(Self {
            raw: value.trim().to_owned(),
            ranges,
        })
    }

    pub fn contains(&self, version: &VersionId) -> bool {
        self.ranges
            .iter()
            .any(|conjunction| conjunction.iter().all(|range| range.contains(version)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionString {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&VersionId> for VersionString {
    fn from(id: &VersionId) -> Self {
        Self {
            raw: id.raw.clone(),
            ranges: vec![vec![SimpleRange::Exact(id.clone())]],
        }
    }
}
