//! Collection types for path lookups
//!
//! Hash collections switch between gxhash and std depending on the `gxhash`
//! feature, so the crate builds on CPUs without AES-NI/SSE2 while staying fast
//! where those are available.
//!
//! Relative paths compare case-insensitively throughout the index, so every
//! path-keyed map uses [`PathKey`] rather than a raw `String`.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap as GxHashMap, HashMapExt, HashSet as GxHashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

/// HashMap that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = GxHashMap<K, V>;

/// HashMap that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = StdHashMap<K, V>;

/// HashSet that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = GxHashSet<T>;

/// HashSet that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = StdHashSet<T>;

/// Constructors matching gxhash's extension traits
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates a new HashMap
    fn new() -> Self;
    /// Creates a new HashMap with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for StdHashMap<K, V> {
    fn new() -> Self {
        StdHashMap::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        StdHashMap::with_capacity(capacity)
    }
}

/// Constructors matching gxhash's extension traits
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates a new HashSet
    fn new() -> Self;
    /// Creates a new HashSet with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for StdHashSet<T> {
    fn new() -> Self {
        StdHashSet::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        StdHashSet::with_capacity(capacity)
    }
}

/// Case-insensitive key for a canonical relative path
///
/// Two keys are equal when their paths differ only in letter case, matching
/// how the index treats `/Photos/A.JPG` and `/photos/a.jpg` as one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    /// Build a key from a canonical relative path
    pub fn new(relative_path: &str) -> Self {
        PathKey(relative_path.to_lowercase())
    }

    /// The folded form used for comparison
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this path lies at or below `prefix` (also folded)
    pub fn is_under(&self, prefix: &PathKey) -> bool {
        match self.0.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.0.ends_with('/'),
            None => false,
        }
    }
}

impl From<&str> for PathKey {
    fn from(path: &str) -> Self {
        PathKey::new(path)
    }
}
