//! Dependency graph.
//!
//! Maps each dependency tag to the set of cache keys that referenced it when
//! they were stored. The reverse direction lives on the entries themselves
//! (`CacheEntry::dependencies`), so unlinking a key costs O(|tags|).

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use smallvec::SmallVec;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::graph";

/// Sets at or below this size stay inline as a vector.
const INLINE_KEYS: usize = 8;

/// Keys under one tag. Most tags are referenced by a handful of keys, so the
/// set starts as an inline vector and is promoted to a hash set once it grows.
#[derive(Debug, Clone)]
enum KeySet {
    Inline(SmallVec<[String; INLINE_KEYS]>),
    Hashed(HashSet<String>),
}

impl Default for KeySet {
    fn default() -> Self {
        Self::Inline(SmallVec::new())
    }
}

impl KeySet {
    fn insert(&mut self, key: &str) {
        match self {
            Self::Inline(keys) => {
                if keys.iter().any(|existing| existing == key) {
                    return;
                }
                if keys.len() < INLINE_KEYS {
                    keys.push(key.to_string());
                    return;
                }
                let mut promoted: HashSet<String> = keys.drain(..).collect();
                promoted.insert(key.to_string());
                *self = Self::Hashed(promoted);
            }
            Self::Hashed(keys) => {
                if !keys.contains(key) {
                    keys.insert(key.to_string());
                }
            }
        }
    }

    fn remove(&mut self, key: &str) {
        match self {
            Self::Inline(keys) => keys.retain(|existing| existing != key),
            Self::Hashed(keys) => {
                keys.remove(key);
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        match self {
            Self::Inline(keys) => keys.iter().any(|existing| existing == key),
            Self::Hashed(keys) => keys.contains(key),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Inline(keys) => keys.len(),
            Self::Hashed(keys) => keys.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            Self::Inline(keys) => keys.into_vec(),
            Self::Hashed(keys) => keys.into_iter().collect(),
        }
    }

    fn to_vec(&self) -> Vec<String> {
        self.clone().into_vec()
    }
}

/// Tag → keys index. Empty tag sets are removed eagerly.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    tags: RwLock<HashMap<String, KeySet>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` under every tag in `tags`. Repeated tags and keys are deduplicated.
    pub fn register<S: AsRef<str>>(&self, key: &str, tags: &[S]) {
        let mut graph = rw_write(&self.tags, SOURCE, "register");
        link(&mut graph, key, tags);
    }

    /// Like [`register`](Self::register), but only when `admit` agrees.
    ///
    /// `admit` runs while the graph write lock is held, so no drain can
    /// interleave between the decision and the registration.
    pub(crate) fn register_if<S, F>(&self, key: &str, tags: &[S], admit: F) -> bool
    where
        S: AsRef<str>,
        F: FnOnce() -> bool,
    {
        let mut graph = rw_write(&self.tags, SOURCE, "register_if");
        if !admit() {
            return false;
        }
        link(&mut graph, key, tags);
        true
    }

    /// Remove and return every key registered under `tag`.
    ///
    /// Unknown tags yield an empty list.
    pub fn drain(&self, tag: &str) -> Vec<String> {
        rw_write(&self.tags, SOURCE, "drain")
            .remove(tag)
            .map(KeySet::into_vec)
            .unwrap_or_default()
    }

    /// Remove `key` from every tag in `tags`, dropping tags left empty.
    pub fn unlink<S: AsRef<str>>(&self, key: &str, tags: &[S]) {
        if tags.is_empty() {
            return;
        }
        let mut graph = rw_write(&self.tags, SOURCE, "unlink");
        for tag in tags {
            let tag = tag.as_ref();
            let now_empty = match graph.get_mut(tag) {
                Some(keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                graph.remove(tag);
            }
        }
    }

    pub fn contains(&self, tag: &str, key: &str) -> bool {
        rw_read(&self.tags, SOURCE, "contains")
            .get(tag)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Keys currently registered under `tag`.
    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        rw_read(&self.tags, SOURCE, "keys_for")
            .get(tag)
            .map(KeySet::to_vec)
            .unwrap_or_default()
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.tags, SOURCE, "tag_count").len()
    }

    pub(crate) fn clear(&self) {
        rw_write(&self.tags, SOURCE, "clear").clear();
    }
}

fn link<S: AsRef<str>>(graph: &mut HashMap<String, KeySet>, key: &str, tags: &[S]) {
    for tag in tags {
        graph.entry(tag.as_ref().to_string()).or_default().insert(key);
    }
}
