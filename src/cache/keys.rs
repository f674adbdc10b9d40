//! Cache key fingerprints.
//!
//! A fingerprint is `P ("|" tag "|" rev)* ("|" k ":" v)*`: the request
//! component, every declared dependency with its current revision in declared
//! order, then the metadata pairs in lexicographic key order.

use std::collections::BTreeMap;
use std::fmt;

use super::ledger::RevisionLedger;

/// A built cache key together with the revisions it was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: String,
    dependencies: Vec<String>,
    revisions: Vec<u64>,
}

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Revisions observed for [`dependencies`](Self::dependencies), index for index.
    pub fn revisions(&self) -> &[u64] {
        &self.revisions
    }

    pub fn into_key(self) -> String {
        self.key
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Build the fingerprint for `path` against the current ledger state.
pub fn build_cache_key(
    ledger: &RevisionLedger,
    path: &str,
    dependencies: &[String],
    metadata: &BTreeMap<String, String>,
) -> Fingerprint {
    let revisions = ledger.snapshot(dependencies);
    let key = compose(path, dependencies, &revisions, metadata);
    Fingerprint {
        key,
        dependencies: dependencies.to_vec(),
        revisions,
    }
}

fn compose(
    path: &str,
    dependencies: &[String],
    revisions: &[u64],
    metadata: &BTreeMap<String, String>,
) -> String {
    let tags_len: usize = dependencies.iter().map(|tag| tag.len() + 22).sum();
    let meta_len: usize = metadata.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let mut key = String::with_capacity(path.len() + tags_len + meta_len);

    key.push_str(path);
    for (tag, revision) in dependencies.iter().zip(revisions) {
        key.push('|');
        key.push_str(tag);
        key.push('|');
        key.push_str(&revision.to_string());
    }
    for (name, value) in metadata {
        key.push('|');
        key.push_str(name);
        key.push(':');
        key.push_str(value);
    }
    key
}
