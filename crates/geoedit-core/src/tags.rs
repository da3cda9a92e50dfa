//! Key/value tags attached to every primitive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A tag map. Keys are unique; equality ignores insertion order.
///
/// Backed by a `BTreeMap` so serialized snapshots are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

/// A single tag edit. `value: None` removes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChange {
    pub key: String,
    pub value: Option<String>,
}

impl TagChange {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagChange {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        TagChange {
            key: key.into(),
            value: None,
        }
    }
}

impl Tags {
    pub fn new() -> Self {
        Tags(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Inserts or overwrites a tag, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies a list of changes in order. Returns `true` if anything changed.
    pub fn apply(&mut self, changes: &[TagChange]) -> bool {
        let mut changed = false;
        for change in changes {
            match &change.value {
                Some(value) => {
                    if self.0.get(&change.key) != Some(value) {
                        self.0.insert(change.key.clone(), value.clone());
                        changed = true;
                    }
                }
                None => {
                    changed |= self.0.remove(&change.key).is_some();
                }
            }
        }
        changed
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
