//! Ordered label sets.
//!
//! Storage is a sorted map so iteration, hashing and rendering are deterministic
//! regardless of insertion order.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::RESERVED_LABEL_PREFIX;

const SEP: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("invalid label name {0:?}")]
    InvalidName(String),
    #[error("missing required label {0:?}")]
    Missing(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Value of `name`, or "" when absent (matching Prometheus semantics).
    pub fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn has(&self, name: &str) -> bool { self.0.contains_key(name) }

    /// Sets `name` to `value`. An empty value deletes the label.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let (name, value) = (name.into(), value.into());
        if value.is_empty() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> { self.0.remove(name) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }

    pub fn retain(&mut self, mut f: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|k, v| f(k, v));
    }

    /// Copy without any label whose name starts with `prefix`.
    pub fn without_prefix(&self, prefix: &str) -> Self {
        let mut out = self.clone();
        out.retain(|k, _| !k.starts_with(prefix));
        out
    }

    /// Copy without internal (`__`-prefixed) labels.
    pub fn without_internal(&self) -> Self { self.without_prefix(RESERVED_LABEL_PREFIX) }

    pub fn to_map(&self) -> BTreeMap<String, String> { self.0.clone() }

    /// Content hash; independent of the order labels were inserted in.
    pub fn hash(&self) -> u64 {
        let mut h = FnvHasher::default();
        for (k, v) in &self.0 {
            h.write(k.as_bytes());
            h.write(&[SEP]);
            h.write(v.as_bytes());
            h.write(&[SEP]);
        }
        h.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (k, v) in iter { out.set(k, v); }
        out
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(m: BTreeMap<String, String>) -> Self { m.into_iter().collect() }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 { f.write_str(", ")?; }
            write!(f, "{}=\"", k)?;
            for c in v.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{}", c)?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace every character not valid in a label name with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}
