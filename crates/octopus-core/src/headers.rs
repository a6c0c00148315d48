//! Header maps as seen by the filter chain
//!
//! Unlike [`http::HeaderMap`], these maps carry pseudo-headers (`:status`, `:method`,
//! `:path`, `:authority`) inline with regular headers and preserve insertion order,
//! which is what scripts observe when iterating.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// `:status` pseudo-header
pub const STATUS: &str = ":status";
/// `:method` pseudo-header
pub const METHOD: &str = ":method";
/// `:path` pseudo-header
pub const PATH: &str = ":path";
/// `:authority` pseudo-header
pub const AUTHORITY: &str = ":authority";
/// `:scheme` pseudo-header
pub const SCHEME: &str = ":scheme";
/// `content-length` header
pub const CONTENT_LENGTH: &str = "content-length";

/// Header map owned by the proxy and shared with the filter for the life of the stream
pub type SharedHeaderMap = Rc<RefCell<HeaderMap>>;

/// Ordered multi-map of lower-cased header names to values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a header map from name/value pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map = Self::new();
        for (key, value) in pairs {
            map.add(key.as_ref(), value);
        }
        map
    }

    /// Wrap the map so it can be shared between the proxy and a filter
    pub fn into_shared(self) -> SharedHeaderMap {
        Rc::new(RefCell::new(self))
    }

    /// Number of header entries (each value counts once)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a value, keeping any existing values for the same name
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_ascii_lowercase(), value.into()));
    }

    /// Replace all values for `key` with a single value
    ///
    /// The new value takes the position of the first existing entry, or is appended.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || *k != key;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
    }

    /// Remove every value for `key`; returns whether anything was removed
    pub fn remove(&mut self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        before != self.entries.len()
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All values for `key` joined with `,`
    pub fn get_joined(&self, key: &str) -> Option<String> {
        let values = self.get_all(key);
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }

    /// Iterate over entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parsed `:status` value
    pub fn status(&self) -> Option<u16> {
        self.get(STATUS).and_then(|s| s.parse().ok())
    }

    /// `:method` value
    pub fn method(&self) -> Option<&str> {
        self.get(METHOD)
    }

    /// `:path` value
    pub fn path(&self) -> Option<&str> {
        self.get(PATH)
    }

    /// `:authority` value
    pub fn host(&self) -> Option<&str> {
        self.get(AUTHORITY)
    }

    /// Set `content-length`
    pub fn set_content_length(&mut self, length: usize) {
        self.set(CONTENT_LENGTH, length.to_string());
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}
