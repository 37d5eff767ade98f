//! Ordered, multi-valued key/value bag carried beside a transit.
//!
//! The set is a persistent (structurally shared) list: adding an entry
//! returns a new set and leaves every earlier snapshot untouched, so a set
//! captured for transmission can never observe later writes.

use std::sync::Arc;

use serde_json::Value;

/// One shipment entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Shipment {
    pub key: String,
    pub value: Value,
}

#[derive(Debug)]
struct Node {
    entry: Shipment,
    next: Option<Arc<Node>>,
}

impl Drop for Node {
    // Unlink iteratively; the derived drop recurses once per entry.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// An immutable snapshot of shipments.
///
/// Enumeration is most-recently-added first. Repeated keys are retained.
#[derive(Debug, Clone, Default)]
pub struct Shipments {
    head: Option<Arc<Node>>,
    len: usize,
}

impl Shipments {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new set with `key = value` added on top.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            head: Some(Arc::new(Node {
                entry: Shipment {
                    key: key.into(),
                    value: value.into(),
                },
                next: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Most recent value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.iter().find(|s| s.key == key).map(|s| &s.value)
    }

    /// Every value stored under `key`, most recent first.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.iter().filter(move |s| s.key == key).map(|s| &s.value)
    }

    /// Enumerate entries, most recent first.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// Visit entries most recent first until `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&str, &Value) -> bool) {
        for s in self.iter() {
            if !f(&s.key, &s.value) {
                break;
            }
        }
    }

    /// Number of entries (writes), including repeated keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entries in write order (oldest first). Replaying them through
    /// [`Shipments::with`] rebuilds an identical set.
    pub fn to_write_order(&self) -> Vec<Shipment> {
        let mut entries: Vec<Shipment> = self.iter().cloned().collect();
        entries.reverse();
        entries
    }

    /// Rebuild a set from entries in write order.
    pub fn from_write_order(entries: impl IntoIterator<Item = Shipment>) -> Self {
        entries
            .into_iter()
            .fold(Self::new(), |acc, s| acc.with(s.key, s.value))
    }
}

/// Iterator over a [`Shipments`] snapshot.
pub struct Iter<'a> {
    next: Option<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Shipment;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.entry)
    }
}

impl<'a> IntoIterator for &'a Shipments {
    type Item = &'a Shipment;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
