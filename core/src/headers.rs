//! Case-insensitive, insertion-ordered header multimap.
//!
//! # Design
//! Names are matched with ASCII case folding but stored with the case they
//! were first seen in. Lookups go through [`Caseless`], a borrowed key type
//! whose `Hash`/`Eq` fold case byte by byte, so `get("content-type")` never
//! allocates a lowercase copy.
//!
//! Entries live in a `Vec` in first-seen order; the hash index maps a name to
//! its slot. Removing a name leaves a tombstone so other slots keep their
//! positions, and the vector is compacted once tombstones dominate.
//!
//! A name with one value stores it inline. Only a second value promotes the
//! entry to a growable `Vec`, which keeps the common single-valued header
//! allocation-free beyond its strings.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A header name compared and hashed without regard to ASCII case.
#[derive(Debug)]
#[repr(transparent)]
pub struct Caseless(str);

impl Caseless {
    pub fn new(name: &str) -> &Caseless {
        // SAFETY: `Caseless` is `repr(transparent)` over `str`, so the two
        // references have identical layout and metadata.
        unsafe { &*(name as *const str as *const Caseless) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Caseless {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Caseless {}

impl Hash for Caseless {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        // Length terminator, mirrors `str`'s own Hash impl.
        state.write_u8(0xff);
    }
}

/// Owned index key. Delegates `Hash`/`Eq` to [`Caseless`] so `Borrow` is sound.
#[derive(Debug, Clone)]
struct HeaderKey(Box<str>);

impl Borrow<Caseless> for HeaderKey {
    fn borrow(&self) -> &Caseless {
        Caseless::new(&self.0)
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        Caseless::new(&self.0) == Caseless::new(&other.0)
    }
}

impl Eq for HeaderKey {}

impl Hash for HeaderKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Caseless::new(&self.0).hash(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Values {
    One(String),
    Many(Vec<String>),
}

impl Values {
    fn as_slice(&self) -> &[String] {
        match self {
            Values::One(value) => std::slice::from_ref(value),
            Values::Many(values) => values,
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Values::Many(values) => values.push(value),
            Values::One(first) => {
                let first = std::mem::take(first);
                *self = Values::Many(vec![first, value]);
            }
        }
    }
}

/// One header name with its values in addition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    name: String,
    values: Values,
}

impl HeaderEntry {
    /// The name as it was first recorded.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        self.values.as_slice()
    }

    /// The first recorded value.
    pub fn first(&self) -> &str {
        &self.values.as_slice()[0]
    }
}

/// Ordered, case-insensitive, duplicate-preserving header store.
#[derive(Clone, Default)]
pub struct HeaderMap {
    slots: Vec<Option<HeaderEntry>>,
    index: HashMap<HeaderKey, usize>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Replace every value of `name` with `value`. `None` removes the name.
    ///
    /// An existing name keeps its position and its originally stored case.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let Some(value) = value else {
            self.remove(name);
            return;
        };
        match self.index.get(Caseless::new(name)) {
            Some(&slot) => {
                if let Some(entry) = self.slots[slot].as_mut() {
                    entry.values = Values::One(value.to_string());
                }
            }
            None => self.insert_new(name, Values::One(value.to_string())),
        }
    }

    /// Add `value` after the existing values of `name`. A new name goes to
    /// the end of the iteration order.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.index.get(Caseless::new(name)) {
            Some(&slot) => {
                if let Some(entry) = self.slots[slot].as_mut() {
                    entry.values.push(value.to_string());
                }
            }
            None => self.insert_new(name, Values::One(value.to_string())),
        }
    }

    /// Remove every value recorded for `name`. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(slot) = self.index.remove(Caseless::new(name)) else {
            return false;
        };
        self.slots[slot] = None;
        if self.slots.len() >= 8 && self.index.len() * 2 < self.slots.len() {
            self.compact();
        }
        true
    }

    /// First value recorded for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name).map(HeaderEntry::first)
    }

    /// All values recorded for `name` in addition order; empty when absent.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entry(name).map(HeaderEntry::values).unwrap_or(&[])
    }

    pub fn entry(&self, name: &str) -> Option<&HeaderEntry> {
        let slot = *self.index.get(Caseless::new(name))?;
        self.slots[slot].as_ref()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.index.contains_key(Caseless::new(name))
    }

    /// Entries in the order their names were first introduced.
    pub fn entries(&self) -> impl Iterator<Item = &HeaderEntry> + '_ {
        self.slots.iter().flatten()
    }

    /// `(name, value)` pairs, names in first-seen order, values grouped.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries()
            .flat_map(|e| e.values().iter().map(move |v| (e.name(), v.as_str())))
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    fn insert_new(&mut self, name: &str, values: Values) {
        let slot = self.slots.len();
        self.slots.push(Some(HeaderEntry {
            name: name.to_string(),
            values,
        }));
        self.index.insert(HeaderKey(name.into()), slot);
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                if let Some(position) = self.index.get_mut(Caseless::new(&entry.name)) {
                    *position = slot;
                }
            }
        }
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries().map(|e| (e.name(), e.values())))
            .finish()
    }
}

impl PartialEq for HeaderMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.entries().eq(other.entries())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut map = HeaderMap::with_capacity(iter.size_hint().0);
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}
