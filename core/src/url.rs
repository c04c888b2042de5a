//! In-place editable URL buffer.
//!
//! Redirects rewrite the target URL after every hop; [`UrlBuf::rewrite`]
//! reuses the existing allocation whenever the new URL fits. No validation
//! or encoding happens here, the engine rejects malformed URLs at configure
//! time.

use std::fmt;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct UrlBuf {
    buf: String,
}

impl UrlBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Replace the contents, keeping the backing buffer when it is large enough.
    pub fn rewrite(&mut self, url: &str) {
        self.buf.clear();
        self.buf.push_str(url);
    }

    pub fn push_str(&mut self, part: &str) {
        self.buf.push_str(part);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// The scheme before `://`, if any.
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.buf.split_once("://")?;
        let valid = !scheme.is_empty()
            && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some(scheme)
    }
}

impl From<&str> for UrlBuf {
    fn from(url: &str) -> Self {
        Self {
            buf: url.to_string(),
        }
    }
}

impl fmt::Display for UrlBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

impl fmt::Debug for UrlBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.buf, f)
    }
}
