//! Backslash-delimited key/value blobs (`\name\Player\rate\25000`).
//!
//! Clients describe themselves with one of these ("userinfo") and the server
//! publishes its own settings the same way. Keys are matched case-insensitively.

use crate::MAX_INFO_STRING;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoError {
    #[error("illegal character in info key or value")]
    IllegalCharacter,

    #[error("info string exceeds {0} bytes")]
    Overflow(usize),
}

/// Returns true if `raw` is acceptable as an info blob
pub fn validate(raw: &str) -> bool {
    raw.len() < MAX_INFO_STRING && !raw.contains('"') && !raw.contains(';')
}

fn illegal(text: &str) -> bool {
    text.contains('\\') || text.contains(';') || text.contains('"')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoString {
    raw: String,
    max_len: usize,
}

impl InfoString {
    pub fn new() -> Self {
        Self {
            raw: String::new(),
            max_len: MAX_INFO_STRING,
        }
    }

    /// Wraps a received blob after validating it
    pub fn parse(raw: &str) -> Result<Self, InfoError> {
        if raw.len() >= MAX_INFO_STRING {
            return Err(InfoError::Overflow(MAX_INFO_STRING));
        }
        if !validate(raw) {
            return Err(InfoError::IllegalCharacter);
        }
        Ok(Self {
            raw: raw.to_string(),
            max_len: MAX_INFO_STRING,
        })
    }

    /// Blob with a non-default size limit, used for the larger server-side strings
    pub fn with_limit(max_len: usize) -> Self {
        Self {
            raw: String::new(),
            max_len,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn clear(&mut self) {
        self.raw.clear();
    }

    /// Iterates over `(key, value)` pairs in blob order
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut parts = self.raw.split('\\');
        // Leading separator yields an empty first element
        if self.raw.starts_with('\\') {
            parts.next();
        }
        let mut out = Vec::new();
        while let Some(key) = parts.next() {
            let value = parts.next().unwrap_or("");
            out.push((key, value));
        }
        out.into_iter()
    }

    /// Value for `key`, or an empty string when absent
    pub fn get(&self, key: &str) -> &str {
        self.pairs()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .unwrap_or("")
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    pub fn remove(&mut self, key: &str) {
        let kept: String = self
            .pairs()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(key))
            .map(|(k, v)| format!("\\{}\\{}", k, v))
            .collect();
        self.raw = kept;
    }

    /// Sets `key` to `value`, replacing any previous value.
    ///
    /// An empty value removes the key. On error the blob is left unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), InfoError> {
        if illegal(key) || illegal(value) {
            return Err(InfoError::IllegalCharacter);
        }

        let mut next = self.clone();
        next.remove(key);
        if !value.is_empty() {
            next.raw.push('\\');
            next.raw.push_str(key);
            next.raw.push('\\');
            next.raw.push_str(value);
        }
        if next.raw.len() >= self.max_len {
            return Err(InfoError::Overflow(self.max_len));
        }
        *self = next;
        Ok(())
    }
}

impl Default for InfoString {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InfoString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
