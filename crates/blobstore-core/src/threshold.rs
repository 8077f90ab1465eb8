//! Ascending size-to-backend mapping used to pick and migrate backends.

use std::fmt;

use crate::config::ThresholdEntry;
use crate::error::{Error, Result};
use crate::kind::BackendKind;

/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdTable {
    entries: Vec<ThresholdEntry>,
}

impl ThresholdTable {
    /// Sort entries by max size. When two entries share a max size the first
    /// one given wins.
    pub fn new(entries: impl IntoIterator<Item = ThresholdEntry>) -> Result<Self> {
        let mut entries: Vec<ThresholdEntry> = entries.into_iter().collect();
        if entries.is_empty() {
            return Err(Error::Config("threshold table is empty".into()));
        }
        entries.sort_by_key(|e| e.max_size);
        entries.dedup_by_key(|e| e.max_size);
        Ok(Self { entries })
    }

    /// Single unbounded entry.
    pub fn catch_all(kind: BackendKind) -> Self {
        Self {
            entries: vec![ThresholdEntry::new(kind, u64::MAX)],
        }
    }

    /// Backend for the smallest max that is >= `size`.
    pub fn resolve(&self, size: u64) -> Result<BackendKind> {
        self.entries
            .iter()
            .find(|e| e.max_size >= size)
            .map(|e| e.kind)
            .ok_or_else(|| Error::NoBackendForSize {
                size,
                table: self.to_string(),
            })
    }

    pub fn entries(&self) -> &[ThresholdEntry] {
        &self.entries
    }

    /// Largest size any backend accepts.
    pub fn max_size(&self) -> u64 {
        self.entries.last().map(|e| e.max_size).unwrap_or(0)
    }
}

impl fmt::Display for ThresholdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        f.write_str("[")?;
        for e in &self.entries {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            if e.max_size == u64::MAX {
                write!(f, "{} < unbounded", e.kind)?;
            } else {
                write!(f, "{} <= {}", e.kind, e.max_size)?;
            }
        }
        f.write_str("]")
    }
}
