//! Closed set of storage backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One concrete storage strategy. The threshold table is keyed on this enum
/// rather than on type names, and the dispatcher's factory maps each variant
/// to a constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single contiguous heap buffer.
    Heap,
    /// Sequence of fixed-size heap chunks.
    Chunked,
    /// Manually managed off-heap allocation.
    Native,
    /// Temp-file backed store.
    Disk,
    /// Adapter over an older container contract.
    Legacy,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendKind::Heap => "heap",
            BackendKind::Chunked => "chunked",
            BackendKind::Native => "native",
            BackendKind::Disk => "disk",
            BackendKind::Legacy => "legacy",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heap" | "memory" => Ok(BackendKind::Heap),
            "chunked" | "concatenated" => Ok(BackendKind::Chunked),
            "native" | "offheap" | "off_heap" => Ok(BackendKind::Native),
            "disk" | "file" => Ok(BackendKind::Disk),
            "legacy" => Ok(BackendKind::Legacy),
            other => Err(Error::Config(format!("unknown backend kind '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("Heap".parse::<BackendKind>().unwrap(), BackendKind::Heap);
        assert_eq!("offheap".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" DISK ".parse::<BackendKind>().unwrap(), BackendKind::Disk);
        assert!("tape".parse::<BackendKind>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&BackendKind::Chunked).unwrap();
        assert_eq!(json, "\"chunked\"");
    }
}
