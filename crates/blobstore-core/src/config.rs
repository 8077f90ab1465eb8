//! Payload configuration that downstream crates can serialize/deserialize.
//!
//! The recognized property keys are:
//! - `payload.containerCount`, `payload.container.N.class`, `payload.container.N.maxSize`
//! - `payload.maxArrayLength`, `payload.warnArrayLength`
//! - `payload.diskContainer.keepCache`, `payload.diskContainer.tempFilePath`,
//!   `payload.diskContainer.cacheCapacity`
//! - `payload.monitor.intervalSeconds`, `payload.reaper.pollMillis`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::kind::BackendKind;
use crate::threshold::ThresholdTable;

/// Largest materialization the platform can address in one contiguous buffer.
pub const ADDRESSABLE_LIMIT: u64 = isize::MAX as u64;

/// One (backend kind, inclusive max size) pair of the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdEntry {
    pub kind: BackendKind,
    pub max_size: u64,
}

impl ThresholdEntry {
    pub const fn new(kind: BackendKind, max_size: u64) -> Self {
        Self { kind, max_size }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Keep a best-effort in-memory copy of each disk blob.
    pub keep_cache: bool,

    /// Directory for temp files. `${name}` is substituted from the environment.
    pub temp_file_path: String,

    /// Byte budget shared by all disk caches before least-recently-used eviction.
    pub cache_capacity_bytes: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            keep_cache: true,
            temp_file_path: "${tmpdir}".to_string(),
            cache_capacity_bytes: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

impl DiskConfig {
    /// Resolve `temp_file_path` to a concrete directory.
    pub fn resolved_temp_dir(&self) -> Result<PathBuf> {
        substitute(&self.temp_file_path).map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Backend thresholds, in any order; the table sorts them.
    pub containers: Vec<ThresholdEntry>,

    /// Hard ceiling for `data()` materialization.
    pub max_array_length: u64,

    /// Soft ceiling above which `data()` logs a warning with a call stack.
    pub warn_array_length: u64,

    pub disk: DiskConfig,

    /// Period of the usage monitor summary.
    pub monitor_interval_secs: u64,

    /// How long a reaper sleeps when its queue is empty.
    pub reaper_poll_millis: u64,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            containers: vec![ThresholdEntry::new(BackendKind::Heap, u64::MAX)],
            max_array_length: ADDRESSABLE_LIMIT,
            warn_array_length: ADDRESSABLE_LIMIT,
            disk: DiskConfig::default(),
            monitor_interval_secs: 10,
            reaper_poll_millis: 2_000,
        }
    }
}

impl PayloadConfig {
    /// Build a config from flat `payload.*` properties. Missing keys keep defaults.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();

        let count: usize = parse_key(props, "payload.containerCount")?.unwrap_or(1);
        let mut containers = Vec::with_capacity(count);
        for i in 0..count {
            let kind = match props.get(&format!("payload.container.{i}.class")) {
                Some(name) => BackendKind::from_str(name)?,
                None => BackendKind::Heap,
            };
            let max_size: u64 =
                parse_key(props, &format!("payload.container.{i}.maxSize"))?.unwrap_or(u64::MAX);
            containers.push(ThresholdEntry::new(kind, max_size));
        }
        cfg.containers = containers;

        if let Some(v) = parse_key(props, "payload.maxArrayLength")? {
            cfg.max_array_length = v;
        }
        if let Some(v) = parse_key(props, "payload.warnArrayLength")? {
            cfg.warn_array_length = v;
        }
        if let Some(v) = parse_key(props, "payload.diskContainer.keepCache")? {
            cfg.disk.keep_cache = v;
        }
        if let Some(v) = props.get("payload.diskContainer.tempFilePath") {
            cfg.disk.temp_file_path = v.clone();
        }
        if let Some(v) = parse_key(props, "payload.diskContainer.cacheCapacity")? {
            cfg.disk.cache_capacity_bytes = v;
        }
        if let Some(v) = parse_key(props, "payload.monitor.intervalSeconds")? {
            cfg.monitor_interval_secs = v;
        }
        if let Some(v) = parse_key(props, "payload.reaper.pollMillis")? {
            cfg.reaper_poll_millis = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse `key = value` lines (quotes optional, `#` starts a comment).
    pub fn from_properties_str(text: &str) -> Result<Self> {
        Self::from_properties(&parse_properties(text)?)
    }

    /// Load from a file; `.json`, `.yaml`/`.yml` use serde, anything else is
    /// read as properties.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            _ => Self::from_properties_str(&text)?,
        };
        cfg.validate()?;
        info!(path = %path.display(), table = ?cfg.containers, "payload config loaded");
        Ok(cfg)
    }

    /// Load from a file, falling back to a single catch-all heap entry.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using default");
                Self::default()
            }
        }
    }

    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `BLOBSTORE_CONFIG`: path of a config file loaded first
    /// - `BLOBSTORE_MAX_ARRAY_LENGTH`: hard `data()` ceiling
    /// - `BLOBSTORE_WARN_ARRAY_LENGTH`: `data()` warning threshold
    /// - `BLOBSTORE_DISK_KEEP_CACHE`: `true`/`false`
    /// - `BLOBSTORE_TEMP_DIR`: disk temp directory
    /// - `BLOBSTORE_MONITOR_INTERVAL_SECS`: usage monitor period
    pub fn from_env() -> Self {
        let mut cfg = match std::env::var("BLOBSTORE_CONFIG") {
            Ok(path) => Self::load_or_default(Path::new(&path)),
            Err(_) => Self::default(),
        };

        if let Ok(s) = std::env::var("BLOBSTORE_MAX_ARRAY_LENGTH") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.max_array_length = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBSTORE_WARN_ARRAY_LENGTH") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.warn_array_length = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBSTORE_DISK_KEEP_CACHE") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.disk.keep_cache = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBSTORE_TEMP_DIR") {
            cfg.disk.temp_file_path = s;
        }

        if let Ok(s) = std::env::var("BLOBSTORE_MONITOR_INTERVAL_SECS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.monitor_interval_secs = v;
            }
        }

        cfg
    }

    /// Reject configurations the dispatcher could never use.
    pub fn validate(&self) -> Result<()> {
        if self.containers.is_empty() {
            return Err(Error::Config("threshold table is empty".into()));
        }
        Ok(())
    }

    pub fn threshold_table(&self) -> Result<ThresholdTable> {
        ThresholdTable::new(self.containers.iter().copied())
    }
}

fn parse_key<T: FromStr>(props: &BTreeMap<String, String>, key: &str) -> Result<Option<T>> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

/// Parse a flat properties document into key/value pairs.
pub fn parse_properties(text: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("line {}: expected 'key = value'", lineno + 1)))?;
        let value = value.trim().trim_matches('"');
        out.insert(key.trim().to_string(), value.to_string());
    }
    Ok(out)
}

/// Expand `${name}` references. `tmpdir` and `java.io.tmpdir` resolve to the
/// platform temp directory; other names are read from the environment.
pub fn substitute(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::Config(format!("unterminated substitution in '{raw}'")))?;
        let name = &after[..end];
        let value = match name {
            "tmpdir" | "java.io.tmpdir" => std::env::temp_dir().to_string_lossy().into_owned(),
            _ => std::env::var(name)
                .map_err(|_| Error::Config(format!("cannot resolve '${{{name}}}' in '{raw}'")))?,
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_build_threshold_entries() {
        let cfg = PayloadConfig::from_properties_str(
            r#"
            # three tiers
            payload.containerCount = 3
            payload.container.0.class = "heap"
            payload.container.0.maxSize = 6
            payload.container.1.class = native
            payload.container.1.maxSize = 14
            payload.container.2.class = disk
            payload.maxArrayLength = 750000
            payload.diskContainer.keepCache = false
            "#,
        )
        .unwrap();

        assert_eq!(
            cfg.containers,
            vec![
                ThresholdEntry::new(BackendKind::Heap, 6),
                ThresholdEntry::new(BackendKind::Native, 14),
                ThresholdEntry::new(BackendKind::Disk, u64::MAX),
            ]
        );
        assert_eq!(cfg.max_array_length, 750_000);
        assert_eq!(cfg.warn_array_length, ADDRESSABLE_LIMIT);
        assert!(!cfg.disk.keep_cache);
    }

    #[test]
    fn bad_number_is_config_fault() {
        let err = PayloadConfig::from_properties_str("payload.maxArrayLength = lots").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_storage_fault());
    }

    #[test]
    fn zero_count_is_rejected() {
        let err = PayloadConfig::from_properties_str("payload.containerCount = 0").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn substitution_reads_environment() {
        std::env::set_var("BLOBSTORE_TEST_SUBST_DIR", "/var/blobs");
        assert_eq!(
            substitute("${BLOBSTORE_TEST_SUBST_DIR}/tmp").unwrap(),
            "/var/blobs/tmp"
        );
        let tmp = std::env::temp_dir().to_string_lossy().into_owned();
        assert_eq!(substitute("${java.io.tmpdir}").unwrap(), tmp);
        assert!(substitute("${BLOBSTORE_TEST_SUBST_MISSING}").is_err());
        assert!(substitute("${oops").is_err());
    }

    #[test]
    fn json_round_trip_keeps_defaults() {
        let json = r#"{ "containers": [ { "kind": "disk", "max_size": 10 } ] }"#;
        let cfg: PayloadConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.containers[0].kind, BackendKind::Disk);
        assert!(cfg.disk.keep_cache);
        assert_eq!(cfg.monitor_interval_secs, 10);
    }

    #[test]
    fn load_or_default_falls_back_to_heap() {
        let cfg = PayloadConfig::load_or_default(Path::new("/nonexistent/blobstore.properties"));
        assert_eq!(
            cfg.containers,
            vec![ThresholdEntry::new(BackendKind::Heap, u64::MAX)]
        );
    }
}
