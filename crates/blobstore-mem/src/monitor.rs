//! Usage Monitor: aggregate counts and sizes of live backends per kind.
//!
//! Backends hold an `Arc<LiveStats>` and keep its length current; the monitor
//! only keeps `Weak` references, so it never extends a backend's lifetime.
//! Registrations whose backend is gone are pruned on the next tick.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use blobstore_core::BackendKind;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Length reported by one live backend.
#[derive(Debug)]
pub struct LiveStats {
    kind: BackendKind,
    identity: u64,
    length: AtomicU64,
}

impl LiveStats {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    pub fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Registration {
    stats: Weak<LiveStats>,
    registered_at: Instant,
}

/// Totals for one backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindUsage {
    pub instances: usize,
    pub total_length: u64,
    pub oldest: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub by_kind: BTreeMap<BackendKind, KindUsage>,
    pub pruned: usize,
}

impl UsageSummary {
    pub fn instances(&self, kind: BackendKind) -> usize {
        self.by_kind.get(&kind).map_or(0, |u| u.instances)
    }

    pub fn total_length(&self, kind: BackendKind) -> u64 {
        self.by_kind.get(&kind).map_or(0, |u| u.total_length)
    }
}

#[derive(Debug, Default)]
pub struct UsageMonitor {
    registrations: Mutex<Vec<Registration>>,
}

impl UsageMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new live backend of `kind` and return its stats cell.
    pub fn track(&self, kind: BackendKind) -> Arc<LiveStats> {
        let stats = Arc::new(LiveStats {
            kind,
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            length: AtomicU64::new(0),
        });
        self.registrations.lock().push(Registration {
            stats: Arc::downgrade(&stats),
            registered_at: Instant::now(),
        });
        stats
    }

    pub fn registered(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Aggregate live registrations without logging.
    pub fn snapshot(&self) -> UsageSummary {
        let now = Instant::now();
        let mut summary = UsageSummary::default();
        self.registrations.lock().retain(|reg| match reg.stats.upgrade() {
            Some(stats) => {
                let usage = summary.by_kind.entry(stats.kind()).or_default();
                usage.instances += 1;
                usage.total_length = usage.total_length.saturating_add(stats.length());
                usage.oldest = usage.oldest.max(now.duration_since(reg.registered_at));
                true
            }
            None => {
                summary.pruned += 1;
                false
            }
        });
        summary
    }

    /// One periodic pass: aggregate, log, prune.
    pub fn tick(&self) -> UsageSummary {
        let summary = self.snapshot();
        for (kind, usage) in &summary.by_kind {
            info!(
                %kind,
                instances = usage.instances,
                total_length = usage.total_length,
                oldest_secs = usage.oldest.as_secs(),
                "live blob usage"
            );
        }
        if summary.by_kind.is_empty() {
            info!(pruned = summary.pruned, "no live monitored blobs");
        }
        summary
    }
}

static GLOBAL: Lazy<UsageMonitor> = Lazy::new(UsageMonitor::new);

/// Process-wide monitor used by the resource-bearing backends.
pub fn global() -> &'static UsageMonitor {
    &GLOBAL
}
