//! Reclamation of external resources (native memory, temp files).
//!
//! A backend registers its resource at construction and keeps the returned
//! [`ReclaimHandle`]. Dropping the handle abandons the registration. With no
//! reaper running the resource is released right there on the dropping
//! thread; while a reaper runs, the release is queued and the reaper thread
//! (or an explicit [`Reclaimer::reap_ready`]) performs it.
//! [`Reclaimer::shutdown_sweep`] force-releases whatever is still pending at
//! process exit.
//!
//! Whoever removes a registration from the pending map is the one that
//! releases it, so each resource is released exactly once no matter how the
//! reaper and the sweep interleave.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use blobstore_core::{Error, Result};

/// An external resource that must be released exactly once.
pub trait Reclaim: Send + Sync + 'static {
    /// Release the resource. Failures are logged by the caller, never retried.
    fn release(&self) -> Result<()>;

    /// Short human-readable label for logs (a path, a byte count).
    fn describe(&self) -> String;
}

trait Abandon: Send + Sync {
    fn abandon(&self, id: u64);
}

struct Shared<R: Reclaim> {
    name: &'static str,
    next_id: AtomicU64,
    pending: DashMap<u64, Arc<R>>,
    abandoned: SegQueue<u64>,
    released: AtomicU64,
    reaper: Mutex<Option<Thread>>,
    stopping: AtomicBool,
}

impl<R: Reclaim> Shared<R> {
    fn release_entry(&self, id: u64, resource: Arc<R>, path: &'static str) {
        match resource.release() {
            Ok(()) => {
                self.released.fetch_add(1, Ordering::AcqRel);
                debug!(reclaimer = self.name, id, via = path, what = %resource.describe(), "released");
            }
            Err(e) => {
                // Still counts as consumed: nothing further can be done.
                self.released.fetch_add(1, Ordering::AcqRel);
                warn!(reclaimer = self.name, id, via = path, what = %resource.describe(), error = %e, "release failed");
            }
        }
    }

    fn drain(&self) -> usize {
        let mut n = 0;
        while let Some(id) = self.abandoned.pop() {
            if let Some((id, resource)) = self.pending.remove(&id) {
                self.release_entry(id, resource, "reaper");
                n += 1;
            }
        }
        n
    }
}

impl<R: Reclaim> Abandon for Shared<R> {
    fn abandon(&self, id: u64) {
        {
            // Queue under the lock so a stopping reaper's final drain sees it.
            let reaper = self.reaper.lock();
            if let Some(reaper) = reaper.as_ref() {
                self.abandoned.push(id);
                reaper.unpark();
                return;
            }
        }
        if let Some((id, resource)) = self.pending.remove(&id) {
            self.release_entry(id, resource, "drop");
        }
    }
}

/// Per-resource-kind registry of pending releases.
pub struct Reclaimer<R: Reclaim> {
    shared: Arc<Shared<R>>,
}

impl<R: Reclaim> Clone for Reclaimer<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Reclaim> fmt::Debug for Reclaimer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimer")
            .field("name", &self.shared.name)
            .field("pending", &self.pending_count())
            .field("released", &self.released_count())
            .finish()
    }
}

impl<R: Reclaim> Reclaimer<R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                abandoned: SegQueue::new(),
                released: AtomicU64::new(0),
                reaper: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Track `resource` until its handle is dropped or the sweep runs.
    pub fn register(&self, resource: Arc<R>) -> ReclaimHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::AcqRel);
        self.shared.pending.insert(id, resource);
        let sink: Arc<dyn Abandon> = self.shared.clone();
        ReclaimHandle { id, sink }
    }

    /// Release everything abandoned so far. Returns the number released.
    pub fn reap_ready(&self) -> usize {
        self.shared.drain()
    }

    /// Force-release every registration still pending, abandoned or not.
    pub fn shutdown_sweep(&self) -> usize {
        let ids: Vec<u64> = self.shared.pending.iter().map(|e| *e.key()).collect();
        let mut n = 0;
        for id in ids {
            if let Some((id, resource)) = self.shared.pending.remove(&id) {
                self.shared.release_entry(id, resource, "shutdown sweep");
                n += 1;
            }
        }
        if n > 0 {
            info!(reclaimer = self.shared.name, released = n, "shutdown sweep");
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn released_count(&self) -> u64 {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Start the background reaper. It wakes whenever a handle is dropped and
    /// at least every `poll`.
    pub fn spawn_reaper(&self, poll: Duration) -> Result<ReaperHandle> {
        let mut slot = self.shared.reaper.lock();
        if slot.is_some() {
            return Err(Error::Config(format!(
                "reaper for {} is already running",
                self.shared.name
            )));
        }
        self.shared.stopping.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let join = thread::Builder::new()
            .name(format!("{}-reaper", self.shared.name))
            .spawn(move || {
                while !shared.stopping.load(Ordering::Acquire) {
                    shared.drain();
                    thread::park_timeout(poll);
                }
                shared.drain();
            })
            .map_err(|e| Error::io("spawn reaper thread", e))?;

        *slot = Some(join.thread().clone());
        debug!(reclaimer = self.shared.name, ?poll, "reaper started");

        let stopper: Arc<dyn StopReaper> = self.shared.clone();
        Ok(ReaperHandle {
            join: Some(join),
            stopper,
        })
    }
}

trait StopReaper: Send + Sync {
    fn stop(&self);
}

impl<R: Reclaim> StopReaper for Shared<R> {
    fn stop(&self) {
        // Detach first: later drops release inline, earlier ones are drained.
        let reaper = self.reaper.lock().take();
        self.stopping.store(true, Ordering::Release);
        if let Some(reaper) = reaper {
            reaper.unpark();
        }
    }
}

/// Keeps a reaper thread running; dropping it stops and joins the thread.
pub struct ReaperHandle {
    join: Option<JoinHandle<()>>,
    stopper: Arc<dyn StopReaper>,
}

impl ReaperHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stopper.stop();
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| Error::Config("reaper thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "reaper shutdown failed");
        }
    }
}

impl fmt::Debug for ReaperHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaperHandle")
            .field("running", &self.join.is_some())
            .finish()
    }
}

/// Registration token held by a live backend. Dropping it abandons the
/// registration: released immediately, or handed to the running reaper.
pub struct ReclaimHandle {
    id: u64,
    sink: Arc<dyn Abandon>,
}

impl ReclaimHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ReclaimHandle {
    fn drop(&mut self) {
        self.sink.abandon(self.id);
    }
}

impl fmt::Debug for ReclaimHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimHandle").field("id", &self.id).finish()
    }
}
