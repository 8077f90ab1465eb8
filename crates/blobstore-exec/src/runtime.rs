//! Host integration: shutdown hooks and periodic tasks.
//!
//! The store never schedules its own background work ad hoc. A [`Host`] owns
//! the shutdown path and the periodic loop, and [`install`] wires the
//! reclamation reapers, their shutdown sweeps and the usage monitor into it.
//! [`ThreadHost`] is the stock host built on named OS threads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use blobstore_core::{Error, PayloadConfig, Result};
use blobstore_io::disk::{self, DiskFile};
use blobstore_mem::monitor::{self, UsageMonitor};
use blobstore_mem::native::{self, NativeSlot};
use blobstore_mem::{Reclaim, Reclaimer};

pub type ShutdownHook = Box<dyn FnOnce() + Send>;
pub type PeriodicTask = Box<dyn Fn() + Send + Sync>;

/// Registration points the hosting process exposes to the store.
pub trait Host: Send + Sync {
    /// Run `hook` once when the host shuts down. Hooks run in reverse
    /// registration order.
    fn on_shutdown(&self, name: &'static str, hook: ShutdownHook);

    /// Run `task` every `every` until the host shuts down.
    fn schedule_periodic(
        &self,
        name: &'static str,
        every: Duration,
        task: PeriodicTask,
    ) -> Result<()>;
}

struct Periodic {
    name: &'static str,
    join: JoinHandle<()>,
}

/// Host backed by one named thread per periodic task.
pub struct ThreadHost {
    hooks: Mutex<Vec<(&'static str, ShutdownHook)>>,
    tasks: Mutex<Vec<Periodic>>,
    stopping: Arc<AtomicBool>,
}

impl ThreadHost {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop periodic tasks, then run shutdown hooks last-registered first.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.join.thread().unpark();
        }
        for task in tasks {
            if task.join.join().is_err() {
                warn!(task = task.name, "periodic task panicked");
            }
        }

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (name, hook) in hooks.into_iter().rev() {
            debug!(hook = name, "running shutdown hook");
            hook();
        }
    }
}

impl Default for ThreadHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ThreadHost {
    fn on_shutdown(&self, name: &'static str, hook: ShutdownHook) {
        if self.is_shut_down() {
            debug!(hook = name, "host already shut down; running hook now");
            hook();
            return;
        }
        self.hooks.lock().push((name, hook));
    }

    fn schedule_periodic(
        &self,
        name: &'static str,
        every: Duration,
        task: PeriodicTask,
    ) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Config(format!(
                "cannot schedule {name}: host is shut down"
            )));
        }
        if every.is_zero() {
            return Err(Error::Config(format!("period for {name} must be non-zero")));
        }

        let stopping = Arc::clone(&self.stopping);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now() + every;
                while !stopping.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= next {
                        task();
                        next = now + every;
                    } else {
                        thread::park_timeout(next - now);
                    }
                }
            })
            .map_err(|e| Error::io("spawn periodic task", e))?;

        debug!(task = name, ?every, "periodic task scheduled");
        self.tasks.lock().push(Periodic { name, join });
        Ok(())
    }
}

impl Drop for ThreadHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHost")
            .field("hooks", &self.hooks.lock().len())
            .field("tasks", &self.tasks.lock().len())
            .field("stopping", &self.is_shut_down())
            .finish()
    }
}

/// Process-wide pieces that [`install`] hooks into a host.
#[derive(Debug, Clone)]
pub struct Components {
    pub native: Reclaimer<NativeSlot>,
    pub disk: Reclaimer<DiskFile>,
    pub monitor: &'static UsageMonitor,
}

impl Components {
    pub fn global() -> Self {
        Self {
            native: native::reclaimer().clone(),
            disk: disk::reclaimer().clone(),
            monitor: monitor::global(),
        }
    }
}

/// Start both reapers, register their shutdown sweeps and schedule the usage
/// monitor, all against the process-wide registries.
pub fn install(host: &dyn Host, config: &PayloadConfig) -> Result<()> {
    install_with(host, config, Components::global())
}

pub fn install_with(host: &dyn Host, config: &PayloadConfig, parts: Components) -> Result<()> {
    let poll = Duration::from_millis(config.reaper_poll_millis.max(1));
    attach_reclaimer(host, parts.native, poll, "native-sweep")?;
    attach_reclaimer(host, parts.disk, poll, "disk-sweep")?;

    let monitor = parts.monitor;
    host.schedule_periodic(
        "usage-monitor",
        Duration::from_secs(config.monitor_interval_secs.max(1)),
        Box::new(move || {
            monitor.tick();
        }),
    )?;

    info!(
        reaper_poll_ms = config.reaper_poll_millis,
        monitor_interval_secs = config.monitor_interval_secs,
        "blob store installed"
    );
    Ok(())
}

/// The sweep hook owns the reaper: shutdown stops and joins the reaper first,
/// then force-releases whatever is still pending.
fn attach_reclaimer<R: Reclaim>(
    host: &dyn Host,
    reclaimer: Reclaimer<R>,
    poll: Duration,
    hook: &'static str,
) -> Result<()> {
    let reaper = reclaimer.spawn_reaper(poll)?;
    host.on_shutdown(
        hook,
        Box::new(move || {
            if let Err(e) = reaper.stop() {
                warn!(reclaimer = reclaimer.name(), error = %e, "reaper stop failed");
            }
            let swept = reclaimer.shutdown_sweep();
            info!(
                reclaimer = reclaimer.name(),
                swept,
                released = reclaimer.released_count(),
                "shutdown sweep finished"
            );
        }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use blobstore_core::BlobContainer;
    use blobstore_mem::{NativeBuffer, SystemAllocator, UsageMonitor};

    use super::*;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn test_parts(tag: &'static str) -> Components {
        Components {
            native: Reclaimer::new(tag),
            disk: Reclaimer::new(tag),
            monitor: Box::leak(Box::new(UsageMonitor::new())),
        }
    }

    #[test]
    fn periodic_task_runs_until_shutdown() {
        let host = ThreadHost::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        host.schedule_periodic(
            "tick-test",
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 2));
        host.shutdown();
        let after = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn hooks_run_once_in_reverse_order() {
        let host = ThreadHost::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            host.on_shutdown(name, Box::new(move || order.lock().push(name)));
        }
        host.shutdown();
        host.shutdown();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn scheduling_after_shutdown_is_refused() {
        let host = ThreadHost::new();
        host.shutdown();
        let err = host
            .schedule_periodic("late", Duration::from_millis(1), Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_period_is_refused() {
        let host = ThreadHost::new();
        assert!(host
            .schedule_periodic("busy", Duration::ZERO, Box::new(|| {}))
            .is_err());
    }

    #[test]
    fn installed_reaper_frees_abandoned_native_memory() {
        let host = ThreadHost::new();
        let parts = test_parts("install-reap");
        let native = parts.native.clone();
        let config = PayloadConfig {
            reaper_poll_millis: 10,
            ..PayloadConfig::default()
        };
        install_with(&host, &config, parts).unwrap();

        let mut buffer = NativeBuffer::with_parts(Arc::new(SystemAllocator), &native);
        buffer.set_data(Some(vec![7u8; 64])).unwrap();
        assert_eq!(native.pending_count(), 1);
        drop(buffer);

        assert!(wait_until(|| native.released_count() == 1));
        assert_eq!(native.pending_count(), 0);
        host.shutdown();
        assert_eq!(native.released_count(), 1);
    }

    #[test]
    fn shutdown_sweeps_live_registrations() {
        let host = ThreadHost::new();
        let parts = test_parts("install-sweep");
        let native = parts.native.clone();
        install_with(&host, &PayloadConfig::default(), parts).unwrap();

        let mut buffer = NativeBuffer::with_parts(Arc::new(SystemAllocator), &native);
        buffer.set_data(Some(b"still here".to_vec())).unwrap();
        host.shutdown();

        assert!(buffer.is_released());
        assert!(matches!(buffer.data(), Err(Error::Released)));
        assert_eq!(native.pending_count(), 0);
        drop(buffer);
        assert_eq!(native.released_count(), 1);
    }

    #[test]
    fn second_install_on_same_reclaimer_fails() {
        let host = ThreadHost::new();
        let parts = test_parts("install-twice");
        install_with(&host, &PayloadConfig::default(), parts.clone()).unwrap();
        assert!(install_with(&host, &PayloadConfig::default(), parts).is_err());
    }
}
