//! The event engine: a polling scheduler and per-backend event
//! dispatchers.
//!
//! Two worker families run behind one [`Engine`]:
//!
//! - The **polling worker** keeps a registry of periodic requests. It
//!   fires whichever entry is due, sleeping on a condition variable until
//!   the earliest deadline otherwise. Registering a monitor wakes it so a
//!   short period never waits behind a long one.
//! - One **dispatcher** per backend that hosts pattern monitors. Each
//!   pumps its backend with a one-second bound and invokes every monitor
//!   whose key appears among the event's top-level siblings; several
//!   monitors may match a single event.
//!
//! Callbacks run without any registry lock held, so a callback may submit
//! requests or register further monitors. Callbacks do run on the worker
//! threads: a callback that blocks waiting for another callback will
//! deadlock the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use halow_dcs_core::{Backend, ItemList, ItemLookup, Key};

/// How long a dispatcher lets its backend wait for one event.
const PUMP_TIMEOUT: Duration = Duration::from_secs(1);

/// Back-off after a failed pump so a broken socket cannot spin a core.
const PUMP_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked with the backend that produced a result and the result
/// itself.
pub type EventCallback = Arc<dyn Fn(&Arc<dyn Backend>, &ItemList) + Send + Sync>;

struct PollMonitor {
    backend: Arc<dyn Backend>,
    period: Duration,
    command: ItemList,
    callback: EventCallback,
    next_fire: Instant,
}

struct PatternMonitor {
    key: Key,
    callback: EventCallback,
}

/// All pattern monitors sharing one backend, served by one dispatcher
/// thread.
struct DispatchGroup {
    backend: Arc<dyn Backend>,
    monitors: Mutex<Vec<PatternMonitor>>,
}

struct EngineInner {
    running: AtomicBool,
    poll: Mutex<Vec<PollMonitor>>,
    poll_cond: Condvar,
    groups: Mutex<Vec<Arc<DispatchGroup>>>,
}

/// The engine handle. Workers live from [`Engine::start`] to
/// [`Engine::stop`]; dropping the engine stops them.
pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with empty registries.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                running: AtomicBool::new(false),
                poll: Mutex::new(Vec::new()),
                poll_cond: Condvar::new(),
                groups: Mutex::new(Vec::new()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a periodic request. The first firing is immediate once
    /// the engine runs; the callback only fires on successful requests.
    pub fn monitor_polling(
        &self,
        backend: &Arc<dyn Backend>,
        period: Duration,
        command: ItemList,
        callback: EventCallback,
    ) {
        let mut poll = self.inner.poll.lock();
        poll.push(PollMonitor {
            backend: Arc::clone(backend),
            period,
            command,
            callback,
            next_fire: Instant::now(),
        });
        self.inner.poll_cond.notify_one();
    }

    /// Registers a pattern monitor: `template`'s leading key is matched
    /// against the top-level siblings of every event the backend emits.
    ///
    /// The first monitor on a backend creates its dispatcher thread; later
    /// registrations on the same backend share it.
    pub fn monitor_pattern(
        &self,
        backend: &Arc<dyn Backend>,
        template: &ItemList,
        callback: EventCallback,
    ) {
        let Some(key) = template.first().map(|item| item.key.clone()) else {
            warn!("pattern monitor registered with an empty template, ignoring");
            return;
        };

        let mut groups = self.inner.groups.lock();
        let group = groups
            .iter()
            .find(|group| Arc::ptr_eq(&group.backend, backend))
            .cloned();

        let group = match group {
            Some(group) => group,
            None => {
                let group = Arc::new(DispatchGroup {
                    backend: Arc::clone(backend),
                    monitors: Mutex::new(Vec::new()),
                });
                groups.push(Arc::clone(&group));
                if self.inner.running.load(Ordering::Acquire) {
                    self.spawn_dispatcher(Arc::clone(&group));
                }
                group
            }
        };

        group.monitors.lock().push(PatternMonitor { key, callback });
    }

    /// Starts the polling worker and a dispatcher for every backend that
    /// already has pattern monitors.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("engine started twice");
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.workers.lock().push(
            thread::Builder::new()
                .name("dcs-poll".into())
                .spawn(move || polling_worker(&inner))
                .expect("spawn polling worker"),
        );

        let groups: Vec<_> = self.inner.groups.lock().clone();
        for group in groups {
            self.spawn_dispatcher(group);
        }
    }

    /// Stops both worker families and joins them. Each exits at its next
    /// timeout boundary.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.poll_cond.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("engine worker panicked");
            }
        }
    }

    fn spawn_dispatcher(&self, group: Arc<DispatchGroup>) {
        let inner = Arc::clone(&self.inner);
        let name = format!("dcs-dispatch-{}", group.backend.name());
        self.workers.lock().push(
            thread::Builder::new()
                .name(name)
                .spawn(move || dispatch_worker(&inner, &group))
                .expect("spawn dispatcher"),
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fires due polling monitors, waiting on the condvar between deadlines.
fn polling_worker(inner: &EngineInner) {
    let mut poll = inner.poll.lock();
    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut due: Option<usize> = None;

        for (index, monitor) in poll.iter().enumerate() {
            if earliest.map_or(true, |e| monitor.next_fire < e) {
                earliest = Some(monitor.next_fire);
            }
            if monitor.next_fire <= now {
                due = Some(index);
                break;
            }
        }

        if let Some(index) = due {
            poll[index].next_fire = now + poll[index].period;
            let backend = Arc::clone(&poll[index].backend);
            let command = poll[index].command.clone();
            let callback = Arc::clone(&poll[index].callback);

            // The request and the callback both run unlocked so user code
            // can register monitors or submit requests from a callback.
            parking_lot::MutexGuard::unlocked(&mut poll, || {
                match backend.submit_blocking(&command) {
                    Ok(result) => callback(&backend, &result),
                    Err(err) => warn!(backend = backend.name(), %err, "polling request failed"),
                }
            });
            continue;
        }

        match earliest {
            Some(deadline) => {
                inner.poll_cond.wait_until(&mut poll, deadline);
            }
            None => inner.poll_cond.wait(&mut poll),
        }
    }
}

/// Pumps one backend and routes matching events to its monitors.
fn dispatch_worker(inner: &EngineInner, group: &DispatchGroup) {
    debug!(backend = group.backend.name(), "dispatcher running");
    while inner.running.load(Ordering::Acquire) {
        match group.backend.pump_async(PUMP_TIMEOUT) {
            Ok(Some(event)) => {
                let matching: Vec<EventCallback> = group
                    .monitors
                    .lock()
                    .iter()
                    .filter(|monitor| event.find_key(&monitor.key).is_some())
                    .map(|monitor| Arc::clone(&monitor.callback))
                    .collect();
                for callback in matching {
                    callback(&group.backend, &event);
                }
            }
            Ok(None) => {}
            Err(err) if err.is_recoverable() => {
                warn!(backend = group.backend.name(), %err, "event pump failed");
                thread::sleep(PUMP_ERROR_BACKOFF);
            }
            Err(err) => {
                error!(backend = group.backend.name(), %err, "event pump unusable, dispatcher exiting");
                break;
            }
        }
    }
}
