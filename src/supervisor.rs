//! Idle-timeout supervision for anything implementing [`Lifecycle`].
//!
//! Each registered object gets an entry guarded by its own re-entrant lock. A
//! background sweep finalizes entries that have been idle longer than their
//! timeout, and [`IdleSupervisor::activity`] revives an entry before handing
//! the caller a scope during which the sweep cannot touch it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};
use tracing::{debug, warn};

use crate::config::DEFAULT_SWEEP_INTERVAL_SECS;
use crate::error::{Result, ShellError};
use crate::lifecycle::Lifecycle;
use crate::lock::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Pause between two background sweeps.
    pub sweep_interval: Duration,
    /// `initialize` calls per revival before the entry is left dead.
    pub revive_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            revive_attempts: 1,
        }
    }
}

/// Identity of a supervised object: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ObjectKey(usize);

impl ObjectKey {
    fn of<T: ?Sized>(obj: &T) -> Self {
        ObjectKey(obj as *const T as *const () as usize)
    }
}

#[derive(Debug)]
struct EntryState {
    timeout: Duration,
    last_activity: Instant,
    alive: bool,
    reviving: bool,
}

impl EntryState {
    fn is_idle(&self) -> bool {
        self.alive
            && !self.reviving
            && !self.timeout.is_zero()
            && self.last_activity.elapsed() > self.timeout
    }
}

type EntryLock = ReentrantMutex<RefCell<EntryState>>;

struct Entry {
    target: Weak<dyn Lifecycle>,
    label: String,
    state: Arc<EntryLock>,
}

struct Inner {
    config: SupervisorConfig,
    entries: Mutex<HashMap<ObjectKey, Arc<Entry>>>,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Finalizes idle objects in the background and revives them on demand.
///
/// Share it as `Arc<IdleSupervisor>`. The sweep thread starts with the first
/// registration and stops on [`shutdown`](Self::shutdown) or drop. Entries
/// hold weak references, so registering never keeps an object alive.
pub struct IdleSupervisor {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for IdleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleSupervisor")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for IdleSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl IdleSupervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> SupervisorConfig {
        self.inner.config
    }

    /// Track `obj`, considered alive and active as of now.
    ///
    /// A zero `timeout` keeps the entry but exempts it from idle teardown.
    /// Registering an already tracked object replaces its entry.
    pub fn register<T: Lifecycle + 'static>(&self, obj: &Arc<T>, timeout: Duration) {
        let strong = Arc::clone(obj) as Arc<dyn Lifecycle>;
        let target = Arc::downgrade(&strong);
        let label = obj.describe();
        let entry = Arc::new(Entry {
            target,
            label: label.clone(),
            state: Arc::new(ReentrantMutex::new(RefCell::new(EntryState {
                timeout,
                last_activity: Instant::now(),
                alive: true,
                reviving: false,
            }))),
        });
        let replaced = lock_or_recover(&self.inner.entries, "supervisor entries")
            .insert(ObjectKey::of(obj.as_ref()), entry)
            .is_some();
        debug!(object = %label, ?timeout, replaced, "registered with idle supervisor");
        self.ensure_worker();
    }

    /// Stop tracking `obj`. The object itself is left untouched.
    ///
    /// # Errors
    ///
    /// `UnknownObject` when `obj` is not registered.
    pub fn unregister<T: ?Sized>(&self, obj: &T) -> Result<()> {
        let removed =
            lock_or_recover(&self.inner.entries, "supervisor entries").remove(&ObjectKey::of(obj));
        match removed {
            Some(entry) => {
                debug!(object = %entry.label, "unregistered from idle supervisor");
                Ok(())
            }
            None => Err(unknown_object()),
        }
    }

    #[must_use]
    pub fn contains<T: ?Sized>(&self, obj: &T) -> bool {
        lock_or_recover(&self.inner.entries, "supervisor entries").contains_key(&ObjectKey::of(obj))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner.entries, "supervisor entries").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the supervisor currently considers `obj` initialized.
    pub fn is_alive<T: ?Sized>(&self, obj: &T) -> Result<bool> {
        let entry = self.inner.entry(ObjectKey::of(obj))?;
        let guard = entry.state.lock();
        let alive = guard.borrow().alive;
        Ok(alive)
    }

    /// Lock `obj`'s entry, revive it if it was finalized, and return a scope
    /// that keeps the sweep away until dropped. Dropping the scope counts as
    /// activity.
    ///
    /// Scopes nest on the same thread. A failed revival is logged, not
    /// returned; check [`ActivityScope::is_alive`] when it matters.
    pub fn activity<T: ?Sized>(&self, obj: &T) -> Result<ActivityScope> {
        let entry = self.inner.entry(ObjectKey::of(obj))?;
        let guard = entry.state.lock_arc();
        self.inner.revive_locked(&entry, &guard);
        Ok(ActivityScope { guard })
    }

    /// Re-initialize `obj` if it is dead and no revival is already running.
    /// Returns whether the object is alive afterwards.
    pub fn revive<T: ?Sized>(&self, obj: &T) -> Result<bool> {
        let entry = self.inner.entry(ObjectKey::of(obj))?;
        let guard = entry.state.lock();
        Ok(self.inner.revive_locked(&entry, &guard))
    }

    /// Record that `obj` tore itself down, so the next activity revives it.
    pub fn mark_dead<T: ?Sized>(&self, obj: &T) -> Result<()> {
        let entry = self.inner.entry(ObjectKey::of(obj))?;
        let guard = entry.state.lock();
        guard.borrow_mut().alive = false;
        Ok(())
    }

    /// Run one sweep on the calling thread. Returns how many entries were finalized.
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep()
    }

    /// Stop the sweep thread and forget every entry without finalizing anything.
    pub fn shutdown(&self) {
        let worker = lock_or_recover(&self.worker, "supervisor worker").take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.handle.thread().id() != thread::current().id()
                && worker.handle.join().is_err()
            {
                warn!("idle supervisor sweep thread panicked");
            }
        }
        lock_or_recover(&self.inner.entries, "supervisor entries").clear();
    }

    fn ensure_worker(&self) {
        let mut worker = lock_or_recover(&self.worker, "supervisor worker");
        if worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let spawned = thread::Builder::new()
            .name("shellpool-idle-sweep".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        inner.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        match spawned {
            Ok(handle) => *worker = Some(Worker { stop_tx, handle }),
            Err(err) => warn!(error = %err, "cannot start idle sweep thread; sweeps run only on demand"),
        }
    }
}

impl Drop for IdleSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn entry(&self, key: ObjectKey) -> Result<Arc<Entry>> {
        lock_or_recover(&self.entries, "supervisor entries")
            .get(&key)
            .cloned()
            .ok_or_else(unknown_object)
    }

    /// Caller holds the entry lock. No `RefCell` borrow is held across `initialize`,
    /// so the object may open nested activity scopes while reviving.
    fn revive_locked(&self, entry: &Entry, state: &RefCell<EntryState>) -> bool {
        {
            let mut current = state.borrow_mut();
            if current.alive {
                return true;
            }
            if current.reviving {
                return false;
            }
            current.reviving = true;
        }

        let mut revived = false;
        if let Some(target) = entry.target.upgrade() {
            let attempts = self.config.revive_attempts.max(1);
            for attempt in 1..=attempts {
                match target.initialize() {
                    Ok(()) => {
                        revived = true;
                        break;
                    }
                    Err(err) => warn!(
                        object = %entry.label,
                        attempt,
                        attempts,
                        error = %err,
                        "revival failed"
                    ),
                }
            }
        }

        let mut current = state.borrow_mut();
        current.reviving = false;
        current.alive = revived;
        current.last_activity = Instant::now();
        if revived {
            debug!(object = %entry.label, "revived");
        }
        revived
    }

    fn sweep(&self) -> usize {
        let snapshot: Vec<(ObjectKey, Arc<Entry>)> =
            lock_or_recover(&self.entries, "supervisor entries")
                .iter()
                .map(|(key, entry)| (*key, Arc::clone(entry)))
                .collect();

        let mut finalized = 0;
        let mut orphaned = Vec::new();
        for (key, entry) in snapshot {
            let Some(target) = entry.target.upgrade() else {
                orphaned.push(key);
                continue;
            };
            let guard = entry.state.lock();
            if !guard.borrow().is_idle() {
                continue;
            }
            debug!(object = %entry.label, "finalizing idle object");
            if let Err(err) = target.finalize() {
                warn!(object = %entry.label, error = %err, "idle finalize failed");
            }
            guard.borrow_mut().alive = false;
            finalized += 1;
        }

        if !orphaned.is_empty() {
            let mut entries = lock_or_recover(&self.entries, "supervisor entries");
            for key in orphaned {
                if entries
                    .get(&key)
                    .is_some_and(|entry| entry.target.strong_count() == 0)
                {
                    entries.remove(&key);
                }
            }
        }
        finalized
    }
}

fn unknown_object() -> ShellError {
    ShellError::UnknownObject("object is not registered with the idle supervisor".to_string())
}

/// Proof that an object is locked against idle teardown. Dropping it refreshes
/// the object's activity timestamp and releases the lock.
#[must_use = "the object is only protected while the scope is held"]
pub struct ActivityScope {
    guard: ArcReentrantMutexGuard<RawMutex, RawThreadId, RefCell<EntryState>>,
}

impl ActivityScope {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.guard.borrow().alive
    }
}

impl Drop for ActivityScope {
    fn drop(&mut self) {
        self.guard.borrow_mut().last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        initialized: AtomicUsize,
        finalized: AtomicUsize,
        fail_initialize: AtomicBool,
    }

    impl Lifecycle for Probe {
        fn initialize(&self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            if self.fail_initialize.load(Ordering::SeqCst) {
                return Err(ShellError::ConnectionFailed("probe refuses".into()));
            }
            Ok(())
        }

        fn finalize(&self) -> Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manual_supervisor() -> IdleSupervisor {
        IdleSupervisor::new(SupervisorConfig {
            sweep_interval: Duration::from_secs(3600),
            revive_attempts: 2,
        })
    }

    #[test]
    fn unknown_objects_are_rejected() {
        let supervisor = manual_supervisor();
        let probe = Probe::default();
        assert!(matches!(
            supervisor.unregister(&probe),
            Err(ShellError::UnknownObject(_))
        ));
        assert!(matches!(
            supervisor.activity(&probe),
            Err(ShellError::UnknownObject(_))
        ));
    }

    #[test]
    fn idle_objects_are_finalized_then_revived_by_activity() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_millis(10));
        assert_eq!(supervisor.sweep_now(), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(supervisor.sweep_now(), 1);
        assert_eq!(probe.finalized.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_alive(probe.as_ref()).unwrap());
        // dead entries are not finalized twice
        assert_eq!(supervisor.sweep_now(), 0);

        let scope = supervisor.activity(probe.as_ref()).unwrap();
        assert!(scope.is_alive());
        assert_eq!(probe.initialized.load(Ordering::SeqCst), 1);
        drop(scope);
        assert!(supervisor.is_alive(probe.as_ref()).unwrap());
    }

    #[test]
    fn zero_timeout_is_never_swept() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::ZERO);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(supervisor.sweep_now(), 0);
    }

    #[test]
    fn held_scope_blocks_the_sweep() {
        let supervisor = Arc::new(manual_supervisor());
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(150));

        let scope = supervisor.activity(probe.as_ref()).unwrap();
        let sweeper = {
            let supervisor = Arc::clone(&supervisor);
            thread::spawn(move || supervisor.sweep_now())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.finalized.load(Ordering::SeqCst), 0);
        drop(scope);
        assert_eq!(sweeper.join().unwrap(), 0);
        assert_eq!(probe.finalized.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scopes_nest_on_one_thread() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_secs(60));
        let outer = supervisor.activity(probe.as_ref()).unwrap();
        let inner = supervisor.activity(probe.as_ref()).unwrap();
        supervisor.mark_dead(probe.as_ref()).unwrap();
        assert!(!inner.is_alive());
        drop(inner);
        drop(outer);
        assert!(supervisor.revive(probe.as_ref()).unwrap());
        assert_eq!(probe.initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_revival_is_swallowed_and_bounded() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        probe.fail_initialize.store(true, Ordering::SeqCst);
        supervisor.register(&probe, Duration::from_secs(60));
        supervisor.mark_dead(probe.as_ref()).unwrap();

        let scope = supervisor.activity(probe.as_ref()).unwrap();
        assert!(!scope.is_alive());
        drop(scope);
        assert_eq!(probe.initialized.load(Ordering::SeqCst), 2);

        probe.fail_initialize.store(false, Ordering::SeqCst);
        assert!(supervisor.revive(probe.as_ref()).unwrap());
    }

    #[test]
    fn dropped_objects_are_pruned_by_the_sweep() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_millis(1));
        assert_eq!(supervisor.len(), 1);
        drop(probe);
        assert_eq!(supervisor.sweep_now(), 0);
        assert!(supervisor.is_empty());
    }

    #[test]
    fn background_thread_sweeps_and_shutdown_clears() {
        let supervisor = IdleSupervisor::new(SupervisorConfig {
            sweep_interval: Duration::from_millis(20),
            revive_attempts: 1,
        });
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(5);
        while probe.finalized.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(probe.finalized.load(Ordering::SeqCst), 1);

        supervisor.shutdown();
        assert!(supervisor.is_empty());
        assert!(!supervisor.contains(probe.as_ref()));
    }

    #[test]
    fn re_registering_replaces_the_entry() {
        let supervisor = manual_supervisor();
        let probe = Arc::new(Probe::default());
        supervisor.register(&probe, Duration::from_secs(60));
        supervisor.mark_dead(probe.as_ref()).unwrap();
        supervisor.register(&probe, Duration::from_secs(60));
        assert_eq!(supervisor.len(), 1);
        assert!(supervisor.is_alive(probe.as_ref()).unwrap());
    }
}
