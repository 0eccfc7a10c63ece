//! Keyed cache of expensive inference sessions.
//!
//! Sessions are created at most once per key even under concurrent demand,
//! shared between all callers through [`SessionHandle`] checkouts, and
//! released by LRU eviction, idle expiry or an explicit clear.

use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use frameflow_models::SessionKey;
use frameflow_queue::{QueueResult, WorkerPool};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

const LOOKUPS_METRIC: &str = "frameflow_session_cache_lookups_total";
const CLEAR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cache sessions at all; a disabled pool builds a fresh one per request
    pub enabled: bool,
    /// Soft entry limit (0 = unbounded)
    pub max_entries: usize,
    /// Idle time after which unused sessions expire (zero disables expiry)
    pub idle_timeout: Duration,
    /// How long `clear` waits for outstanding checkouts
    pub clear_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 8,
            idle_timeout: Duration::from_secs(300),
            clear_timeout: Duration::from_secs(5),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: usize,
    pub in_use: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub construction_failures: u64,
}

struct EntryMeta {
    refs: AtomicUsize,
    last_access: Mutex<Instant>,
}

impl EntryMeta {
    fn new() -> Self {
        Self {
            refs: AtomicUsize::new(0),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn in_use(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

struct Loaded<S: ?Sized> {
    session: Arc<S>,
    meta: Arc<EntryMeta>,
}

impl<S: ?Sized> Clone for Loaded<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            meta: Arc::clone(&self.meta),
        }
    }
}

/// Rendezvous for callers waiting on a session under construction.
struct LoadCell<S: ?Sized> {
    result: Mutex<Option<MediaResult<Loaded<S>>>>,
    ready: Condvar,
}

impl<S: ?Sized> LoadCell<S> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn finish(&self, result: MediaResult<Loaded<S>>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> MediaResult<Loaded<S>> {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Entry<S: ?Sized> {
    loaded: Loaded<S>,
    last_used_tick: u64,
}

enum Slot<S: ?Sized> {
    Ready(Entry<S>),
    Loading(Arc<LoadCell<S>>),
}

struct PoolState<S: ?Sized> {
    slots: HashMap<SessionKey, Slot<S>>,
    tick: u64,
}

impl<S: ?Sized> PoolState<S> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn ready(&self) -> impl Iterator<Item = (&SessionKey, &Entry<S>)> {
        self.slots.iter().filter_map(|(key, slot)| match slot {
            Slot::Ready(entry) => Some((key, entry)),
            Slot::Loading(_) => None,
        })
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    construction_failures: AtomicU64,
}

enum Lookup<S: ?Sized> {
    Hit(SessionHandle<S>),
    Wait(Arc<LoadCell<S>>),
    Load(Arc<LoadCell<S>>),
}

/// Thread-safe cache of shared sessions keyed by [`SessionKey`].
pub struct SessionPool<S: ?Sized + Send + Sync> {
    config: PoolConfig,
    state: Mutex<PoolState<S>>,
    counters: Counters,
}

impl<S: ?Sized + Send + Sync> SessionPool<S> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                tick: 0,
            }),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        // Factories run outside the lock; the map is never left half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out the session for `key`, building it with `factory` on a miss.
    ///
    /// Concurrent callers of the same key share one factory call and receive
    /// the same session or the same error. Factories of different keys run in
    /// parallel. A failed factory leaves the key absent so a later call
    /// retries.
    pub fn get_or_create<F>(&self, key: &SessionKey, factory: F) -> MediaResult<SessionHandle<S>>
    where
        F: FnOnce() -> MediaResult<Arc<S>>,
    {
        if !self.config.enabled {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            counter!(LOOKUPS_METRIC, "result" => "bypass").increment(1);
            let session = factory().inspect_err(|_| {
                self.counters
                    .construction_failures
                    .fetch_add(1, Ordering::Relaxed);
            })?;
            return Ok(SessionHandle::detached(session));
        }

        loop {
            let lookup = {
                let mut state = self.lock();
                let tick = state.next_tick();
                match state.slots.get_mut(key) {
                    Some(Slot::Ready(entry)) => {
                        entry.last_used_tick = tick;
                        Lookup::Hit(SessionHandle::checkout(&entry.loaded))
                    }
                    Some(Slot::Loading(cell)) => Lookup::Wait(Arc::clone(cell)),
                    None => {
                        let cell = Arc::new(LoadCell::new());
                        state
                            .slots
                            .insert(key.clone(), Slot::Loading(Arc::clone(&cell)));
                        Lookup::Load(cell)
                    }
                }
            };

            match lookup {
                Lookup::Hit(handle) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    counter!(LOOKUPS_METRIC, "result" => "hit").increment(1);
                    return Ok(handle);
                }
                Lookup::Wait(cell) => {
                    debug!(key = %key, "Waiting for session under construction");
                    let loaded = cell.wait()?;
                    if let Some(handle) = self.checkout_loaded(key, &loaded) {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        counter!(LOOKUPS_METRIC, "result" => "hit").increment(1);
                        return Ok(handle);
                    }
                    debug!(key = %key, "Session left the pool before checkout, retrying");
                }
                Lookup::Load(cell) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    counter!(LOOKUPS_METRIC, "result" => "miss").increment(1);

                    let guard = LoadGuard {
                        pool: self,
                        key,
                        cell: &cell,
                        armed: true,
                    };
                    let started = Instant::now();
                    let result = factory();
                    debug!(
                        key = %key,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "Session factory finished"
                    );
                    return guard.complete(result);
                }
            }
        }
    }

    /// Check out `loaded` if it is still the entry cached under `key`.
    fn checkout_loaded(&self, key: &SessionKey, loaded: &Loaded<S>) -> Option<SessionHandle<S>> {
        let mut state = self.lock();
        let tick = state.next_tick();
        match state.slots.get_mut(key) {
            Some(Slot::Ready(entry)) if Arc::ptr_eq(&entry.loaded.meta, &loaded.meta) => {
                entry.last_used_tick = tick;
                Some(SessionHandle::checkout(&entry.loaded))
            }
            _ => None,
        }
    }

    /// Evict the least recently used idle entry if the pool is full.
    fn make_room(&self, state: &mut PoolState<S>) {
        if self.config.max_entries == 0 {
            return;
        }
        let ready = state.ready().count();
        if ready < self.config.max_entries {
            return;
        }

        let victim = state
            .ready()
            .filter(|(_, entry)| !entry.loaded.meta.in_use())
            .min_by_key(|(_, entry)| entry.last_used_tick)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                state.slots.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Evicted least recently used session");
            }
            None => {
                debug!(
                    entries = ready,
                    max_entries = self.config.max_entries,
                    "All sessions in use, admitting beyond capacity"
                );
            }
        }
    }

    /// Drop idle sessions not used within `idle_timeout`.
    ///
    /// Checked-out sessions never expire. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        if self.config.idle_timeout.is_zero() {
            return 0;
        }

        let timeout = self.config.idle_timeout;
        let mut state = self.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => {
                entry.loaded.meta.in_use() || entry.loaded.meta.idle_for() <= timeout
            }
            Slot::Loading(_) => true,
        });
        let removed = before - state.slots.len();

        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, remaining = state.slots.len(), "Expired idle sessions");
        }
        removed
    }

    /// Remove one session. Refuses (returns false) while it is checked out.
    pub fn evict(&self, key: &SessionKey) -> bool {
        let mut state = self.lock();
        match state.slots.get(key) {
            Some(Slot::Ready(entry)) if !entry.loaded.meta.in_use() => {
                state.slots.remove(key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Evicted session");
                true
            }
            Some(Slot::Ready(_)) => {
                debug!(key = %key, "Session in use, not evicting");
                false
            }
            _ => false,
        }
    }

    /// Remove every session once no handle is outstanding.
    ///
    /// Waits up to `clear_timeout` for checkouts to be returned and fails with
    /// [`MediaError::SessionsInUse`] otherwise, leaving the pool untouched.
    pub fn clear(&self) -> MediaResult<usize> {
        let deadline = Instant::now() + self.config.clear_timeout;
        loop {
            {
                let mut state = self.lock();
                let in_use = state
                    .ready()
                    .filter(|(_, entry)| entry.loaded.meta.in_use())
                    .count();

                if in_use == 0 {
                    let removed = state.ready().count();
                    state
                        .slots
                        .retain(|_, slot| matches!(slot, Slot::Loading(_)));
                    if removed > 0 {
                        info!(removed, "Cleared session pool");
                    }
                    return Ok(removed);
                }

                if Instant::now() >= deadline {
                    warn!(in_use, "Timed out clearing session pool");
                    return Err(MediaError::SessionsInUse { in_use });
                }
            }
            thread::sleep(CLEAR_POLL_INTERVAL);
        }
    }

    /// Number of cached sessions.
    pub fn size(&self) -> usize {
        self.lock().ready().count()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        matches!(self.lock().slots.get(key), Some(Slot::Ready(_)))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            entries: state.ready().count(),
            in_use: state
                .ready()
                .filter(|(_, entry)| entry.loaded.meta.in_use())
                .count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            construction_failures: self.counters.construction_failures.load(Ordering::Relaxed),
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> SessionPool<S> {
    /// Run [`cleanup_expired`](Self::cleanup_expired) on a worker thread.
    pub fn schedule_cleanup(self: &Arc<Self>, workers: &WorkerPool) -> QueueResult<()> {
        let pool = Arc::clone(self);
        workers.enqueue(move || {
            pool.cleanup_expired();
        })
    }
}

impl<S: ?Sized + Send + Sync> Default for SessionPool<S> {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Completes or abandons an in-flight load, also when the factory panics.
struct LoadGuard<'a, S: ?Sized + Send + Sync> {
    pool: &'a SessionPool<S>,
    key: &'a SessionKey,
    cell: &'a Arc<LoadCell<S>>,
    armed: bool,
}

impl<S: ?Sized + Send + Sync> LoadGuard<'_, S> {
    fn remove_loading_slot(&self, state: &mut PoolState<S>) {
        if let Some(Slot::Loading(cell)) = state.slots.get(self.key) {
            if Arc::ptr_eq(cell, self.cell) {
                state.slots.remove(self.key);
            }
        }
    }

    fn complete(mut self, result: MediaResult<Arc<S>>) -> MediaResult<SessionHandle<S>> {
        self.armed = false;
        let pool = self.pool;

        match result {
            Ok(session) => {
                let loaded = Loaded {
                    session,
                    meta: Arc::new(EntryMeta::new()),
                };
                // Checked out before it becomes visible so it cannot be
                // evicted from under the loader.
                let handle = SessionHandle::checkout(&loaded);
                {
                    let mut state = pool.lock();
                    self.remove_loading_slot(&mut state);
                    pool.make_room(&mut state);
                    let tick = state.next_tick();
                    state.slots.insert(
                        self.key.clone(),
                        Slot::Ready(Entry {
                            loaded: loaded.clone(),
                            last_used_tick: tick,
                        }),
                    );
                }
                self.cell.finish(Ok(loaded));
                Ok(handle)
            }
            Err(e) => {
                pool.counters
                    .construction_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %self.key, error = %e, "Session construction failed");
                {
                    let mut state = pool.lock();
                    self.remove_loading_slot(&mut state);
                }
                self.cell.finish(Err(e.clone()));
                Err(e)
            }
        }
    }
}

impl<S: ?Sized + Send + Sync> Drop for LoadGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pool
            .counters
            .construction_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(key = %self.key, "Session factory panicked");
        {
            let mut state = self.pool.lock();
            self.remove_loading_slot(&mut state);
        }
        self.cell
            .finish(Err(MediaError::session_creation("session factory panicked")));
    }
}

/// A checked-out session.
///
/// While any handle of an entry is alive the entry is neither evicted nor
/// expired. Dropping the handle refreshes the entry's last access time.
pub struct SessionHandle<S: ?Sized> {
    session: Arc<S>,
    meta: Option<Arc<EntryMeta>>,
}

impl<S: ?Sized> SessionHandle<S> {
    fn checkout(loaded: &Loaded<S>) -> Self {
        loaded.meta.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            session: Arc::clone(&loaded.session),
            meta: Some(Arc::clone(&loaded.meta)),
        }
    }

    fn detached(session: Arc<S>) -> Self {
        Self {
            session,
            meta: None,
        }
    }

    /// Shared pointer to the session itself.
    pub fn shared(&self) -> Arc<S> {
        Arc::clone(&self.session)
    }

    /// Whether the session is tracked by a pool entry.
    pub fn is_pooled(&self) -> bool {
        self.meta.is_some()
    }
}

impl<S: ?Sized> Deref for SessionHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: ?Sized> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        if let Some(meta) = &self.meta {
            meta.refs.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            session: Arc::clone(&self.session),
            meta: self.meta.clone(),
        }
    }
}

impl<S: ?Sized> Drop for SessionHandle<S> {
    fn drop(&mut self) {
        if let Some(meta) = &self.meta {
            meta.touch();
            meta.refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Run a factory, converting a panic into a construction error.
pub fn guarded_factory<S: ?Sized, F>(factory: F) -> MediaResult<Arc<S>>
where
    F: FnOnce() -> MediaResult<Arc<S>>,
{
    catch_unwind(AssertUnwindSafe(factory))
        .unwrap_or_else(|_| Err(MediaError::session_creation("session factory panicked")))
}
