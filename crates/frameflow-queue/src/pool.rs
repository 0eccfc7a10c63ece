//! Fixed-size worker pool over a shared FIFO queue.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Process-wide pool, or the spawn error of its only construction attempt.
static INSTANCE: OnceLock<Result<WorkerPool, String>> = OnceLock::new();

#[cfg(test)]
static INSTANCE_BUILDS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

struct QueueState {
    tasks: VecDeque<Task>,
    active: usize,
    stopping: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when a task is queued or the pool stops
    available: Condvar,
    /// Signalled when the queue is empty and nothing runs
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Tasks run outside the lock, so a poisoned guard still holds a
        // consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of worker threads executing queued tasks in FIFO order.
///
/// Tasks run concurrently across workers; a task that panics is logged and
/// the worker keeps serving the queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn a pool with `size` workers (at least one).
    pub fn with_size(size: usize) -> QueueResult<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                active: 0,
                stopping: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("frameflow-worker-{}", index))
                .spawn(move || worker_loop(worker_shared, index));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Stop what was already started before reporting.
                    shared.lock().stopping = true;
                    shared.available.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(QueueError::Spawn(e));
                }
            }
        }

        info!(workers = size, "Worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Process-wide pool sized to the available parallelism.
    ///
    /// Built on first use; concurrent first callers block until the single
    /// construction finishes. A failed construction is not retried.
    pub fn instance() -> QueueResult<&'static WorkerPool> {
        let pool = INSTANCE.get_or_init(|| {
            #[cfg(test)]
            INSTANCE_BUILDS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            let size = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            Self::with_size(size).map_err(|e| e.to_string())
        });

        pool.as_ref()
            .map_err(|message| QueueError::Spawn(std::io::Error::other(message.clone())))
    }

    /// Queue a task. Never blocks.
    pub fn enqueue<F>(&self, task: F) -> QueueResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.stopping {
                return Err(QueueError::ShutDown);
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Queue a task and get a handle to its result.
    pub fn submit<F, T>(&self, f: F) -> QueueResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.enqueue(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(error = %message, "Submitted task panicked");
                message
            });
            // The caller may have dropped the handle.
            let _ = tx.send(outcome);
        })?;

        Ok(TaskHandle { rx })
    }

    /// Block until the queue is empty and no task is running.
    ///
    /// Must not be called from a task running on this pool.
    pub fn wait_for_tasks(&self) {
        let mut state = self.shared.lock();
        while !state.tasks.is_empty() || state.active > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting tasks, run what is queued and join the workers.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopping && self.workers_joined() {
                return;
            }
            state.stopping = true;
        }
        self.shared.available.notify_all();

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                // Shutdown from inside a task; this worker exits on its own.
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }

        info!(workers = self.size, "Worker pool stopped");
    }

    fn workers_joined(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Tasks currently executing.
    pub fn active(&self) -> usize {
        self.shared.lock().active
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().stopping
    }

    /// Whether the calling thread is a worker of any pool.
    pub fn is_worker_thread() -> bool {
        IS_WORKER.with(|flag| flag.get())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("pending", &self.pending())
            .field("active", &self.active())
            .finish()
    }
}

/// Result of a task queued with [`WorkerPool::submit`].
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run.
    pub fn join(self) -> QueueResult<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(QueueError::TaskPanicked(message)),
            Err(_) => Err(QueueError::TaskLost),
        }
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    IS_WORKER.with(|flag| flag.set(true));
    debug!(worker = index, "Worker started");

    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    state.active += 1;
                    break task;
                }
                if state.stopping {
                    debug!(worker = index, "Worker exiting");
                    return;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            warn!(
                worker = index,
                error = %panic_message(payload.as_ref()),
                "Task panicked"
            );
        }

        let mut state = shared.lock();
        state.active -= 1;
        if state.active == 0 && state.tasks.is_empty() {
            shared.idle.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_worker_runs_fifo() {
        let pool = WorkerPool::with_size(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            pool.enqueue(move || order.lock().unwrap().push(i)).unwrap();
        }
        pool.wait_for_tasks();

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_size_is_clamped() {
        let pool = WorkerPool::with_size(0).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let pool = WorkerPool::with_size(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.enqueue(|| panic!("boom")).unwrap();
        let counter = Arc::clone(&ran);
        pool.enqueue(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.wait_for_tasks();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_returns_value_and_reports_panic() {
        let pool = WorkerPool::with_size(2).unwrap();

        let handle = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(handle.join().unwrap(), 42);

        let handle = pool.submit(|| -> u32 { panic!("bad frame") }).unwrap();
        match handle.join() {
            Err(QueueError::TaskPanicked(msg)) => assert!(msg.contains("bad frame")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_wait_for_tasks_sees_all_work() {
        let pool = WorkerPool::with_size(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let done = Arc::clone(&done);
            pool.enqueue(move || {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_for_tasks();

        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::with_size(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.enqueue(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        pool.shutdown();

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(matches!(pool.enqueue(|| {}), Err(QueueError::ShutDown)));
    }

    #[test]
    fn test_worker_thread_flag() {
        let pool = WorkerPool::with_size(1).unwrap();
        assert!(!WorkerPool::is_worker_thread());
        let inside = pool.submit(WorkerPool::is_worker_thread).unwrap();
        assert!(inside.join().unwrap());
    }

    #[test]
    fn test_instance_is_shared() {
        let a = WorkerPool::instance().unwrap();
        let b = WorkerPool::instance().unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(a.size() >= 1);
    }

    #[test]
    fn test_instance_is_built_once_under_contention() {
        let callers = 16;
        let barrier = Arc::new(std::sync::Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    WorkerPool::instance().unwrap() as *const WorkerPool as usize
                })
            })
            .collect();
        let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(INSTANCE_BUILDS.load(Ordering::SeqCst), 1);

        let pool = WorkerPool::instance().unwrap();
        let expected = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        assert_eq!(pool.size(), expected);
        assert_eq!(pool.workers.lock().unwrap().len(), expected);
    }
}
