//! Graceful shutdown coordination.
//!
//! A [`ShutdownController`] is created once and cloned into whoever needs to
//! request, observe or acknowledge shutdown. The lifecycle is
//! `Running -> ShuttingDown -> {Completed | TimedOut}`:
//!
//! - `request_shutdown` raises the flag, runs the installed `on_shutdown`
//!   callback on its own thread and arms a watchdog
//! - `mark_completed` acknowledges that in-flight work has drained
//! - if that does not happen within the timeout the watchdog moves to
//!   `TimedOut` and runs `on_timeout` exactly once

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use frameflow_models::ShutdownState;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Registration {
    on_shutdown: Option<Callback>,
    on_timeout: Option<Callback>,
    timeout: Duration,
}

struct ControlState {
    state: ShutdownState,
    registration: Option<Registration>,
    /// Bumped by `uninstall` so stale watchdogs and waiters stand down
    generation: u64,
}

struct Inner {
    control: Mutex<ControlState>,
    changed: Condvar,
    /// Mirror of `control.state` for lock-free polling
    flag: AtomicU8,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, control: &mut ControlState, state: ShutdownState) {
        control.state = state;
        self.flag.store(state.as_u8(), Ordering::Release);
        self.changed.notify_all();
    }
}

/// Cloneable handle to the process shutdown state.
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                control: Mutex::new(ControlState {
                    state: ShutdownState::Running,
                    registration: None,
                    generation: 0,
                }),
                changed: Condvar::new(),
                flag: AtomicU8::new(ShutdownState::Running.as_u8()),
            }),
        }
    }

    /// Register the shutdown callbacks.
    ///
    /// Fails while another installation is active. If shutdown was already
    /// requested, the sequence starts immediately.
    pub fn install<F, T>(
        &self,
        on_shutdown: F,
        timeout: Duration,
        on_timeout: T,
    ) -> WorkerResult<()>
    where
        F: FnOnce() + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        self.register(Box::new(on_shutdown), timeout, Some(Box::new(on_timeout)))
    }

    /// [`install`](Self::install) with nothing to run on timeout beyond the
    /// `TimedOut` transition.
    pub fn install_without_timeout_callback<F>(
        &self,
        on_shutdown: F,
        timeout: Duration,
    ) -> WorkerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(Box::new(on_shutdown), timeout, None)
    }

    fn register(
        &self,
        on_shutdown: Callback,
        timeout: Duration,
        on_timeout: Option<Callback>,
    ) -> WorkerResult<()> {
        let mut control = self.inner.lock();
        if control.registration.is_some() {
            return Err(WorkerError::ShutdownAlreadyInstalled);
        }

        control.registration = Some(Registration {
            on_shutdown: Some(on_shutdown),
            on_timeout,
            timeout,
        });
        debug!(timeout_secs = timeout.as_secs_f64(), "Shutdown handler installed");

        if control.state == ShutdownState::ShuttingDown {
            self.start_sequence(&mut control);
        }
        Ok(())
    }

    /// Ask the process to shut down. Returns immediately; idempotent.
    pub fn request_shutdown(&self) {
        let mut control = self.inner.lock();
        if control.state != ShutdownState::Running {
            return;
        }

        self.inner.set_state(&mut control, ShutdownState::ShuttingDown);
        info!("Shutdown requested");

        if control.registration.is_some() {
            self.start_sequence(&mut control);
        } else {
            debug!("No shutdown handler installed, only raising the flag");
        }
    }

    fn start_sequence(&self, control: &mut ControlState) {
        let Some(registration) = control.registration.as_mut() else {
            return;
        };
        let timeout = registration.timeout;

        if let Some(callback) = registration.on_shutdown.take() {
            let spawned = thread::Builder::new()
                .name("frameflow-shutdown".to_string())
                .spawn(move || run_callback("on_shutdown", callback));
            if let Err(e) = spawned {
                error!(error = %e, "Failed to spawn shutdown callback thread");
            }
        }

        let inner = Arc::clone(&self.inner);
        let generation = control.generation;
        let spawned = thread::Builder::new()
            .name("frameflow-shutdown-watchdog".to_string())
            .spawn(move || watchdog(inner, generation, timeout));
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn shutdown watchdog");
        }
    }

    /// Acknowledge that shutdown work has finished.
    ///
    /// Only effective while shutting down; in particular it cannot undo a
    /// timeout.
    pub fn mark_completed(&self) {
        let mut control = self.inner.lock();
        if control.state != ShutdownState::ShuttingDown {
            debug!(state = %control.state, "Ignoring shutdown completion");
            return;
        }
        self.inner.set_state(&mut control, ShutdownState::Completed);
        info!("Shutdown completed");
    }

    /// Block until shutdown reaches a terminal state.
    ///
    /// Returns true if it completed, false on timeout or when the controller
    /// is uninstalled while waiting.
    pub fn wait_for_shutdown(&self) -> bool {
        self.wait_until(None)
    }

    /// Like [`wait_for_shutdown`](Self::wait_for_shutdown) but gives up after
    /// `limit`.
    pub fn wait_for_shutdown_timeout(&self, limit: Duration) -> bool {
        self.wait_until(Some(Instant::now() + limit))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut control = self.inner.lock();
        let generation = control.generation;

        loop {
            if control.generation != generation {
                return false;
            }
            if control.state.is_terminal() {
                return control.state == ShutdownState::Completed;
            }

            control = match deadline {
                None => self
                    .inner
                    .changed
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    self.inner
                        .changed
                        .wait_timeout(control, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Whether shutdown has been requested. Lock-free.
    pub fn is_shutdown_requested(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.inner.flag.load(Ordering::Acquire))
    }

    pub fn is_installed(&self) -> bool {
        self.inner.lock().registration.is_some()
    }

    /// Drop the installed callbacks and reset to `Running`.
    pub fn uninstall(&self) {
        let mut control = self.inner.lock();
        control.registration = None;
        control.generation += 1;
        self.inner.set_state(&mut control, ShutdownState::Running);
        debug!("Shutdown handler uninstalled");
    }
}

impl std::fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownController")
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where the platform has it.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn run_callback(name: &str, callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(callback = name, "Shutdown callback panicked");
    }
}

fn watchdog(inner: Arc<Inner>, generation: u64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut control = inner.lock();

    while control.generation == generation && control.state == ShutdownState::ShuttingDown {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        control = inner
            .changed
            .wait_timeout(control, remaining)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }

    if control.generation != generation || control.state != ShutdownState::ShuttingDown {
        return;
    }

    inner.set_state(&mut control, ShutdownState::TimedOut);
    let on_timeout = control
        .registration
        .as_mut()
        .and_then(|registration| registration.on_timeout.take());
    drop(control);

    warn!(timeout_secs = timeout.as_secs_f64(), "Shutdown timed out");
    if let Some(callback) = on_timeout {
        run_callback("on_timeout", callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_request_runs_callback_and_completes() {
        let controller = ShutdownController::new();
        let (tx, rx) = mpsc::channel();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&timeouts);

        controller
            .install(
                move || tx.send(()).unwrap(),
                Duration::from_secs(5),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        assert!(!controller.is_shutdown_requested());
        controller.request_shutdown();
        controller.request_shutdown();
        assert!(controller.is_shutdown_requested());
        assert_eq!(controller.state(), ShutdownState::ShuttingDown);

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let acknowledger = controller.clone();
        thread::spawn(move || acknowledger.mark_completed());

        assert!(controller.wait_for_shutdown());
        assert_eq!(controller.state(), ShutdownState::Completed);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_fires_once_and_blocks_completion() {
        let controller = ShutdownController::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&timeouts);

        let timeout = Duration::from_millis(200);
        controller
            .install(
                || {},
                timeout,
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        let requested_at = Instant::now();
        controller.request_shutdown();

        assert!(!controller.wait_for_shutdown());
        let elapsed = requested_at.elapsed();
        assert_eq!(controller.state(), ShutdownState::TimedOut);
        assert!(elapsed >= timeout, "timed out early after {:?}", elapsed);
        assert!(
            elapsed < timeout + Duration::from_millis(500),
            "timed out late after {:?}",
            elapsed
        );

        controller.mark_completed();
        assert_eq!(controller.state(), ShutdownState::TimedOut);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_without_callback_still_times_out() {
        let controller = ShutdownController::new();
        controller
            .install_without_timeout_callback(|| {}, Duration::from_millis(20))
            .unwrap();
        controller.request_shutdown();

        assert!(!controller.wait_for_shutdown());
        assert_eq!(controller.state(), ShutdownState::TimedOut);
    }

    #[test]
    fn test_second_install_is_rejected_until_uninstalled() {
        let controller = ShutdownController::new();
        controller.install(|| {}, Duration::from_secs(1), || {}).unwrap();

        assert!(matches!(
            controller.install(|| {}, Duration::from_secs(1), || {}),
            Err(WorkerError::ShutdownAlreadyInstalled)
        ));

        controller.uninstall();
        assert!(!controller.is_installed());
        controller.install(|| {}, Duration::from_secs(1), || {}).unwrap();
        assert!(controller.is_installed());
    }

    #[test]
    fn test_mark_completed_is_noop_while_running() {
        let controller = ShutdownController::new();
        controller.mark_completed();
        assert_eq!(controller.state(), ShutdownState::Running);
    }

    #[test]
    fn test_request_without_install_only_raises_flag() {
        let controller = ShutdownController::new();
        controller.request_shutdown();
        assert!(controller.is_shutdown_requested());
        assert!(!controller.wait_for_shutdown_timeout(Duration::from_millis(20)));

        controller.mark_completed();
        assert!(controller.wait_for_shutdown_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_uninstall_releases_waiters() {
        let controller = ShutdownController::new();
        controller.install(|| {}, Duration::from_secs(10), || {}).unwrap();
        controller.request_shutdown();

        let waiter = {
            let controller = controller.clone();
            thread::spawn(move || controller.wait_for_shutdown())
        };
        thread::sleep(Duration::from_millis(20));
        controller.uninstall();

        assert!(!waiter.join().unwrap());
        assert_eq!(controller.state(), ShutdownState::Running);
    }

    #[test]
    fn test_install_after_request_starts_sequence() {
        let controller = ShutdownController::new();
        controller.request_shutdown();

        let (tx, rx) = mpsc::channel();
        controller
            .install(move || tx.send(()).unwrap(), Duration::from_secs(5), || {})
            .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        controller.mark_completed();
        assert!(controller.wait_for_shutdown());
    }
}
