//! Callbacks run at named points of the server's life.
//!
//! Six queues exist: pre-startup, startup, signal, ready, shutdown, and
//! exit. Pre-startup, startup, signal, and shutdown run in registration
//! order; ready and exit run newest-first. Once shutdown has begun, new
//! registrations are rejected.
//!
//! Shutdown happens in two passes: a detached thread notifies every
//! shutdown callback without a deadline, then [`Callbacks::wait_shutdown`]
//! waits for that thread and re-runs each callback with the deadline so it
//! can confirm its work drained. If the wait times out, the drain pass is
//! skipped with a warning.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Shutdown callbacks get `None` on the notify pass and the deadline on
/// the drain pass; well-behaved ones return promptly once the deadline has
/// passed.
pub type ShutdownProc = Arc<dyn Fn(Option<Instant>) + Send + Sync>;

/// Handle returned from a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(usize);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Order {
    Fifo,
    Lifo,
}

#[derive(Default)]
struct Inner {
    pre_startup: Vec<Callback>,
    startup: Vec<Callback>,
    signal: Vec<Callback>,
    ready: Vec<Callback>,
    exit: Vec<Callback>,
    shutdown: Vec<ShutdownProc>,
    shutdown_pending: bool,
    shutdown_complete: bool,
    shutdown_thread: Option<thread::JoinHandle<()>>,
    next_handle: usize,
}

/// The process lifecycle queues.
#[derive(Default)]
pub struct Callbacks {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Callbacks {
    pub fn new() -> Callbacks {
        Callbacks::default()
    }

    fn register_at(
        &self,
        which: impl FnOnce(&mut Inner) -> &mut Vec<Callback>,
        proc: Callback,
        order: Order,
    ) -> Option<CallbackHandle> {
        let mut inner = self.lock();
        if inner.shutdown_pending {
            return None;
        }
        let handle = CallbackHandle(inner.next_handle);
        inner.next_handle += 1;
        let queue = which(&mut inner);
        match order {
            Order::Fifo => queue.push(proc),
            Order::Lifo => queue.insert(0, proc),
        }
        Some(handle)
    }

    /// Runs after configuration is complete, before the server starts
    /// listening. FIFO.
    pub fn register_pre_startup(&self, proc: Callback) -> Option<CallbackHandle> {
        self.register_at(|i| &mut i.pre_startup, proc, Order::Fifo)
    }

    /// Runs once the driver starts listening for connections. FIFO.
    pub fn register_startup(&self, proc: Callback) -> Option<CallbackHandle> {
        self.register_at(|i| &mut i.startup, proc, Order::Fifo)
    }

    /// Runs when the server receives its reload signal. FIFO.
    pub fn register_signal(&self, proc: Callback) -> Option<CallbackHandle> {
        self.register_at(|i| &mut i.signal, proc, Order::Fifo)
    }

    /// Runs when the driver becomes ready. LIFO.
    pub fn register_ready(&self, proc: Callback) -> Option<CallbackHandle> {
        self.register_at(|i| &mut i.ready, proc, Order::Lifo)
    }

    /// Runs at process exit. LIFO.
    pub fn register_exit(&self, proc: Callback) -> Option<CallbackHandle> {
        self.register_at(|i| &mut i.exit, proc, Order::Lifo)
    }

    /// Registers a shutdown callback. FIFO.
    pub fn register_shutdown(&self, proc: ShutdownProc) -> Option<CallbackHandle> {
        let mut inner = self.lock();
        if inner.shutdown_pending {
            return None;
        }
        let handle = CallbackHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.shutdown.push(proc);
        Some(handle)
    }

    fn run_queue(&self, name: &str, which: impl FnOnce(&Inner) -> Vec<Callback>) {
        let snapshot = {
            let inner = self.lock();
            which(&inner)
        };
        for proc in snapshot {
            log::debug!("callback: {name}");
            proc();
        }
    }

    pub fn run_pre_startup(&self) {
        self.run_queue("prestartup", |i| i.pre_startup.clone());
    }

    pub fn run_startup(&self) {
        self.run_queue("startup", |i| i.startup.clone());
    }

    pub fn run_signal(&self) {
        self.run_queue("signal", |i| i.signal.clone());
    }

    pub fn run_ready(&self) {
        self.run_queue("ready", |i| i.ready.clone());
    }

    pub fn run_exit(&self) {
        self.run_queue("exit", |i| i.exit.clone());
    }

    /// Marks shutdown as pending and, if shutdown callbacks exist, spawns
    /// the detached notify thread. Returns immediately.
    pub fn start_shutdown(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.shutdown_pending = true;
        if inner.shutdown.is_empty() {
            return;
        }

        let snapshot = inner.shutdown.clone();
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("-shutdown-".to_string())
            .spawn(move || {
                for proc in &snapshot {
                    proc(None);
                }
                let mut inner = this.lock();
                inner.shutdown_complete = true;
                this.cond.notify_all();
            });

        match handle {
            Ok(handle) => inner.shutdown_thread = Some(handle),
            Err(err) => log::error!(error:err = err; "failed to spawn shutdown thread"),
        }
    }

    /// Waits for the notify thread, then runs the per-callback drain pass
    /// with the deadline. A timed-out wait logs a warning and skips the
    /// drain pass.
    pub fn wait_shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        let thread = {
            let inner = self.lock();
            if inner.shutdown_thread.is_none() {
                return;
            }

            let (mut inner, result) = self
                .cond
                .wait_timeout_while(inner, timeout, |inner| !inner.shutdown_complete)
                .unwrap_or_else(|e| e.into_inner());

            if result.timed_out() && !inner.shutdown_complete {
                log::warn!("shutdown: timeout waiting for shutdown procs");
                return;
            }
            inner.shutdown_thread.take()
        };

        let snapshot = self.lock().shutdown.clone();
        for proc in &snapshot {
            proc(Some(deadline));
        }

        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn shutdown_pending(&self) -> bool {
        self.lock().shutdown_pending
    }

    /// Queue sizes keyed by queue name, for introspection.
    pub fn describe(&self) -> Vec<(&'static str, usize)> {
        let inner = self.lock();
        vec![
            ("prestartup", inner.pre_startup.len()),
            ("startup", inner.startup.len()),
            ("signal", inner.signal.len()),
            ("ready", inner.ready.len()),
            ("shutdown", inner.shutdown.len()),
            ("exit", inner.exit.len()),
        ]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
