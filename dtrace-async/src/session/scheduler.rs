//! # Async Work Scheduler
//!
//! Runs control operations on a background worker and hands their outcome
//! back to the foreground thread.
//!
//! ```text
//! foreground                         worker (tokio blocking pool)
//! ──────────                         ────────────────────────────
//! begin(engine, errors, op, cb)
//!   ├─ keep cb                       errors.clear()
//!   └─ spawn_blocking ─────────────▶ op(engine, errors)   (panics caught)
//!                                    send Completion ──┐
//! poll() / wait() ◀────────── crossbeam channel ◀──────┘
//!   └─ returns (Completion, cb)
//! ```
//!
//! The callback never leaves the foreground thread: only the engine and the
//! error channel travel to the worker and back.

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::{debug, error};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::{Builder, Handle, Runtime};

use super::error_channel::ErrorChannel;
use crate::domain::SessionError;

/// Completion callback of a control operation
pub type Callback = Box<dyn FnOnce(Result<(), SessionError>)>;

/// Work executed on a worker; receives the checked-out engine (if any) and
/// returns the engine the session should keep
pub type Job<E> = Box<dyn FnOnce(Option<E>, &mut ErrorChannel) -> Option<E> + Send>;

/// Thread pool executing control operations
///
/// Either owns a dedicated tokio runtime or borrows a handle to an existing
/// one. Sessions only ever use its blocking pool.
pub struct WorkerPool {
    handle: Handle,
    _runtime: Option<Runtime>,
}

impl WorkerPool {
    /// Start a dedicated runtime with at most `workers` blocking threads
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be built
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("dta-worker")
            .enable_all()
            .build()?;
        debug!("Started worker pool with {} blocking threads", workers.max(1));
        Ok(Self { handle: runtime.handle().clone(), _runtime: Some(runtime) })
    }

    /// Use the blocking pool of an existing runtime
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle, _runtime: None }
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// What a worker hands back when an operation finishes
pub struct Completion<E> {
    pub engine: Option<E>,
    pub errors: ErrorChannel,
}

struct InFlight<E> {
    results: Receiver<Completion<E>>,
    callback: Callback,
}

/// One session's view of the worker pool; at most one operation in flight
pub struct Scheduler<E> {
    workers: Handle,
    in_flight: RefCell<Option<InFlight<E>>>,
}

impl<E: Send + 'static> Scheduler<E> {
    pub fn new(pool: &WorkerPool) -> Self {
        Self { workers: pool.handle().clone(), in_flight: RefCell::new(None) }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.in_flight.borrow().is_some()
    }

    /// Submit `job`; `callback` is held until [`Scheduler::poll`] or
    /// [`Scheduler::wait`] returns it with the job's completion
    pub fn begin(&self, engine: Option<E>, mut errors: ErrorChannel, job: Job<E>, callback: Callback) {
        let mut in_flight = self.in_flight.borrow_mut();
        debug_assert!(in_flight.is_none(), "control operation already in flight");

        let (tx, results) = bounded(1);
        *in_flight = Some(InFlight { results, callback });
        drop(in_flight);

        self.workers.spawn_blocking(move || {
            errors.clear();
            let engine = match panic::catch_unwind(AssertUnwindSafe(|| job(engine, &mut errors))) {
                Ok(engine) => engine,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("control operation panicked: {message}");
                    errors.fail(format!("control operation panicked: {message}"));
                    None
                }
            };
            // The session may have been dropped; the engine is then dropped here.
            let _ = tx.send(Completion { engine, errors });
        });
    }

    /// Take the completion of the in-flight operation if it has finished
    pub fn poll(&self) -> Option<(Completion<E>, Callback)> {
        let ready = match self.in_flight.borrow().as_ref()?.results.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => None,
        };
        self.finish(ready)
    }

    /// Block until the in-flight operation finishes and take its completion
    pub fn wait(&self) -> Option<(Completion<E>, Callback)> {
        let ready = self.in_flight.borrow().as_ref()?.results.recv().ok();
        self.finish(ready)
    }

    fn finish(&self, ready: Option<Completion<E>>) -> Option<(Completion<E>, Callback)> {
        let in_flight = self.in_flight.borrow_mut().take()?;
        let completion = ready.unwrap_or_else(|| {
            let mut errors = ErrorChannel::default();
            errors.fail("worker pool shut down before the operation completed");
            Completion { engine: None, errors }
        });
        Some((completion, in_flight.callback))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn job<F>(f: F) -> Job<u32>
    where
        F: FnOnce(Option<u32>, &mut ErrorChannel) -> Option<u32> + Send + 'static,
    {
        Box::new(f)
    }

    #[test]
    fn test_completion_carries_engine_back() {
        let pool = WorkerPool::new(1).unwrap();
        let scheduler = Scheduler::new(&pool);
        scheduler.begin(
            Some(1),
            ErrorChannel::default(),
            job(|engine, errors| {
                errors.succeed();
                engine.map(|n| n + 1)
            }),
            Box::new(|_| {}),
        );
        assert!(scheduler.is_pending());
        let (mut completion, callback) = scheduler.wait().unwrap();
        assert_eq!(completion.engine, Some(2));
        assert_eq!(completion.errors.outcome(), Ok(()));
        callback(Ok(()));
        assert!(!scheduler.is_pending());
        assert!(scheduler.poll().is_none());
    }

    #[test]
    fn test_worker_clears_errors_before_running() {
        let pool = WorkerPool::new(1).unwrap();
        let scheduler = Scheduler::new(&pool);
        let mut stale = ErrorChannel::default();
        stale.fail("stale");
        scheduler.begin(Some(0), stale, job(|engine, _| engine), Box::new(|_| {}));
        let (completion, _) = scheduler.wait().unwrap();
        assert!(completion.errors.is_failed());
        assert_eq!(completion.errors.message(), "");
    }

    #[test]
    fn test_panic_is_reported_and_engine_dropped() {
        let pool = WorkerPool::new(1).unwrap();
        let scheduler = Scheduler::new(&pool);
        scheduler.begin(Some(0), ErrorChannel::default(), job(|_, _| panic!("boom")), Box::new(|_| {}));
        let (completion, _) = scheduler.wait().unwrap();
        assert_eq!(completion.engine, None);
        assert!(completion.errors.message().contains("boom"));
    }

    #[test]
    fn test_callback_stays_on_foreground() {
        let pool = WorkerPool::new(1).unwrap();
        let scheduler = Scheduler::new(&pool);
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        scheduler.begin(
            None,
            ErrorChannel::default(),
            job(|engine, _| engine),
            Box::new(move |_| seen.set(seen.get() + 1)),
        );
        let (_, callback) = scheduler.wait().unwrap();
        callback(Ok(()));
        assert_eq!(calls.get(), 1);
    }
}
