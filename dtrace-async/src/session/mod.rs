//! # Tracing Session
//!
//! A [`Session`] owns one engine connection and serializes everything that
//! touches it.
//!
//! ## Operations
//!
//! | Operation | Kind | Runs on | Reports through |
//! |---|---|---|---|
//! | [`Session::open`] | control | worker | completion callback |
//! | [`Session::strcompile`] | control | worker | completion callback |
//! | [`Session::go`] / [`Session::stop`] | control | worker | completion callback |
//! | [`Session::setopt`] | synchronous | caller | return value |
//! | [`Session::consume`] | data walk | caller | per-record callback + return value |
//! | [`Session::aggwalk`] | data walk | caller | per-tuple callback + return value |
//! | [`Session::close`] | synchronous | caller | return value |
//!
//! ## State Machine
//!
//! ```text
//!          begin control op              poll()/wait() delivers completion
//!   Idle ─────────────────────▶ Busy ───────────────────────────────────▶ Idle
//!   Idle ─────────────────────▶ Consuming ──── walk returns ────────────▶ Idle
//! ```
//!
//! Any operation started while Busy or Consuming fails immediately with
//! "consumer is busy" and changes nothing. Nothing is queued.
//!
//! The engine is checked out of the session while an operation holds it:
//! moved to the worker for control operations, mutably borrowed for data
//! walks. Flags are only read and written on the thread that owns the
//! session, which is why `Session` is `!Send`.
//!
//! ## Completion Delivery
//!
//! Control operations return as soon as the work is submitted. The host
//! drives delivery with [`Session::poll`] (non-blocking) or
//! [`Session::wait`] (blocking). Delivery restores the engine, clears Busy,
//! canonicalizes the error channel and only then invokes the callback, so
//! the callback may start the next operation.

mod config;
mod error_channel;
mod flags;
mod scheduler;

pub use config::{SessionConfig, DEFAULT_AGGSIZE, DEFAULT_BUFSIZE, DEFAULT_WORKERS};
pub use error_channel::{ErrorChannel, ERROR_MESSAGE_LEN};
pub use flags::SessionFlags;
pub use scheduler::{Callback, Completion, Job, Scheduler, WorkerPool};

use log::{debug, info, warn};
use std::cell::{Cell, RefCell};

use crate::domain::{SessionError, SessionStatus, Value};
use crate::engine::{EngineOpener, TraceEngine, WorkStatus};
use crate::walk;

/// One tracing session bound to the thread that created it
pub struct Session<E: TraceEngine> {
    engine: RefCell<Option<E>>,
    errors: RefCell<ErrorChannel>,
    flags: Cell<SessionFlags>,
    status: Cell<SessionStatus>,
    scheduler: Scheduler<E>,
}

/// Clears Consuming when a data walk ends, even if a host callback panics
struct ConsumingGuard<'a>(&'a Cell<SessionFlags>);

impl Drop for ConsumingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().end_consuming());
    }
}

impl<E: TraceEngine> Session<E> {
    /// Create a session and start opening its engine connection
    ///
    /// The connection is opened on a worker; `config`'s options are applied
    /// to it before `callback` reports the outcome. Until then the session is
    /// Busy with status [`SessionStatus::Opening`].
    pub fn open(
        pool: &WorkerPool,
        opener: EngineOpener<E>,
        config: &SessionConfig,
        callback: impl FnOnce(Result<(), SessionError>) + 'static,
    ) -> Self {
        let session = Self {
            engine: RefCell::new(None),
            errors: RefCell::new(ErrorChannel::default()),
            flags: Cell::new(SessionFlags::opening()),
            status: Cell::new(SessionStatus::Opening),
            scheduler: Scheduler::new(pool),
        };

        let options = config.options.clone();
        let job: Job<E> = Box::new(move |_, errors| {
            let mut engine = match opener() {
                Ok(engine) => engine,
                Err(err) => {
                    errors.fail(format!("couldn't open tracing engine: {err}"));
                    return None;
                }
            };
            for (option, value) in &options {
                if let Err(err) = engine.set_option(option, value.as_deref()) {
                    warn!("Ignoring default option {option}: {err}");
                }
            }
            errors.succeed();
            Some(engine)
        });

        session.dispatch(None, job, Box::new(callback));
        session
    }

    /// Compile `program` and install its enablings
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] or [`SessionError::NoEngine`] if the
    /// operation cannot start; engine failures arrive through `callback`
    pub fn strcompile(
        &self,
        program: &str,
        callback: impl FnOnce(Result<(), SessionError>) + 'static,
    ) -> Result<(), SessionError> {
        let program = program.to_string();
        self.begin(
            move |engine, errors| {
                let compiled = match engine.compile(&program) {
                    Ok(compiled) => compiled,
                    Err(err) => return errors.fail(format!("couldn't compile '{program}': {err}")),
                };
                match engine.exec(&compiled) {
                    Ok(info) => {
                        info!(
                            "Program installed: {} matching probes, {} aggregations, {} records",
                            info.matches, info.aggregates, info.records
                        );
                        errors.succeed();
                    }
                    Err(err) => errors.fail(format!("couldn't execute '{program}': {err}")),
                }
            },
            callback,
        )
    }

    /// Enable tracing
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] or [`SessionError::NoEngine`] if the
    /// operation cannot start; engine failures arrive through `callback`
    pub fn go(
        &self,
        callback: impl FnOnce(Result<(), SessionError>) + 'static,
    ) -> Result<(), SessionError> {
        self.begin(
            |engine, errors| match engine.go() {
                Ok(()) => errors.succeed(),
                Err(err) => errors.fail(format!("couldn't enable tracing: {err}")),
            },
            callback,
        )
    }

    /// Disable tracing
    ///
    /// Rejected while Busy like every other control operation.
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] or [`SessionError::NoEngine`] if the
    /// operation cannot start; engine failures arrive through `callback`
    pub fn stop(
        &self,
        callback: impl FnOnce(Result<(), SessionError>) + 'static,
    ) -> Result<(), SessionError> {
        self.begin(
            |engine, errors| match engine.stop() {
                Ok(()) => errors.succeed(),
                Err(err) => errors.fail(format!("couldn't disable tracing: {err}")),
            },
            callback,
        )
    }

    /// Set an engine option; `None` sets a boolean option
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] while an operation holds the engine,
    /// [`SessionError::NoEngine`] without a connection, or
    /// [`SessionError::SetOption`] if the engine rejects the option
    pub fn setopt(&self, option: &str, value: Option<&str>) -> Result<(), SessionError> {
        self.flags.get().ensure_idle()?;
        let mut slot = self.engine.try_borrow_mut().map_err(|_| SessionError::Busy)?;
        let engine = slot.as_mut().ok_or(SessionError::NoEngine(self.status.get()))?;
        engine.set_option(option, value).map_err(|err| SessionError::SetOption {
            option: option.to_string(),
            reason: err.message,
        })
    }

    /// Drain buffered records once, invoking `callback` per record
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] or [`SessionError::NoEngine`] if the
    /// walk cannot start, a decode error if a record cannot be decoded, or
    /// the engine's failure
    pub fn consume(&self, mut callback: impl FnMut(&[Value])) -> Result<WorkStatus, SessionError> {
        self.walk(|engine, errors| walk::consume(engine, errors, &mut callback))
            .map(|status| status.unwrap_or(WorkStatus::Okay))
    }

    /// Walk the aggregation snapshot once, invoking `callback` per tuple
    ///
    /// Every dispatched tuple is removed, so the next walk sees only data
    /// accumulated since this one. Returns the number of tuples dispatched.
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] or [`SessionError::NoEngine`] if the
    /// walk cannot start, a decode error if a tuple cannot be decoded, or
    /// the engine's failure
    pub fn aggwalk(&self, mut callback: impl FnMut(&[Value])) -> Result<usize, SessionError> {
        self.walk(|engine, errors| walk::aggwalk(engine, errors, &mut callback))
            .map(Option::unwrap_or_default)
    }

    /// Tear down the engine connection
    ///
    /// Idempotent, and safe after a failed open.
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] while an operation holds the engine
    pub fn close(&self) -> Result<(), SessionError> {
        if self.status.get() == SessionStatus::Closed {
            return Ok(());
        }
        self.flags.get().ensure_idle()?;
        let engine = self.engine.try_borrow_mut().map_err(|_| SessionError::Busy)?.take();
        if let Some(engine) = engine {
            engine.close();
            info!("Closed tracing engine connection");
        }
        self.status.set(SessionStatus::Closed);
        Ok(())
    }

    /// Deliver the in-flight completion if its operation has finished
    ///
    /// Returns `true` if a callback was invoked.
    pub fn poll(&self) -> bool {
        match self.scheduler.poll() {
            Some(done) => {
                self.deliver(done);
                true
            }
            None => false,
        }
    }

    /// Block until the in-flight operation finishes, then deliver it
    ///
    /// Returns `false` immediately if nothing is in flight.
    pub fn wait(&self) -> bool {
        match self.scheduler.wait() {
            Some(done) => {
                self.deliver(done);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.flags.get()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.flags.get().is_busy()
    }

    /// Inspect the engine while no operation holds it
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> Option<R> {
        if !self.flags.get().is_idle() {
            return None;
        }
        self.engine.try_borrow().ok()?.as_ref().map(f)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Check out the engine and dispatch a control operation against it
    fn begin<F>(
        &self,
        op: F,
        callback: impl FnOnce(Result<(), SessionError>) + 'static,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&mut E, &mut ErrorChannel) + Send + 'static,
    {
        let flags = self.flags.get().begin_busy()?;
        let engine = self
            .engine
            .try_borrow_mut()
            .map_err(|_| SessionError::Busy)?
            .take()
            .ok_or(SessionError::NoEngine(self.status.get()))?;

        let job: Job<E> = Box::new(move |engine, errors| {
            let mut engine = engine?;
            op(&mut engine, errors);
            Some(engine)
        });
        self.flags.set(flags);
        self.dispatch(Some(engine), job, Box::new(callback));
        Ok(())
    }

    /// Hand a checked-out engine to the scheduler; the session must be Busy
    fn dispatch(&self, engine: Option<E>, job: Job<E>, callback: Callback) {
        debug_assert!(self.flags.get().is_busy());
        let errors = std::mem::take(&mut *self.errors.borrow_mut());
        self.scheduler.begin(engine, errors, job, callback);
    }

    fn deliver(&self, (completion, callback): (Completion<E>, Callback)) {
        let Completion { engine, mut errors } = completion;

        let status = match (self.status.get(), engine.is_some()) {
            (SessionStatus::Closed, _) => SessionStatus::Closed,
            (_, true) => SessionStatus::Ready,
            (_, false) => SessionStatus::Failed,
        };
        if status != self.status.get() {
            debug!("Session status: {} -> {}", self.status.get(), status);
        }
        self.status.set(status);
        *self.engine.borrow_mut() = engine;
        self.flags.set(self.flags.get().end_busy());

        let result = errors.outcome();
        *self.errors.borrow_mut() = errors;
        callback(result);
    }

    fn walk<R>(
        &self,
        run: impl FnOnce(&mut E, &mut ErrorChannel) -> Option<R>,
    ) -> Result<Option<R>, SessionError> {
        let flags = self.flags.get().begin_consuming()?;
        let mut slot = self.engine.try_borrow_mut().map_err(|_| SessionError::Busy)?;
        let engine = slot.as_mut().ok_or(SessionError::NoEngine(self.status.get()))?;
        let mut errors = self.errors.try_borrow_mut().map_err(|_| SessionError::Busy)?;

        self.flags.set(flags);
        let guard = ConsumingGuard(&self.flags);
        let outcome = run(engine, &mut errors);
        drop(guard);

        errors.outcome().map(|()| outcome)
    }
}

impl<E: TraceEngine> Drop for Session<E> {
    fn drop(&mut self) {
        if self.scheduler.is_pending() {
            debug!("Session dropped with an operation in flight; the worker drops the engine");
        }
        if let Some(engine) = self.engine.get_mut().take() {
            engine.close();
        }
    }
}
