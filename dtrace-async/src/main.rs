//! # dtrace-async - Main Entry Point
//!
//! Opens a session over a recorded capture, installs a program, drains
//! records until tracing finishes, then prints the final aggregations.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dtrace_async::cli::Args;
use dtrace_async::domain::SessionError;
use dtrace_async::engine::replay::ReplayEngine;
use dtrace_async::engine::{TraceEngine, WorkStatus};
use dtrace_async::output::Printer;
use dtrace_async::session::{Callback, Session, WorkerPool};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::SetOption { .. }) => EXIT_USAGE,
        _ => EXIT_ERROR,
    }
}

/// Start a control operation and block until its completion is delivered
fn complete<E: TraceEngine>(
    session: &Session<E>,
    start: impl FnOnce(Callback) -> Result<(), SessionError>,
) -> Result<(), SessionError> {
    let outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    start(Box::new(move |result: Result<(), SessionError>| {
        *slot.borrow_mut() = Some(result);
    }))?;
    session.wait();
    let result = outcome.borrow_mut().take();
    result.unwrap_or_else(|| Err(SessionError::Operation("operation never completed".to_string())))
}

fn load_program(args: &Args) -> Result<String> {
    match (&args.script, &args.script_file) {
        (Some(source), _) => Ok(source.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read program from {}", path.display())),
        (None, None) => anyhow::bail!("Missing required argument: -n PROGRAM or -s FILE"),
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let program = load_program(&args)?;
    let config = args.session_config();

    let pool = WorkerPool::new(config.workers).context("Failed to start worker pool")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    pool.handle().spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    if !quiet {
        eprintln!("dtrace-async v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("replay: {}", args.replay.display());
    }

    // ── Open, configure, install, enable ────────────────────────────────
    let opened = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&opened);
    let session = Session::open(
        &pool,
        ReplayEngine::opener(&args.replay),
        &config,
        move |result| *slot.borrow_mut() = Some(result),
    );
    session.wait();
    let open_result = opened.borrow_mut().take();
    open_result.context("Open never completed")??;
    info!("Session status: {}", session.status());

    for (option, value) in args.engine_options() {
        session.setopt(option, value)?;
    }

    complete(&session, |cb| session.strcompile(&program, cb))?;
    complete(&session, |cb| session.go(cb))?;

    // ── Drain until done, timed out or interrupted ──────────────────────
    let mut printer = Printer::new(io::stdout().lock(), args.json, args.demangle);
    let interval = Duration::from_millis(args.interval_ms);
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let started = Instant::now();

    let exit_reason = loop {
        let mut write_error = None;
        let status = session.consume(|record| {
            if let Err(e) = printer.record(record) {
                write_error = write_error.take().or(Some(e));
            }
        })?;
        if let Some(e) = write_error {
            return Err(e).context("Failed to write output");
        }

        if status == WorkStatus::Done {
            break "tracing complete";
        }
        if duration_limit.is_some_and(|limit| started.elapsed() >= limit) {
            break "duration limit reached";
        }
        if interrupted.load(Ordering::SeqCst) {
            break "interrupted";
        }
        std::thread::sleep(interval);
    };

    // ── Stop, final aggregation walk, teardown ──────────────────────────
    complete(&session, |cb| session.stop(cb))?;

    let mut write_error = None;
    session.aggwalk(|tuple| {
        if let Err(e) = printer.aggregation(tuple) {
            write_error = write_error.take().or(Some(e));
        }
    })?;
    if let Some(e) = write_error {
        return Err(e).context("Failed to write output");
    }
    printer.flush_aggregations().context("Failed to write output")?;

    if let Err(e) = session.close() {
        warn!("Failed to close session: {e}");
    }

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} records, {} aggregation tuples",
            exit_reason,
            started.elapsed().as_secs_f64(),
            printer.records,
            printer.tuples,
        );
    }

    Ok(())
}
