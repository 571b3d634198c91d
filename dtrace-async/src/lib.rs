//! # dtrace-async - Asynchronous Tracing Consumer
//!
//! dtrace-async drives a tracing engine connection from a single host
//! thread without ever blocking it on slow engine calls. Control
//! operations (open, compile, enable, disable) run on a worker pool and
//! report through one completion callback each; data walks (record
//! consumption, aggregation walks) run on the host thread and turn raw
//! engine buffers into typed callback arguments.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Host Thread                             │
//! │   open / strcompile / go / stop        setopt / consume /       │
//! │              │                         aggwalk / close          │
//! │              ▼                                │                 │
//! │  ┌──────────────────────┐                     │                 │
//! │  │  Session             │ Busy / Consuming    │                 │
//! │  │  (flags + engine)    │◀────────────────────┘                 │
//! │  └──────────┬───────────┘                                       │
//! │             │ engine moved out          ▲ poll()/wait()         │
//! └─────────────┼───────────────────────────┼───────────────────────┘
//!               ▼                           │ completion
//! ┌─────────────────────────────────────────┴───────────────────────┐
//! │                 Worker Pool (tokio blocking threads)            │
//! │   job(engine, error channel) ──▶ bounded(1) result channel      │
//! └─────────────────────────────────────────────────────────────────┘
//!
//!   consume ─▶ ConsumeLoop ─▶ decode::record      ─▶ callback(args)
//!   aggwalk ─▶ AggWalkLoop ─▶ decode::aggregation ─▶ callback(args)
//! ```
//!
//! ## Module Structure
//!
//! - [`session`]: the session state machine, its flags, the error channel
//!   and the worker scheduler that delivers completions
//! - [`engine`]: the engine contract ([`engine::TraceEngine`]) and the
//!   capture-driven [`engine::replay::ReplayEngine`]
//! - [`walk`]: per-record and per-tuple handlers used by data walks
//! - [`decode`]: record and aggregation decoders producing [`domain::Value`]s
//! - [`translate`]: typed views over decoded callback arguments
//! - [`output`]: text and JSON printers for the command-line consumer
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: identifiers, values and error types
//!
//! ## Typical Usage
//!
//! ```bash
//! # Count syscalls in a recorded capture
//! dtrace-async --replay capture.json -n 'syscall:::entry { @[probefunc] = count(); }'
//!
//! # Emit every record and tuple as JSON lines
//! dtrace-async --replay capture.json -s reads.d --json
//! ```

pub mod cli;
pub mod decode;
pub mod domain;
pub mod engine;
pub mod output;
pub mod session;
pub mod translate;
pub mod walk;
