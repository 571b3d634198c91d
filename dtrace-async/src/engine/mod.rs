//! # Tracing Engine Contract
//!
//! The narrow set of calls the consumer makes against a tracing engine. The
//! engine owns program compilation, buffer management and symbol tables; the
//! consumer only drives it and interprets the raw records it hands back.
//!
//! ## Call Flow
//!
//! ```text
//! control (worker thread)          data walks (foreground thread)
//! ───────────────────────          ──────────────────────────────
//! open ─▶ set_option               work ─▶ ConsumeHandler::on_record
//! compile ─▶ exec                       └▶ ConsumeHandler::on_buffered
//! go / stop                        status ─▶ aggregate_snap
//!                                   aggregate_walk ─▶ AggregateHandler::on_tuple
//! ```
//!
//! Handlers receive a [`SymbolLookup`] alongside the data so they can resolve
//! addresses without borrowing the engine a second time.
//!
//! ## Implementations
//!
//! - [`replay::ReplayEngine`]: serves a recorded capture file

pub mod replay;

use dtrace_async_common::RecordDesc;

use crate::domain::{EngineError, ProbeDesc, VarId};

/// Opens an engine connection; runs on a worker thread
pub type EngineOpener<E> = Box<dyn FnOnce() -> Result<E, EngineError> + Send>;

/// Summary of an executed program
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramInfo {
    pub aggregates: u32,
    pub records: u32,
    pub matches: u32,
    pub speculations: u32,
}

/// Result of a status check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Nothing changed since the last check
    None,
    Okay,
    /// The program called `exit()`
    Exited,
    /// A principal buffer filled
    Filled,
    /// Tracing was stopped
    Stopped,
}

/// Outcome of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// More data may arrive
    Okay,
    /// Tracing is finished; nothing further will arrive
    Done,
}

/// Per-record verdict returned from [`ConsumeHandler::on_record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAction {
    /// Skip the engine's default processing of this record
    Next,
    /// Let the engine process this record, formatting it if it is a
    /// formatting action
    This,
    /// Stop the drain
    Abort,
}

/// Verdict returned from [`ConsumeHandler::on_buffered`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedAction {
    Ok,
    Abort,
}

/// Per-tuple verdict returned from [`AggregateHandler::on_tuple`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggWalkAction {
    /// Keep the tuple, continue the walk
    Next,
    /// Stop the walk
    Abort,
    /// Remove the tuple from the engine's store, continue the walk
    Remove,
}

/// One probe firing as seen by a consume handler
#[derive(Debug, Clone, Copy)]
pub struct ProbeData<'a> {
    pub probe: &'a ProbeDesc,
    /// Raw record buffer; record offsets index into this
    pub data: &'a [u8],
}

/// Pre-formatted output produced by a formatting action
#[derive(Debug, Clone, Copy)]
pub struct BufferedOutput<'a> {
    pub probe: &'a ProbeDesc,
    pub record: Option<&'a RecordDesc>,
    pub text: &'a str,
}

/// Layout of one aggregation
///
/// `records` holds the grouping keys followed by the aggregating action's
/// value record, which is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationDesc {
    pub varid: VarId,
    pub name: String,
    pub records: Vec<RecordDesc>,
}

/// One aggregation tuple as seen by an aggregate handler
#[derive(Debug, Clone, Copy)]
pub struct AggregationData<'a> {
    pub desc: &'a AggregationDesc,
    pub data: &'a [u8],
}

/// Address-to-symbol resolution offered by the engine
pub trait SymbolLookup {
    /// Resolve a kernel program counter, e.g. `genunix\`read+0x1c`
    fn addr_to_str(&self, pc: u64) -> String;

    /// Resolve a program counter within process `pid`
    fn uaddr_to_str(&self, pid: u64, pc: u64) -> String;
}

/// Callbacks raised by [`TraceEngine::work`]
pub trait ConsumeHandler {
    /// Called once per record of a probe firing, then once with `None` when
    /// the firing's records are exhausted
    fn on_record(
        &mut self,
        probe: &ProbeData<'_>,
        record: Option<&RecordDesc>,
        symbols: &dyn SymbolLookup,
    ) -> ConsumeAction;

    /// Called once per formatted event
    fn on_buffered(&mut self, output: &BufferedOutput<'_>) -> BufferedAction;
}

/// Callback raised by [`TraceEngine::aggregate_walk`]
pub trait AggregateHandler {
    fn on_tuple(
        &mut self,
        tuple: &AggregationData<'_>,
        symbols: &dyn SymbolLookup,
    ) -> AggWalkAction;
}

/// A blocking, stateful tracing engine connection
///
/// Control calls run on a worker thread, so implementations must be `Send`.
/// The consumer never calls into the engine from two threads at once.
pub trait TraceEngine: Send + 'static {
    /// Compiled program handle
    type Program: Send;

    /// Set an engine option; `None` sets a boolean option
    ///
    /// # Errors
    /// Returns an error if the option name or value is rejected
    fn set_option(&mut self, option: &str, value: Option<&str>) -> Result<(), EngineError>;

    /// Compile program source text
    ///
    /// # Errors
    /// Returns an error if the program fails to compile
    fn compile(&mut self, source: &str) -> Result<Self::Program, EngineError>;

    /// Install a compiled program's enablings
    ///
    /// # Errors
    /// Returns an error if the enablings cannot be installed
    fn exec(&mut self, program: &Self::Program) -> Result<ProgramInfo, EngineError>;

    /// Enable tracing
    ///
    /// # Errors
    /// Returns an error if tracing cannot be enabled
    fn go(&mut self) -> Result<(), EngineError>;

    /// Disable tracing
    ///
    /// # Errors
    /// Returns an error if tracing cannot be disabled
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Poll engine status
    ///
    /// # Errors
    /// Returns an error if status cannot be retrieved
    fn status(&mut self) -> Result<EngineStatus, EngineError>;

    /// Snapshot the aggregation buffer so it can be walked
    ///
    /// # Errors
    /// Returns an error if the snapshot fails
    fn aggregate_snap(&mut self) -> Result<(), EngineError>;

    /// Drain buffered records, raising `handler` callbacks in engine order
    ///
    /// # Errors
    /// Returns an error if the drain fails or a handler aborts it
    fn work(&mut self, handler: &mut dyn ConsumeHandler) -> Result<WorkStatus, EngineError>;

    /// Walk the snapshotted aggregation tuples in engine order
    ///
    /// # Errors
    /// Returns an error if the walk fails or a handler aborts it
    fn aggregate_walk(&mut self, handler: &mut dyn AggregateHandler) -> Result<(), EngineError>;

    /// Tear down the connection
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}
