//! # Replay Engine
//!
//! A [`TraceEngine`] that serves a recorded capture instead of live kernel
//! data. Captures are JSON files describing what a live engine would have
//! delivered: probe firings with typed payloads, aggregation tuples, and the
//! symbol tables needed to resolve addresses.
//!
//! ## Replay Time
//!
//! A capture is a list of intervals. While tracing is enabled, every call to
//! [`TraceEngine::work`] drains the next interval: its firings are handed to
//! the consume handler and its aggregation tuples become pending. A snapshot
//! publishes pending tuples to the walkable store, replacing any tuple with
//! the same variable and keys. Once the last interval is drained, `work`
//! reports [`WorkStatus::Done`].
//!
//! ## Capture Format
//!
//! ```json
//! {
//!   "kernel_symbols": { "4096": "genunix`read" },
//!   "intervals": [{
//!     "firings": [{
//!       "probe": { "provider": "syscall", "function": "read", "name": "entry" },
//!       "records": [{ "action": "difexpr", "payload": { "i64": 42 } }]
//!     }],
//!     "aggregations": [{
//!       "varid": 1, "name": "reads",
//!       "keys": [{ "action": "difexpr", "payload": { "str": "ls" } }],
//!       "action": "count", "value": { "words": [3] }
//!     }]
//!   }]
//! }
//! ```

use dtrace_async_common::{ActionKind, LlquantizeHeader, LquantizeHeader, RecordDesc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use super::{
    AggWalkAction, AggregateHandler, AggregationData, AggregationDesc, BufferedAction,
    BufferedOutput, ConsumeAction, ConsumeHandler, EngineOpener, EngineStatus, ProbeData,
    ProgramInfo, SymbolLookup, TraceEngine, WorkStatus,
};
use crate::domain::{CaptureError, EngineError, ProbeDesc, VarId};

/// Error numbers reported by the replay engine
pub const ERR_INJECTED: i32 = 1;
pub const ERR_ABORTED: i32 = 2;
pub const ERR_BAD_OPTION: i32 = 3;
pub const ERR_STATE: i32 = 4;
pub const ERR_CAPTURE: i32 = 5;

/// Options accepted by [`ReplayEngine::set_option`]; `true` marks size options
const KNOWN_OPTIONS: &[(&str, bool)] = &[
    ("aggrate", false),
    ("aggsize", true),
    ("bufpolicy", false),
    ("bufresize", false),
    ("bufsize", true),
    ("cleanrate", false),
    ("cpu", false),
    ("destructive", false),
    ("dynvarsize", true),
    ("flowindent", false),
    ("jstackframes", false),
    ("jstackstrsize", true),
    ("nspec", false),
    ("quiet", false),
    ("rawbytes", false),
    ("specsize", true),
    ("stackframes", false),
    ("statusrate", false),
    ("strsize", true),
    ("switchrate", false),
    ("ustackframes", false),
    ("zdefs", false),
];

// ============================================================================
// Capture file model
// ============================================================================

/// A recorded tracing session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capture {
    /// Kernel symbols keyed by start address
    #[serde(default)]
    pub kernel_symbols: BTreeMap<u64, String>,
    /// User symbols keyed by process ID, then start address
    #[serde(default)]
    pub user_symbols: BTreeMap<u64, BTreeMap<u64, String>>,
    #[serde(default)]
    pub faults: Faults,
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

/// Engine calls that should fail, with the message to fail them with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Faults {
    pub open: Option<String>,
    pub compile: Option<String>,
    pub exec: Option<String>,
    pub go: Option<String>,
    pub stop: Option<String>,
    pub status: Option<String>,
    pub snap: Option<String>,
    pub walk: Option<String>,
    pub work: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interval {
    #[serde(default)]
    pub firings: Vec<Firing>,
    #[serde(default)]
    pub aggregations: Vec<TupleCapture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firing {
    pub probe: ProbeDesc,
    #[serde(default)]
    pub records: Vec<RecordCapture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCapture {
    pub action: ActionKind,
    pub payload: Payload,
}

/// Typed record payload, laid out the way a live engine would
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    I64(i64),
    U32(u32),
    U16(u16),
    U8(u8),
    /// NUL-terminated string
    Str(String),
    /// Kernel program counter
    Addr(u64),
    /// Process ID and program counter
    UserAddr { pid: u64, pc: u64 },
    /// Raw 64-bit words
    Words(Vec<i64>),
    /// Pre-formatted output of a formatting action; carries no bytes
    Text(String),
    /// No payload bytes
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleCapture {
    pub varid: VarId,
    pub name: String,
    #[serde(default)]
    pub keys: Vec<RecordCapture>,
    pub action: ActionKind,
    pub value: ValueCapture,
}

/// Aggregating action payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueCapture {
    /// Raw value words (scalar, `avg()` pair, or `quantize()` buckets)
    Words(Vec<i64>),
    Lquantize { base: i32, step: u16, levels: u16, buckets: Vec<i64> },
    Llquantize { factor: u16, low: u16, high: u16, nsteps: u16, buckets: Vec<i64> },
}

impl Capture {
    /// Load a capture from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a capture from JSON text
    ///
    /// # Errors
    /// Returns an error if the text is not a valid capture
    pub fn from_json(json: &str) -> Result<Self, CaptureError> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Builds a native-endian record buffer with 8-byte aligned records
#[derive(Default)]
struct BufferBuilder {
    data: Vec<u8>,
}

impl BufferBuilder {
    fn push(&mut self, action: ActionKind, bytes: &[u8]) -> Result<RecordDesc, CaptureError> {
        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
        let offset = u32::try_from(self.data.len())
            .map_err(|_| CaptureError::Invalid("record buffer exceeds 4 GiB".to_string()))?;
        let size = u32::try_from(bytes.len())
            .map_err(|_| CaptureError::Invalid("record exceeds 4 GiB".to_string()))?;
        self.data.extend_from_slice(bytes);
        Ok(RecordDesc::new(action, size, offset))
    }

    #[allow(clippy::cast_sign_loss)]
    fn push_payload(
        &mut self,
        record: &RecordCapture,
    ) -> Result<(RecordDesc, Option<String>), CaptureError> {
        let mut text = None;
        let bytes = match &record.payload {
            Payload::I64(v) => v.to_ne_bytes().to_vec(),
            Payload::U32(v) => v.to_ne_bytes().to_vec(),
            Payload::U16(v) => v.to_ne_bytes().to_vec(),
            Payload::U8(v) => vec![*v],
            Payload::Str(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            Payload::Addr(pc) => pc.to_ne_bytes().to_vec(),
            Payload::UserAddr { pid, pc } => words_to_bytes([*pid, *pc]),
            Payload::Words(words) => words_to_bytes(words.iter().map(|&w| w as u64)),
            Payload::Text(t) => {
                text = Some(t.clone());
                Vec::new()
            }
            Payload::Empty => Vec::new(),
        };
        Ok((self.push(record.action, &bytes)?, text))
    }
}

fn words_to_bytes(words: impl IntoIterator<Item = u64>) -> Vec<u8> {
    words.into_iter().flat_map(u64::to_ne_bytes).collect()
}

#[allow(clippy::cast_sign_loss)]
fn value_words(value: &ValueCapture) -> Vec<u64> {
    match value {
        ValueCapture::Words(words) => words.iter().map(|&w| w as u64).collect(),
        ValueCapture::Lquantize { base, step, levels, buckets } => {
            let header = LquantizeHeader { base: *base, step: *step, levels: *levels };
            std::iter::once(header.to_word())
                .chain(buckets.iter().map(|&b| b as u64))
                .collect()
        }
        ValueCapture::Llquantize { factor, low, high, nsteps, buckets } => {
            let header =
                LlquantizeHeader { factor: *factor, low: *low, high: *high, nsteps: *nsteps };
            std::iter::once(header.to_word())
                .chain(buckets.iter().map(|&b| b as u64))
                .collect()
        }
    }
}

struct EncodedFiring {
    probe: ProbeDesc,
    records: Vec<(RecordDesc, Option<String>)>,
    data: Vec<u8>,
}

impl EncodedFiring {
    fn encode(firing: &Firing) -> Result<Self, CaptureError> {
        let mut buffer = BufferBuilder::default();
        let records = firing
            .records
            .iter()
            .map(|record| buffer.push_payload(record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { probe: firing.probe.clone(), records, data: buffer.data })
    }
}

struct EncodedTuple {
    desc: AggregationDesc,
    data: Vec<u8>,
    /// Length of the key prefix of `data`; identifies the tuple
    key_len: usize,
}

impl EncodedTuple {
    fn encode(tuple: &TupleCapture) -> Result<Self, CaptureError> {
        let mut buffer = BufferBuilder::default();
        let mut records = Vec::with_capacity(tuple.keys.len() + 1);
        for key in &tuple.keys {
            let (desc, _) = buffer.push_payload(key)?;
            records.push(desc);
        }
        let key_len = buffer.data.len();
        records.push(buffer.push(tuple.action, &words_to_bytes(value_words(&tuple.value)))?);

        Ok(Self {
            desc: AggregationDesc { varid: tuple.varid, name: tuple.name.clone(), records },
            data: buffer.data,
            key_len,
        })
    }

    fn same_tuple(&self, other: &Self) -> bool {
        self.desc.varid == other.desc.varid
            && self.data[..self.key_len] == other.data[..other.key_len]
    }
}

struct EncodedInterval {
    firings: Vec<EncodedFiring>,
    tuples: Vec<EncodedTuple>,
}

fn merge_tuples(store: &mut Vec<EncodedTuple>, incoming: Vec<EncodedTuple>) {
    for tuple in incoming {
        match store.iter_mut().find(|existing| existing.same_tuple(&tuple)) {
            Some(existing) => *existing = tuple,
            None => store.push(tuple),
        }
    }
}

// ============================================================================
// Symbols
// ============================================================================

/// Address-sorted symbol tables
#[derive(Debug, Default)]
pub struct SymbolTable {
    kernel: BTreeMap<u64, String>,
    user: BTreeMap<u64, BTreeMap<u64, String>>,
}

impl SymbolTable {
    fn resolve(table: Option<&BTreeMap<u64, String>>, pc: u64) -> String {
        table
            .and_then(|t| t.range(..=pc).next_back())
            .map_or_else(
                || format!("0x{pc:x}"),
                |(start, name)| {
                    let offset = pc - start;
                    if offset == 0 {
                        name.clone()
                    } else {
                        format!("{name}+0x{offset:x}")
                    }
                },
            )
    }
}

impl SymbolLookup for SymbolTable {
    fn addr_to_str(&self, pc: u64) -> String {
        Self::resolve(Some(&self.kernel), pc)
    }

    fn uaddr_to_str(&self, pid: u64, pc: u64) -> String {
        Self::resolve(self.user.get(&pid), pc)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Program compiled by the replay engine
#[derive(Debug, Clone)]
pub struct ReplayProgram {
    pub source: String,
    pub clauses: u32,
}

/// Serves a [`Capture`] through the [`TraceEngine`] contract
pub struct ReplayEngine {
    faults: Faults,
    symbols: SymbolTable,
    intervals: VecDeque<EncodedInterval>,
    options: BTreeMap<String, Option<String>>,
    aggregations: u32,
    probes: u32,
    executed: usize,
    enabled: bool,
    stopped: bool,
    pending: Vec<EncodedTuple>,
    snapshot: Vec<EncodedTuple>,
}

impl ReplayEngine {
    /// Build an engine from an in-memory capture
    ///
    /// # Errors
    /// Returns an error if a record cannot be encoded
    pub fn from_capture(capture: Capture) -> Result<Self, CaptureError> {
        let mut varids = BTreeSet::new();
        let mut probes = BTreeSet::new();
        let mut intervals = VecDeque::with_capacity(capture.intervals.len());

        for interval in &capture.intervals {
            let firings =
                interval.firings.iter().map(EncodedFiring::encode).collect::<Result<Vec<_>, _>>()?;
            let tuples = interval
                .aggregations
                .iter()
                .map(EncodedTuple::encode)
                .collect::<Result<Vec<_>, _>>()?;

            probes.extend(firings.iter().map(|f| f.probe.to_string()));
            varids.extend(tuples.iter().map(|t| t.desc.varid));
            intervals.push_back(EncodedInterval { firings, tuples });
        }

        info!(
            "Loaded capture: {} intervals, {} probes, {} aggregations",
            intervals.len(),
            probes.len(),
            varids.len()
        );

        Ok(Self {
            faults: capture.faults,
            symbols: SymbolTable { kernel: capture.kernel_symbols, user: capture.user_symbols },
            intervals,
            options: BTreeMap::new(),
            aggregations: u32::try_from(varids.len()).unwrap_or(u32::MAX),
            probes: u32::try_from(probes.len()).unwrap_or(u32::MAX),
            executed: 0,
            enabled: false,
            stopped: false,
            pending: Vec::new(),
            snapshot: Vec::new(),
        })
    }

    /// Opener that loads `path` on the worker that runs it
    pub fn opener(path: impl AsRef<Path>) -> EngineOpener<Self> {
        let path = path.as_ref().to_path_buf();
        Box::new(move || {
            let capture = Capture::load(&path).map_err(|e| {
                EngineError::new(ERR_CAPTURE, format!("{}: {e}", path.display()))
            })?;
            Self::open(capture)
        })
    }

    /// Open a connection over an in-memory capture, honouring its open fault
    ///
    /// # Errors
    /// Returns an error if the capture injects an open fault or cannot be encoded
    pub fn open(capture: Capture) -> Result<Self, EngineError> {
        if let Some(message) = &capture.faults.open {
            return Err(EngineError::new(ERR_INJECTED, message.clone()));
        }
        Self::from_capture(capture).map_err(|e| EngineError::new(ERR_CAPTURE, e.to_string()))
    }

    /// Current value of an option, if it has been set
    #[must_use]
    pub fn option(&self, name: &str) -> Option<Option<&str>> {
        self.options.get(name).map(Option::as_deref)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Intervals not yet drained
    #[must_use]
    pub fn remaining_intervals(&self) -> usize {
        self.intervals.len()
    }

    fn check(fault: Option<&String>) -> Result<(), EngineError> {
        match fault {
            Some(message) => Err(EngineError::new(ERR_INJECTED, message.clone())),
            None => Ok(()),
        }
    }

    fn dispatch_firing(
        firing: &EncodedFiring,
        handler: &mut dyn ConsumeHandler,
        symbols: &SymbolTable,
    ) -> Result<(), EngineError> {
        let aborted = || EngineError::new(ERR_ABORTED, "consumer aborted");
        let probe = ProbeData { probe: &firing.probe, data: &firing.data };

        for (record, text) in &firing.records {
            match handler.on_record(&probe, Some(record), symbols) {
                ConsumeAction::Abort => return Err(aborted()),
                ConsumeAction::Next => continue,
                ConsumeAction::This => {}
            }
            if let Some(text) = text {
                let output = BufferedOutput { probe: &firing.probe, record: Some(record), text };
                if handler.on_buffered(&output) == BufferedAction::Abort {
                    return Err(aborted());
                }
            }
        }

        match handler.on_record(&probe, None, symbols) {
            ConsumeAction::Abort => Err(aborted()),
            ConsumeAction::Next | ConsumeAction::This => Ok(()),
        }
    }
}

fn is_size(value: &str) -> bool {
    let digits = value.trim_end_matches(|c: char| matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G'));
    value.len() - digits.len() <= 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

impl TraceEngine for ReplayEngine {
    type Program = ReplayProgram;

    fn set_option(&mut self, option: &str, value: Option<&str>) -> Result<(), EngineError> {
        let Some(&(_, sized)) = KNOWN_OPTIONS.iter().find(|(name, _)| *name == option) else {
            return Err(EngineError::new(ERR_BAD_OPTION, "Invalid option name"));
        };
        if sized && !value.is_some_and(is_size) {
            return Err(EngineError::new(ERR_BAD_OPTION, "Invalid value for specified option"));
        }
        debug!("replay option {option}={}", value.unwrap_or("<set>"));
        self.options.insert(option.to_string(), value.map(str::to_string));
        Ok(())
    }

    fn compile(&mut self, source: &str) -> Result<ReplayProgram, EngineError> {
        Self::check(self.faults.compile.as_ref())?;
        if source.trim().is_empty() {
            return Err(EngineError::new(ERR_STATE, "program contains no probe descriptions"));
        }
        let clauses = u32::try_from(source.matches('{').count()).unwrap_or(u32::MAX).max(1);
        Ok(ReplayProgram { source: source.to_string(), clauses })
    }

    fn exec(&mut self, program: &ReplayProgram) -> Result<ProgramInfo, EngineError> {
        Self::check(self.faults.exec.as_ref())?;
        self.executed += 1;
        Ok(ProgramInfo {
            aggregates: self.aggregations,
            records: program.clauses,
            matches: self.probes,
            speculations: 0,
        })
    }

    fn go(&mut self) -> Result<(), EngineError> {
        Self::check(self.faults.go.as_ref())?;
        if self.executed == 0 {
            return Err(EngineError::new(ERR_STATE, "no enablings installed"));
        }
        if self.enabled {
            return Err(EngineError::new(ERR_STATE, "tracing already enabled"));
        }
        self.enabled = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        Self::check(self.faults.stop.as_ref())?;
        self.enabled = false;
        self.stopped = true;
        Ok(())
    }

    fn status(&mut self) -> Result<EngineStatus, EngineError> {
        Self::check(self.faults.status.as_ref())?;
        Ok(if self.stopped {
            EngineStatus::Stopped
        } else if self.enabled && self.intervals.is_empty() {
            EngineStatus::Exited
        } else if self.enabled {
            EngineStatus::Okay
        } else {
            EngineStatus::None
        })
    }

    fn aggregate_snap(&mut self) -> Result<(), EngineError> {
        Self::check(self.faults.snap.as_ref())?;
        let pending = std::mem::take(&mut self.pending);
        merge_tuples(&mut self.snapshot, pending);
        Ok(())
    }

    fn work(&mut self, handler: &mut dyn ConsumeHandler) -> Result<WorkStatus, EngineError> {
        Self::check(self.faults.work.as_ref())?;
        if self.enabled {
            if let Some(interval) = self.intervals.pop_front() {
                merge_tuples(&mut self.pending, interval.tuples);
                for firing in &interval.firings {
                    Self::dispatch_firing(firing, handler, &self.symbols)?;
                }
            }
        }

        if self.stopped || (self.enabled && self.intervals.is_empty()) {
            Ok(WorkStatus::Done)
        } else {
            Ok(WorkStatus::Okay)
        }
    }

    fn aggregate_walk(&mut self, handler: &mut dyn AggregateHandler) -> Result<(), EngineError> {
        Self::check(self.faults.walk.as_ref())?;
        let mut tuples = std::mem::take(&mut self.snapshot).into_iter();
        let mut kept = Vec::new();

        while let Some(tuple) = tuples.next() {
            let data = AggregationData { desc: &tuple.desc, data: &tuple.data };
            match handler.on_tuple(&data, &self.symbols) {
                AggWalkAction::Next => kept.push(tuple),
                AggWalkAction::Remove => {}
                AggWalkAction::Abort => {
                    kept.push(tuple);
                    kept.extend(tuples);
                    self.snapshot = kept;
                    return Err(EngineError::new(ERR_ABORTED, "aggregation walk aborted"));
                }
            }
        }

        self.snapshot = kept;
        Ok(())
    }
}
