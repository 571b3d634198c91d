//! # Shared Wire Contract (Tracing Engine ↔ Consumer)
//!
//! Defines the constants and `#[repr(C)]` types that describe how a tracing
//! engine lays out probe records and aggregation values in its raw data
//! buffers. Every engine implementation and every decoder in the consumer
//! crate speaks this contract, so none of it may drift from the engine ABI.
//!
//! ## Key Types
//!
//! - [`ActionKind`] - Tag of the action that produced a record
//! - [`RecordDesc`] - Action, byte size and byte offset of one record
//! - [`LquantizeHeader`] - Packed `lquantize()` parameter word
//! - [`LlquantizeHeader`] - Packed `llquantize()` parameter word
//!
//! ## Bit Layouts
//!
//! ```text
//! lquantize   63        48 47        32 31                         0
//!             |   step    |   levels   |            base           |
//!
//! llquantize  63        48 47        32 31        16 15           0
//!             |  factor   |    low     |    high    |   nsteps     |
//! ```

#![no_std]

use core::fmt;

// ============================================================================
// Action Classes
// ============================================================================

/// Mask selecting the class bits of an action code
pub const ACTION_CLASS_MASK: u16 = 0xff00;

/// Actions that run entirely in the consumer (`trace()`, `printf()`, ...)
pub const ACTION_CLASS_NONE: u16 = 0x0000;

/// Actions that inspect a user process (`ustack()`, `usym()`, ...)
pub const ACTION_CLASS_PROC: u16 = 0x0100;

/// Destructive actions against a user process
pub const ACTION_CLASS_PROC_DESTRUCTIVE: u16 = 0x0200;

/// Actions that inspect the kernel (`stack()`, `sym()`, `mod()`)
pub const ACTION_CLASS_KERNEL: u16 = 0x0400;

/// Aggregating actions (`count()`, `quantize()`, ...)
pub const ACTION_CLASS_AGGREGATION: u16 = 0x0700;

// ============================================================================
// Action Kinds
// ============================================================================

/// Action that produced a record
///
/// Codes outside the named constants are legal on the wire; they simply have
/// no keyword and render as `<unknown action>`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKind(pub u16);

impl ActionKind {
    pub const NONE: Self = Self(ACTION_CLASS_NONE);
    pub const DIFEXPR: Self = Self(ACTION_CLASS_NONE + 1);
    pub const EXIT: Self = Self(ACTION_CLASS_NONE + 2);
    pub const PRINTF: Self = Self(ACTION_CLASS_NONE + 3);
    pub const PRINTA: Self = Self(ACTION_CLASS_NONE + 4);
    pub const LIBACT: Self = Self(ACTION_CLASS_NONE + 5);

    pub const USTACK: Self = Self(ACTION_CLASS_PROC + 1);
    pub const JSTACK: Self = Self(ACTION_CLASS_PROC + 2);
    pub const USYM: Self = Self(ACTION_CLASS_PROC + 3);
    pub const UMOD: Self = Self(ACTION_CLASS_PROC + 4);
    pub const UADDR: Self = Self(ACTION_CLASS_PROC + 5);

    pub const STOP: Self = Self(ACTION_CLASS_PROC_DESTRUCTIVE + 1);
    pub const RAISE: Self = Self(ACTION_CLASS_PROC_DESTRUCTIVE + 2);
    pub const SYSTEM: Self = Self(ACTION_CLASS_PROC_DESTRUCTIVE + 3);
    pub const FREOPEN: Self = Self(ACTION_CLASS_PROC_DESTRUCTIVE + 4);

    pub const STACK: Self = Self(ACTION_CLASS_KERNEL + 1);
    pub const SYM: Self = Self(ACTION_CLASS_KERNEL + 2);
    pub const MOD: Self = Self(ACTION_CLASS_KERNEL + 3);

    pub const COUNT: Self = Self(ACTION_CLASS_AGGREGATION + 1);
    pub const MIN: Self = Self(ACTION_CLASS_AGGREGATION + 2);
    pub const MAX: Self = Self(ACTION_CLASS_AGGREGATION + 3);
    pub const AVG: Self = Self(ACTION_CLASS_AGGREGATION + 4);
    pub const SUM: Self = Self(ACTION_CLASS_AGGREGATION + 5);
    pub const STDDEV: Self = Self(ACTION_CLASS_AGGREGATION + 6);
    pub const QUANTIZE: Self = Self(ACTION_CLASS_AGGREGATION + 7);
    pub const LQUANTIZE: Self = Self(ACTION_CLASS_AGGREGATION + 8);
    pub const LLQUANTIZE: Self = Self(ACTION_CLASS_AGGREGATION + 9);

    /// Class bits of this action (one of the `ACTION_CLASS_*` constants)
    #[must_use]
    pub const fn class(self) -> u16 {
        self.0 & ACTION_CLASS_MASK
    }

    /// Whether the record carries a kernel address (single program counter)
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.class() == ACTION_CLASS_KERNEL
    }

    /// Whether this is an aggregating action
    #[must_use]
    pub const fn is_aggregation(self) -> bool {
        self.class() == ACTION_CLASS_AGGREGATION
    }

    /// Human-readable name, as shown in error messages and aggregation output
    #[must_use]
    pub fn name(self) -> &'static str {
        ACTIONS
            .iter()
            .find(|entry| entry.kind == self)
            .map_or("<unknown action>", |entry| entry.name)
    }

    /// Short keyword used by capture files (`"count"`, `"usym"`, ...)
    #[must_use]
    pub fn keyword(self) -> Option<&'static str> {
        ACTIONS.iter().find(|entry| entry.kind == self).map(|entry| entry.keyword)
    }

    /// Look up an action by its keyword
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        ACTIONS.iter().find(|entry| entry.keyword == keyword).map(|entry| entry.kind)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct ActionEntry {
    kind: ActionKind,
    keyword: &'static str,
    name: &'static str,
}

const fn entry(kind: ActionKind, keyword: &'static str, name: &'static str) -> ActionEntry {
    ActionEntry { kind, keyword, name }
}

const ACTIONS: &[ActionEntry] = &[
    entry(ActionKind::NONE, "none", "<none>"),
    entry(ActionKind::DIFEXPR, "difexpr", "<DIF expression>"),
    entry(ActionKind::EXIT, "exit", "exit()"),
    entry(ActionKind::PRINTF, "printf", "printf()"),
    entry(ActionKind::PRINTA, "printa", "printa()"),
    entry(ActionKind::LIBACT, "libact", "<library action>"),
    entry(ActionKind::USTACK, "ustack", "ustack()"),
    entry(ActionKind::JSTACK, "jstack", "jstack()"),
    entry(ActionKind::USYM, "usym", "usym()"),
    entry(ActionKind::UMOD, "umod", "umod()"),
    entry(ActionKind::UADDR, "uaddr", "uaddr()"),
    entry(ActionKind::STOP, "stop", "stop()"),
    entry(ActionKind::RAISE, "raise", "raise()"),
    entry(ActionKind::SYSTEM, "system", "system()"),
    entry(ActionKind::FREOPEN, "freopen", "freopen()"),
    entry(ActionKind::STACK, "stack", "stack()"),
    entry(ActionKind::SYM, "sym", "sym()"),
    entry(ActionKind::MOD, "mod", "mod()"),
    entry(ActionKind::COUNT, "count", "count()"),
    entry(ActionKind::MIN, "min", "min()"),
    entry(ActionKind::MAX, "max", "max()"),
    entry(ActionKind::AVG, "avg", "avg()"),
    entry(ActionKind::SUM, "sum", "sum()"),
    entry(ActionKind::STDDEV, "stddev", "stddev()"),
    entry(ActionKind::QUANTIZE, "quantize", "quantize()"),
    entry(ActionKind::LQUANTIZE, "lquantize", "lquantize()"),
    entry(ActionKind::LLQUANTIZE, "llquantize", "llquantize()"),
];

// ============================================================================
// Record Descriptor
// ============================================================================

/// Describes one field of a probe firing or aggregation tuple
///
/// **Memory Layout**: `#[repr(C)]`, 12 bytes. `offset` is relative to the start
/// of the raw data buffer the descriptor was delivered with.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordDesc {
    /// Action that produced this record
    pub action: ActionKind,

    /// Padding for 4-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u16,

    /// Size of the record payload in bytes
    pub size: u32,

    /// Byte offset of the payload within the data buffer
    pub offset: u32,
}

impl RecordDesc {
    #[must_use]
    pub const fn new(action: ActionKind, size: u32, offset: u32) -> Self {
        Self { action, _padding: 0, size, offset }
    }
}

// ============================================================================
// quantize()
// ============================================================================

/// Number of power-of-two buckets in a `quantize()` value
pub const QUANTIZE_NBUCKETS: usize = ((u64::BITS as usize) - 1) * 2 + 1;

/// Index of the bucket holding the value zero
pub const QUANTIZE_ZEROBUCKET: usize = (u64::BITS as usize) - 1;

/// Lower bound of `quantize()` bucket `bucket`
///
/// Buckets below the zero bucket are negative powers of two, buckets above it
/// positive powers of two.
#[must_use]
pub const fn quantize_bucket_value(bucket: usize) -> i64 {
    if bucket < QUANTIZE_ZEROBUCKET {
        -(1i64 << (QUANTIZE_ZEROBUCKET - 1 - bucket))
    } else if bucket == QUANTIZE_ZEROBUCKET {
        0
    } else {
        1i64 << (bucket - QUANTIZE_ZEROBUCKET - 1)
    }
}

// ============================================================================
// lquantize()
// ============================================================================

pub const LQUANTIZE_STEP_SHIFT: u32 = 48;
pub const LQUANTIZE_STEP_MASK: u64 = (u16::MAX as u64) << LQUANTIZE_STEP_SHIFT;
pub const LQUANTIZE_LEVELS_SHIFT: u32 = 32;
pub const LQUANTIZE_LEVELS_MASK: u64 = (u16::MAX as u64) << LQUANTIZE_LEVELS_SHIFT;
pub const LQUANTIZE_BASE_SHIFT: u32 = 0;
pub const LQUANTIZE_BASE_MASK: u64 = u32::MAX as u64;

/// Parameters of a linear histogram, packed into the first value word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LquantizeHeader {
    pub base: i32,
    pub step: u16,
    pub levels: u16,
}

impl LquantizeHeader {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub const fn from_word(word: u64) -> Self {
        Self {
            base: ((word & LQUANTIZE_BASE_MASK) >> LQUANTIZE_BASE_SHIFT) as u32 as i32,
            step: ((word & LQUANTIZE_STEP_MASK) >> LQUANTIZE_STEP_SHIFT) as u16,
            levels: ((word & LQUANTIZE_LEVELS_MASK) >> LQUANTIZE_LEVELS_SHIFT) as u16,
        }
    }

    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_word(self) -> u64 {
        ((self.step as u64) << LQUANTIZE_STEP_SHIFT)
            | ((self.levels as u64) << LQUANTIZE_LEVELS_SHIFT)
            | ((self.base as u32 as u64) << LQUANTIZE_BASE_SHIFT)
    }
}

// ============================================================================
// llquantize()
// ============================================================================

pub const LLQUANTIZE_FACTOR_SHIFT: u32 = 48;
pub const LLQUANTIZE_FACTOR_MASK: u64 = (u16::MAX as u64) << LLQUANTIZE_FACTOR_SHIFT;
pub const LLQUANTIZE_LOW_SHIFT: u32 = 32;
pub const LLQUANTIZE_LOW_MASK: u64 = (u16::MAX as u64) << LLQUANTIZE_LOW_SHIFT;
pub const LLQUANTIZE_HIGH_SHIFT: u32 = 16;
pub const LLQUANTIZE_HIGH_MASK: u64 = (u16::MAX as u64) << LLQUANTIZE_HIGH_SHIFT;
pub const LLQUANTIZE_NSTEPS_SHIFT: u32 = 0;
pub const LLQUANTIZE_NSTEPS_MASK: u64 = u16::MAX as u64;

/// Parameters of a log-linear histogram, packed into the first value word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlquantizeHeader {
    pub factor: u16,
    pub low: u16,
    pub high: u16,
    pub nsteps: u16,
}

impl LlquantizeHeader {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_word(word: u64) -> Self {
        Self {
            factor: ((word & LLQUANTIZE_FACTOR_MASK) >> LLQUANTIZE_FACTOR_SHIFT) as u16,
            low: ((word & LLQUANTIZE_LOW_MASK) >> LLQUANTIZE_LOW_SHIFT) as u16,
            high: ((word & LLQUANTIZE_HIGH_MASK) >> LLQUANTIZE_HIGH_SHIFT) as u16,
            nsteps: ((word & LLQUANTIZE_NSTEPS_MASK) >> LLQUANTIZE_NSTEPS_SHIFT) as u16,
        }
    }

    #[must_use]
    pub const fn to_word(self) -> u64 {
        ((self.factor as u64) << LLQUANTIZE_FACTOR_SHIFT)
            | ((self.low as u64) << LLQUANTIZE_LOW_SHIFT)
            | ((self.high as u64) << LLQUANTIZE_HIGH_SHIFT)
            | ((self.nsteps as u64) << LLQUANTIZE_NSTEPS_SHIFT)
    }
}

// ============================================================================
// Capture-file encoding (keywords, falling back to raw codes)
// ============================================================================

#[cfg(feature = "serde")]
mod serde_impl {
    use super::ActionKind;
    use core::fmt;
    use serde::de::{self, Visitor};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    impl Serialize for ActionKind {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self.keyword() {
                Some(keyword) => serializer.serialize_str(keyword),
                None => serializer.serialize_u16(self.0),
            }
        }
    }

    struct ActionVisitor;

    impl Visitor<'_> for ActionVisitor {
        type Value = ActionKind;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an action keyword or a numeric action code")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<ActionKind, E> {
            ActionKind::from_keyword(value)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<ActionKind, E> {
            u16::try_from(value)
                .map(ActionKind)
                .map_err(|_| E::invalid_value(de::Unexpected::Unsigned(value), &self))
        }
    }

    impl<'de> Deserialize<'de> for ActionKind {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(ActionVisitor)
        }
    }
}
