//! # Host Value Translation
//!
//! Builds typed records from the positional arguments the walk loops hand to
//! callbacks:
//!
//! - consume arguments become a [`ProbeEvent`]
//! - aggregation arguments become an [`AggregationEntry`], with histogram
//!   buckets mapped to the inclusive value range each one covers
//!
//! ## Bucket Ranges
//!
//! ```text
//! quantize()                       lquantize(x, base, limit, step)
//! RANGE      VALUES                RANGE                       BUCKET
//! [-7, -4]   -7 .. -4              [i64::MIN, base - 1]        0
//! [-3, -2]   -3, -2                [base, base + step - 1]     1
//! [-1, -1]   -1                    ...
//! [ 0,  0]   0                     [base + levels*step, MAX]   levels + 1
//! [ 1,  1]   1
//! [ 2,  3]   2, 3
//! ```
//!
//! `llquantize()` buckets keep their raw indices alongside the header.

use dtrace_async_common::{quantize_bucket_value, QUANTIZE_NBUCKETS, QUANTIZE_ZEROBUCKET};
use rustc_demangle::try_demangle;
use serde::Serialize;
use std::sync::OnceLock;

use crate::domain::{ProbeDesc, Value, VarId};

/// One consume callback, typed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeEvent {
    pub probe: ProbeDesc,
    /// Decoded record value or formatted text; absent at the end of a firing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProbeEvent {
    /// Interpret consume arguments `[provider, module, function, name, data?]`
    #[must_use]
    pub fn from_args(args: &[Value]) -> Option<Self> {
        let (identity, data) = match args.len() {
            4 => (args, None),
            5 => (&args[..4], Some(args[4].clone())),
            _ => return None,
        };
        let field = |i: usize| identity[i].as_str().map(str::to_string);
        Some(Self {
            probe: ProbeDesc {
                provider: field(0)?,
                module: field(1)?,
                function: field(2)?,
                name: field(3)?,
            },
            data,
        })
    }
}

/// A histogram bucket with the inclusive range of values it counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub range: (i64, i64),
    pub count: i64,
}

/// Value of one aggregation tuple
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateValue {
    /// `count()`, `min()`, `max()`, `sum()`, `avg()`
    Scalar(Value),
    /// `quantize()` and `lquantize()`, nonzero buckets only
    Buckets(Vec<Bucket>),
    /// `llquantize()`: header and raw `(index, count)` pairs
    LogLinear {
        factor: u64,
        low: u64,
        high: u64,
        nsteps: u64,
        buckets: Vec<(u64, i64)>,
    },
}

/// One aggregation callback, typed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationEntry {
    pub varid: VarId,
    /// Aggregating action name, e.g. `quantize()`
    pub action: String,
    pub keys: Vec<Value>,
    pub value: AggregateValue,
}

impl AggregationEntry {
    /// Interpret aggregation arguments
    /// `[varid, action, nkeys, keys.., values..]`
    #[must_use]
    pub fn from_args(args: &[Value]) -> Option<Self> {
        let varid = VarId(args.first()?.as_i64()?);
        let action = args.get(1)?.as_str()?.to_string();
        let nkeys = usize::try_from(args.get(2)?.as_u64()?).ok()?;
        let end = 3usize.checked_add(nkeys)?;
        let keys = args.get(3..end)?.to_vec();
        let values = &args[end..];

        let value = match action.as_str() {
            "quantize()" => AggregateValue::Buckets(
                pairs(values)?
                    .into_iter()
                    .map(|(index, count)| {
                        let index = usize::try_from(index).ok()?;
                        Some(Bucket { range: quantize_range(index)?, count })
                    })
                    .collect::<Option<_>>()?,
            ),
            "lquantize()" => {
                let base = values.first()?.as_i64()?;
                let step = values.get(1)?.as_i64()?;
                let levels = values.get(2)?.as_u64()?;
                AggregateValue::Buckets(
                    pairs(&values[3..])?
                        .into_iter()
                        .map(|(index, count)| Bucket {
                            range: lquantize_range(base, step, levels, index),
                            count,
                        })
                        .collect(),
                )
            }
            "llquantize()" => AggregateValue::LogLinear {
                factor: values.first()?.as_u64()?,
                low: values.get(1)?.as_u64()?,
                high: values.get(2)?.as_u64()?,
                nsteps: values.get(3)?.as_u64()?,
                buckets: pairs(&values[4..])?,
            },
            _ => AggregateValue::Scalar(values.first()?.clone()),
        };

        Some(Self { varid, action, keys, value })
    }
}

fn pairs(values: &[Value]) -> Option<Vec<(u64, i64)>> {
    if values.len() % 2 != 0 {
        return None;
    }
    values
        .chunks_exact(2)
        .map(|pair| Some((pair[0].as_u64()?, pair[1].as_i64()?)))
        .collect()
}

/// Inclusive value range of every `quantize()` bucket
pub fn quantize_ranges() -> &'static [(i64, i64)] {
    static RANGES: OnceLock<Vec<(i64, i64)>> = OnceLock::new();
    RANGES.get_or_init(|| {
        (0..QUANTIZE_NBUCKETS)
            .map(|i| match i.cmp(&QUANTIZE_ZEROBUCKET) {
                std::cmp::Ordering::Less => {
                    let min = if i > 0 { quantize_bucket_value(i - 1) + 1 } else { i64::MIN };
                    (min, quantize_bucket_value(i))
                }
                std::cmp::Ordering::Equal => (0, 0),
                std::cmp::Ordering::Greater => {
                    let max = if i < QUANTIZE_NBUCKETS - 1 {
                        quantize_bucket_value(i + 1) - 1
                    } else {
                        i64::MAX
                    };
                    (quantize_bucket_value(i), max)
                }
            })
            .collect()
    })
}

/// Inclusive value range of `quantize()` bucket `index`
#[must_use]
pub fn quantize_range(index: usize) -> Option<(i64, i64)> {
    quantize_ranges().get(index).copied()
}

/// Inclusive value range of `lquantize()` bucket `index`
#[must_use]
pub fn lquantize_range(base: i64, step: i64, levels: u64, index: u64) -> (i64, i64) {
    let offset = |n: u64| i64::try_from(n).unwrap_or(i64::MAX).saturating_mul(step);
    let min = if index == 0 { i64::MIN } else { base.saturating_add(offset(index - 1)) };
    let max = if index > levels { i64::MAX } else { base.saturating_add(offset(index)) - 1 };
    (min, max)
}

/// Demangle the symbol part of a resolved `module`symbol+0xoff` string
///
/// Anything else is returned unchanged: strings without the module
/// delimiter, strings with whitespace (formatted text), and symbols that are
/// not Rust mangled names.
#[must_use]
pub fn demangle_symbol(resolved: &str) -> String {
    if resolved.contains(char::is_whitespace) {
        return resolved.to_string();
    }
    let Some((module, rest)) = resolved.split_once('`') else {
        return resolved.to_string();
    };
    let (symbol, offset) = match rest.rsplit_once('+') {
        Some((symbol, offset)) => (symbol, Some(offset)),
        None => (rest, None),
    };
    let Ok(demangled) = try_demangle(symbol) else {
        return resolved.to_string();
    };

    let mut out = String::from(module);
    out.push('`');
    out.push_str(&format!("{demangled:#}"));
    if let Some(offset) = offset {
        out.push('+');
        out.push_str(offset);
    }
    out
}

/// Demangle every resolved-symbol string argument in place
pub fn demangle_args(args: &mut [Value]) {
    for arg in args {
        if let Value::Str(s) = arg {
            *s = demangle_symbol(s);
        }
    }
}
