//! # Aggregation Tuple Decoding
//!
//! A tuple is dispatched to the host as one positional argument list:
//!
//! ```text
//! [varid, action name, nkeys, key 1 .. key N, value args ..]
//! ```
//!
//! The value arguments depend on the aggregating action:
//!
//! | Action | Value arguments |
//! |---|---|
//! | `count()` `min()` `max()` `sum()` | the value |
//! | `avg()` | total / count as a float |
//! | `quantize()` | (bucket, value) for each nonzero bucket |
//! | `lquantize()` | base, step, levels, then (bucket, value) pairs |
//! | `llquantize()` | factor, low, high, nsteps, then (bucket, value) pairs |
//!
//! Bucket pairs are sparse, so the number of value arguments depends on the
//! data. The decoder makes a counting pass that only validates and counts,
//! sizes the argument list exactly, then makes an emitting pass over the same
//! layout code.

use dtrace_async_common::{ActionKind, LlquantizeHeader, LquantizeHeader, RecordDesc};

use super::{record::decode_record, record_bytes, word};
use crate::domain::{DecodeError, Value};
use crate::engine::{AggregationData, SymbolLookup};

/// Destination of the value arguments of one tuple
trait ArgSink {
    fn push(&mut self, make: impl FnOnce() -> Value);
}

/// Counts arguments without building them
#[derive(Default)]
struct Counter(usize);

impl ArgSink for Counter {
    fn push(&mut self, _make: impl FnOnce() -> Value) {
        self.0 += 1;
    }
}

impl ArgSink for Vec<Value> {
    fn push(&mut self, make: impl FnOnce() -> Value) {
        Vec::push(self, make());
    }
}

/// Number of value arguments the tuple's aggregating action produces
///
/// # Errors
/// Returns an error if the aggregating action is unsupported or its payload
/// does not match its layout
pub fn count_value_args(tuple: &AggregationData<'_>) -> Result<usize, DecodeError> {
    let mut counter = Counter::default();
    value_args(tuple, &mut counter)?;
    Ok(counter.0)
}

/// Decode one tuple into its full positional argument list
///
/// # Errors
/// Returns an error if a key or the aggregating action is unsupported, or a
/// record does not fit the tuple buffer
pub fn decode_tuple(
    tuple: &AggregationData<'_>,
    symbols: &dyn SymbolLookup,
) -> Result<Vec<Value>, DecodeError> {
    let desc = tuple.desc;
    let (value, keys) = desc
        .records
        .split_last()
        .ok_or_else(|| DecodeError::MissingValue(desc.name.clone()))?;

    let nargs = 3 + keys.len() + count_value_args(tuple)?;
    let mut args = Vec::with_capacity(nargs);
    args.push(Value::Int(desc.varid.0));
    args.push(Value::Str(value.action.name().to_string()));
    args.push(Value::UInt(keys.len() as u64));

    for (i, key) in keys.iter().enumerate() {
        let decoded = decode_record(key, tuple.data, symbols)?.ok_or_else(|| {
            DecodeError::UnsupportedKey {
                action: key.action,
                index: i + 1,
                aggregation: desc.name.clone(),
            }
        })?;
        args.push(decoded);
    }

    value_args(tuple, &mut args)?;
    debug_assert_eq!(args.len(), nargs);
    Ok(args)
}

fn value_args(tuple: &AggregationData<'_>, sink: &mut impl ArgSink) -> Result<(), DecodeError> {
    let desc = tuple.desc;
    let record = desc
        .records
        .last()
        .ok_or_else(|| DecodeError::MissingValue(desc.name.clone()))?;

    match record.action {
        ActionKind::COUNT | ActionKind::MIN | ActionKind::MAX | ActionKind::SUM => {
            let bytes = sized(record, tuple.data, 8)?;
            let value = signed(bytes, 0);
            sink.push(|| Value::Int(value));
        }
        ActionKind::AVG => {
            let bytes = sized(record, tuple.data, 16)?;
            let (count, total) = (signed(bytes, 0), signed(bytes, 1));
            sink.push(|| Value::Float(mean(total, count)));
        }
        ActionKind::QUANTIZE => {
            let bytes = record_bytes(record, tuple.data)?;
            emit_buckets(bytes, 0, sink);
        }
        ActionKind::LQUANTIZE => {
            let bytes = with_header(record, tuple.data)?;
            let header = LquantizeHeader::from_word(word(bytes, 0).unwrap_or_default());
            sink.push(|| Value::Int(header.base.into()));
            sink.push(|| Value::UInt(header.step.into()));
            sink.push(|| Value::UInt(header.levels.into()));
            emit_buckets(bytes, 1, sink);
        }
        ActionKind::LLQUANTIZE => {
            let bytes = with_header(record, tuple.data)?;
            let header = LlquantizeHeader::from_word(word(bytes, 0).unwrap_or_default());
            sink.push(|| Value::UInt(header.factor.into()));
            sink.push(|| Value::UInt(header.low.into()));
            sink.push(|| Value::UInt(header.high.into()));
            sink.push(|| Value::UInt(header.nsteps.into()));
            emit_buckets(bytes, 1, sink);
        }
        action => {
            return Err(DecodeError::UnsupportedAggregation {
                action,
                aggregation: desc.name.clone(),
            })
        }
    }
    Ok(())
}

/// Emit (bucket, value) for each nonzero word from `first` on, numbering
/// buckets from zero at `first`
fn emit_buckets(bytes: &[u8], first: usize, sink: &mut impl ArgSink) {
    let nwords = bytes.len() / 8;
    for (bucket, index) in (first..nwords).enumerate() {
        let value = signed(bytes, index);
        if value == 0 {
            continue;
        }
        sink.push(|| Value::UInt(bucket as u64));
        sink.push(|| Value::Int(value));
    }
}

fn sized<'a>(record: &RecordDesc, data: &'a [u8], expected: u32) -> Result<&'a [u8], DecodeError> {
    if record.size != expected {
        return Err(DecodeError::UnexpectedSize {
            action: record.action,
            expected: expected.to_string(),
            actual: record.size,
        });
    }
    record_bytes(record, data)
}

fn with_header<'a>(record: &RecordDesc, data: &'a [u8]) -> Result<&'a [u8], DecodeError> {
    if record.size < 8 {
        return Err(DecodeError::UnexpectedSize {
            action: record.action,
            expected: "at least 8".to_string(),
            actual: record.size,
        });
    }
    record_bytes(record, data)
}

/// Signed word `index` of a record already checked to hold it
#[allow(clippy::cast_possible_wrap)]
fn signed(bytes: &[u8], index: usize) -> i64 {
    word(bytes, index).map_or(0, |w| w as i64)
}

#[allow(clippy::cast_precision_loss)]
fn mean(total: i64, count: i64) -> f64 {
    total as f64 / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VarId;
    use crate::engine::AggregationDesc;

    struct NoSymbols;

    impl SymbolLookup for NoSymbols {
        fn addr_to_str(&self, pc: u64) -> String {
            format!("genunix`f+0x{pc:x}")
        }

        fn uaddr_to_str(&self, _pid: u64, pc: u64) -> String {
            format!("0x{pc:x}")
        }
    }

    /// Build a tuple whose keys and value are laid out back to back
    fn tuple(
        keys: &[(ActionKind, Vec<u8>)],
        action: ActionKind,
        words: &[i64],
    ) -> (AggregationDesc, Vec<u8>) {
        let mut data = Vec::new();
        let mut records = Vec::new();
        for (key_action, bytes) in keys {
            while data.len() % 8 != 0 {
                data.push(0);
            }
            records.push(RecordDesc::new(
                *key_action,
                u32::try_from(bytes.len()).unwrap(),
                u32::try_from(data.len()).unwrap(),
            ));
            data.extend_from_slice(bytes);
        }
        while data.len() % 8 != 0 {
            data.push(0);
        }
        records.push(RecordDesc::new(
            action,
            u32::try_from(words.len() * 8).unwrap(),
            u32::try_from(data.len()).unwrap(),
        ));
        for w in words {
            data.extend_from_slice(&w.to_ne_bytes());
        }
        (AggregationDesc { varid: VarId(1), name: "agg".to_string(), records }, data)
    }

    fn decode(desc: &AggregationDesc, data: &[u8]) -> Result<Vec<Value>, DecodeError> {
        decode_tuple(&AggregationData { desc, data }, &NoSymbols)
    }

    fn values(args: &[Value]) -> &[Value] {
        let nkeys = usize::try_from(args[2].as_u64().unwrap()).unwrap();
        &args[3 + nkeys..]
    }

    #[test]
    fn test_count_with_string_key() {
        let (desc, data) =
            tuple(&[(ActionKind::DIFEXPR, b"ls\0".to_vec())], ActionKind::COUNT, &[12]);
        let args = decode(&desc, &data).unwrap();
        assert_eq!(
            args,
            vec![
                Value::Int(1),
                Value::from("count()"),
                Value::UInt(1),
                Value::from("ls"),
                Value::Int(12),
            ]
        );
    }

    #[test]
    fn test_avg_is_floating_point() {
        let (desc, data) = tuple(&[], ActionKind::AVG, &[4, 10]);
        assert_eq!(values(&decode(&desc, &data).unwrap()), &[Value::Float(2.5)]);
    }

    #[test]
    fn test_quantize_sparse_buckets() {
        let (desc, data) = tuple(&[], ActionKind::QUANTIZE, &[0, 0, 5, 0, 3]);
        let args = decode(&desc, &data).unwrap();
        assert_eq!(
            values(&args),
            &[Value::UInt(2), Value::Int(5), Value::UInt(4), Value::Int(3)]
        );
        assert_eq!(count_value_args(&AggregationData { desc: &desc, data: &data }).unwrap(), 4);
    }

    #[test]
    fn test_lquantize_header_and_pairs() {
        let header = LquantizeHeader { base: -10, step: 5, levels: 4 }.to_word() as i64;
        let (desc, data) = tuple(&[], ActionKind::LQUANTIZE, &[header, 0, 7, 0, 0, 1, 0]);
        let args = decode(&desc, &data).unwrap();
        assert_eq!(
            values(&args),
            &[
                Value::Int(-10),
                Value::UInt(5),
                Value::UInt(4),
                Value::UInt(1),
                Value::Int(7),
                Value::UInt(4),
                Value::Int(1),
            ]
        );
    }

    #[test]
    fn test_llquantize_header_independent_of_buckets() {
        let header = LlquantizeHeader { factor: 2, low: 3, high: 20, nsteps: 5 }.to_word() as i64;
        for buckets in [vec![], vec![0, 0, 9]] {
            let mut words = vec![header];
            words.extend(buckets);
            let (desc, data) = tuple(&[], ActionKind::LLQUANTIZE, &words);
            let args = decode(&desc, &data).unwrap();
            assert_eq!(
                &values(&args)[..4],
                &[Value::UInt(2), Value::UInt(3), Value::UInt(20), Value::UInt(5)]
            );
        }
    }

    #[test]
    fn test_symbol_key() {
        let (desc, data) = tuple(
            &[(ActionKind::MOD, 0x40u64.to_ne_bytes().to_vec())],
            ActionKind::SUM,
            &[3],
        );
        let args = decode(&desc, &data).unwrap();
        assert_eq!(args[3], Value::from("genunix"));
    }

    #[test]
    fn test_unsupported_key_is_numbered_from_one() {
        let (desc, data) = tuple(
            &[
                (ActionKind::DIFEXPR, 1u32.to_ne_bytes().to_vec()),
                (ActionKind::STACK, vec![0; 8]),
            ],
            ActionKind::COUNT,
            &[1],
        );
        let err = decode(&desc, &data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported action stack() as key #2 in aggregation \"agg\""
        );
    }

    #[test]
    fn test_unsupported_aggregating_action() {
        let (desc, data) = tuple(&[], ActionKind::STDDEV, &[1, 2, 3]);
        let err = decode(&desc, &data).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnsupportedAggregation {
                action: ActionKind::STDDEV,
                aggregation: "agg".to_string()
            }
        );
    }

    #[test]
    fn test_scalar_size_mismatch() {
        let (desc, data) = tuple(&[], ActionKind::COUNT, &[1, 2]);
        assert!(matches!(
            decode(&desc, &data),
            Err(DecodeError::UnexpectedSize { actual: 16, .. })
        ));
    }

    #[test]
    fn test_missing_value_record() {
        let desc = AggregationDesc { varid: VarId(1), name: "empty".to_string(), records: vec![] };
        assert_eq!(
            decode(&desc, &[]).unwrap_err(),
            DecodeError::MissingValue("empty".to_string())
        );
    }
}
