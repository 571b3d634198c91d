//! # Record and Aggregation Decoding
//!
//! Turns raw engine buffers into positional [`Value`](crate::domain::Value)
//! sequences for host callbacks.
//!
//! - [`record`]: one probe record (scalars and symbol-resolved addresses)
//! - [`aggregation`]: one aggregation tuple (grouping keys plus the
//!   aggregating action's value layout)
//!
//! Both decoders bounds-check every read against the buffer they are given;
//! a descriptor that points outside its buffer is a [`DecodeError`], never a
//! panic.

pub mod aggregation;
pub mod record;

pub use aggregation::{count_value_args, decode_tuple};
pub use record::{decode_record, is_decodable, is_deferred};

use crate::domain::DecodeError;
use dtrace_async_common::RecordDesc;

/// Payload bytes of `record` within `data`
pub(crate) fn record_bytes<'a>(record: &RecordDesc, data: &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let out_of_bounds =
        || DecodeError::OutOfBounds { offset: record.offset, size: record.size, len: data.len() };
    let start = usize::try_from(record.offset).map_err(|_| out_of_bounds())?;
    let len = usize::try_from(record.size).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    data.get(start..end).ok_or_else(out_of_bounds)
}

/// Native-endian 64-bit word `index` of `bytes`
pub(crate) fn word(bytes: &[u8], index: usize) -> Option<u64> {
    let start = index.checked_mul(8)?;
    let chunk = bytes.get(start..start.checked_add(8)?)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(chunk);
    Some(u64::from_ne_bytes(buf))
}
