//! Probe record decoding
//!
//! Only a handful of actions carry data the consumer interprets itself:
//!
//! | Action | Payload | Value |
//! |---|---|---|
//! | `DIFEXPR` | 8/4/2/1-byte integer, else NUL-terminated string | `Int` / `UInt` / `Str` |
//! | `sym()` / `mod()` | kernel PC | resolved symbol / module |
//! | `usym()` / `umod()` / `uaddr()` | PID, PC | resolved symbol / module / address |
//!
//! Formatting actions (`printf()`) are deferred to the engine, which hands
//! the formatted text back through the buffered-output path.

use dtrace_async_common::{ActionKind, RecordDesc};

use super::{record_bytes, word};
use crate::domain::{DecodeError, Value};
use crate::engine::SymbolLookup;

/// Capacity of the symbol buffer, including the terminator
pub const SYMBOL_BUF_LEN: usize = 2048;

/// Module name used when a resolved address has no module delimiter
pub const UNKNOWN_MODULE: &str = "<unknown>";

/// Separates module and symbol in a resolved address
const MODULE_DELIMITER: char = '`';

/// Whether records of `action` can be decoded into a value
#[must_use]
pub fn is_decodable(action: ActionKind) -> bool {
    matches!(
        action,
        ActionKind::DIFEXPR
            | ActionKind::SYM
            | ActionKind::MOD
            | ActionKind::USYM
            | ActionKind::UMOD
            | ActionKind::UADDR
    )
}

/// Whether records of `action` are left to the engine to format
#[must_use]
pub fn is_deferred(action: ActionKind) -> bool {
    action == ActionKind::PRINTF
}

/// Decode one record
///
/// Returns `Ok(None)` when the action is not decodable; callers decide
/// whether that is an error in their context.
///
/// # Errors
/// Returns an error if the record's size does not fit its action or the
/// descriptor points outside `data`
pub fn decode_record(
    record: &RecordDesc,
    data: &[u8],
    symbols: &dyn SymbolLookup,
) -> Result<Option<Value>, DecodeError> {
    if !is_decodable(record.action) {
        return Ok(None);
    }

    let bytes = record_bytes(record, data)?;
    let value = match record.action {
        ActionKind::DIFEXPR => decode_expression(bytes),
        action => Value::Str(decode_symbol(record, action, bytes, symbols)?),
    };
    Ok(Some(value))
}

fn decode_expression(bytes: &[u8]) -> Value {
    match *bytes {
        [a, b, c, d, e, f, g, h] => Value::Int(i64::from_ne_bytes([a, b, c, d, e, f, g, h])),
        [a, b, c, d] => Value::UInt(u32::from_ne_bytes([a, b, c, d]).into()),
        [a, b] => Value::UInt(u16::from_ne_bytes([a, b]).into()),
        [a] => Value::UInt(a.into()),
        _ => Value::Str(nul_terminated(bytes)),
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn decode_symbol(
    record: &RecordDesc,
    action: ActionKind,
    bytes: &[u8],
    symbols: &dyn SymbolLookup,
) -> Result<String, DecodeError> {
    let mut resolved = if action.is_kernel() {
        let pc = word(bytes, 0).ok_or_else(|| size_error(record, "8"))?;
        symbols.addr_to_str(pc)
    } else {
        let (Some(pid), Some(pc)) = (word(bytes, 0), word(bytes, 1)) else {
            return Err(size_error(record, "16"));
        };
        symbols.uaddr_to_str(pid, pc)
    };
    truncate_at_boundary(&mut resolved, SYMBOL_BUF_LEN - 1);

    Ok(match action {
        ActionKind::MOD | ActionKind::UMOD => module_of(&resolved).to_string(),
        ActionKind::SYM | ActionKind::USYM => symbol_of(&resolved).to_string(),
        _ => resolved,
    })
}

/// Text left of the first module delimiter
#[must_use]
pub fn module_of(resolved: &str) -> &str {
    resolved
        .split_once(MODULE_DELIMITER)
        .map_or(UNKNOWN_MODULE, |(module, _)| module)
}

/// Resolved text without its trailing `+offset`
#[must_use]
pub fn symbol_of(resolved: &str) -> &str {
    resolved.rsplit_once('+').map_or(resolved, |(symbol, _)| symbol)
}

fn size_error(record: &RecordDesc, expected: &str) -> DecodeError {
    DecodeError::UnexpectedSize {
        action: record.action,
        expected: format!("at least {expected}"),
        actual: record.size,
    }
}

/// Truncate `s` to at most `max` bytes without splitting a character
pub(crate) fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Symbols;

    impl SymbolLookup for Symbols {
        fn addr_to_str(&self, pc: u64) -> String {
            match pc {
                0x1000 => "libc.so.1`malloc+0x10".to_string(),
                0x2000 => "nomodule".to_string(),
                _ => format!("0x{pc:x}"),
            }
        }

        fn uaddr_to_str(&self, pid: u64, pc: u64) -> String {
            format!("proc{pid}`fn+a+0x{pc:x}")
        }
    }

    fn decode(action: ActionKind, bytes: &[u8]) -> Option<Value> {
        let size = u32::try_from(bytes.len()).unwrap();
        decode_record(&RecordDesc::new(action, size, 0), bytes, &Symbols).unwrap()
    }

    fn user(pid: u64, pc: u64) -> Vec<u8> {
        let mut bytes = pid.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&pc.to_ne_bytes());
        bytes
    }

    #[test]
    fn test_expression_widths() {
        assert_eq!(decode(ActionKind::DIFEXPR, &(-5i64).to_ne_bytes()), Some(Value::Int(-5)));
        assert_eq!(decode(ActionKind::DIFEXPR, &7u32.to_ne_bytes()), Some(Value::UInt(7)));
        assert_eq!(decode(ActionKind::DIFEXPR, &9u16.to_ne_bytes()), Some(Value::UInt(9)));
        assert_eq!(decode(ActionKind::DIFEXPR, &[200]), Some(Value::UInt(200)));
    }

    #[test]
    fn test_expression_string() {
        assert_eq!(decode(ActionKind::DIFEXPR, b"bash\0\0\0"), Some(Value::from("bash")));
        assert_eq!(decode(ActionKind::DIFEXPR, b"abc"), Some(Value::from("abc")));
    }

    #[test]
    fn test_module_extraction() {
        let pc = 0x1000u64.to_ne_bytes();
        assert_eq!(decode(ActionKind::MOD, &pc), Some(Value::from("libc.so.1")));
        let pc = 0x2000u64.to_ne_bytes();
        assert_eq!(decode(ActionKind::MOD, &pc), Some(Value::from("<unknown>")));
        assert_eq!(module_of("libc.so.1`malloc"), "libc.so.1");
    }

    #[test]
    fn test_symbol_strips_last_offset() {
        let pc = 0x1000u64.to_ne_bytes();
        assert_eq!(decode(ActionKind::SYM, &pc), Some(Value::from("libc.so.1`malloc")));
        assert_eq!(decode(ActionKind::USYM, &user(3, 0x44)), Some(Value::from("proc3`fn+a")));
        assert_eq!(symbol_of("plain"), "plain");
    }

    #[test]
    fn test_user_module_and_address() {
        assert_eq!(decode(ActionKind::UMOD, &user(3, 0x44)), Some(Value::from("proc3")));
        assert_eq!(decode(ActionKind::UADDR, &user(3, 0x44)), Some(Value::from("proc3`fn+a+0x44")));
    }

    #[test]
    fn test_short_user_record() {
        let record = RecordDesc::new(ActionKind::USYM, 8, 0);
        let err = decode_record(&record, &[0u8; 8], &Symbols).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedSize { actual: 8, .. }));
    }

    #[test]
    fn test_undecodable_actions() {
        assert_eq!(decode(ActionKind::PRINTF, &[]), None);
        assert_eq!(decode(ActionKind::STACK, &[0; 8]), None);
        assert!(is_deferred(ActionKind::PRINTF));
        assert!(!is_decodable(ActionKind::PRINTF));
    }

    #[test]
    fn test_truncate_keeps_char_boundary() {
        let mut s = "aé".to_string();
        truncate_at_boundary(&mut s, 2);
        assert_eq!(s, "a");
    }
}
