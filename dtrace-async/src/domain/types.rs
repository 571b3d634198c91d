//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep aggregation variable IDs, probe identities and
//! decoded host values from being confused with one another in function
//! signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregation variable ID
///
/// Assigned by the engine when the program is compiled; stable for the life
/// of the enabling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub i64);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identity of a probe: `provider:module:function:name`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeDesc {
    pub provider: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub function: String,
    pub name: String,
}

impl ProbeDesc {
    pub fn new(
        provider: impl Into<String>,
        module: impl Into<String>,
        function: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            module: module.into(),
            function: function.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.provider, self.module, self.function, self.name)
    }
}

/// A decoded value handed to a host callback
///
/// Positional callback arguments are sequences of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of the value, if it is an integer that fits in `i64`
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Integer view of the value, if it is a non-negative integer
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Connection status of a session
///
/// Independent of the Busy/Consuming flags: a session can be `Ready` and busy
/// at the same time, but never `Failed` or `Closed` with an engine attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Open is still running on a worker
    Opening,
    /// Engine connection established
    Ready,
    /// Open failed, or a worker lost the engine
    Failed,
    /// Torn down by the host
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Opening => "consumer not yet ready",
            SessionStatus::Ready => "consumer ready",
            SessionStatus::Failed => "consumer failed to initialize",
            SessionStatus::Closed => "consumer already closed",
        };
        f.write_str(s)
    }
}
