//! # Consume and Aggregation Walk Loops
//!
//! Drive the engine's data-walk primitives on the calling thread. Each pass
//! decodes records or tuples as the engine hands them over and dispatches one
//! host callback per logical unit, in the engine's order, before returning.
//!
//! Both loops report into an [`ErrorChannel`](crate::session::ErrorChannel):
//! a decode failure recorded by a handler takes precedence over the engine
//! error the abort produces.

mod aggwalk;
mod consume;

pub use aggwalk::{aggwalk, AggWalkLoop};
pub use consume::{consume, ConsumeLoop};

use crate::domain::{ProbeDesc, Value};

/// Leading callback arguments identifying a probe
fn probe_args(probe: &ProbeDesc, extra: usize) -> Vec<Value> {
    let mut args = Vec::with_capacity(4 + extra);
    args.push(Value::from(probe.provider.as_str()));
    args.push(Value::from(probe.module.as_str()));
    args.push(Value::from(probe.function.as_str()));
    args.push(Value::from(probe.name.as_str()));
    args
}
