//! Aggregation walk loop: status, snapshot, then walk every tuple

use crate::decode::decode_tuple;
use crate::domain::{DecodeError, Value};
use crate::engine::{AggWalkAction, AggregateHandler, AggregationData, SymbolLookup, TraceEngine};
use crate::session::ErrorChannel;

/// Aggregate handler dispatching each decoded tuple to a host callback and
/// removing it from the engine's store
pub struct AggWalkLoop<'a> {
    callback: &'a mut dyn FnMut(&[Value]),
    failure: Option<DecodeError>,
    dispatched: usize,
}

impl<'a> AggWalkLoop<'a> {
    pub fn new(callback: &'a mut dyn FnMut(&[Value])) -> Self {
        Self { callback, failure: None, dispatched: 0 }
    }

    pub fn take_failure(&mut self) -> Option<DecodeError> {
        self.failure.take()
    }

    /// Tuples dispatched so far
    #[must_use]
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }
}

impl AggregateHandler for AggWalkLoop<'_> {
    fn on_tuple(&mut self, tuple: &AggregationData<'_>, symbols: &dyn SymbolLookup) -> AggWalkAction {
        match decode_tuple(tuple, symbols) {
            Ok(args) => {
                (self.callback)(&args);
                self.dispatched += 1;
                AggWalkAction::Remove
            }
            Err(err) => {
                self.failure = Some(err);
                AggWalkAction::Abort
            }
        }
    }
}

/// Walk the engine's current aggregation snapshot once
///
/// Returns the number of tuples dispatched, or `None` after recording the
/// failure in `errors`.
pub fn aggwalk<E: TraceEngine>(
    engine: &mut E,
    errors: &mut ErrorChannel,
    callback: &mut dyn FnMut(&[Value]),
) -> Option<usize> {
    errors.clear();

    if let Err(err) = engine.status() {
        errors.fail(format!("couldn't get status: {err}"));
        return None;
    }
    if let Err(err) = engine.aggregate_snap() {
        errors.fail(format!("couldn't snap aggregate: {err}"));
        return None;
    }

    let mut handler = AggWalkLoop::new(callback);
    let result = engine.aggregate_walk(&mut handler);

    if let Some(failure) = handler.take_failure() {
        errors.fail_decode(failure);
        return None;
    }
    if let Err(err) = result {
        errors.fail(format!("couldn't walk aggregate: {err}"));
        return None;
    }
    errors.succeed();
    Some(handler.dispatched())
}
