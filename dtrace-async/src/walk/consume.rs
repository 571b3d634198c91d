//! Consume loop: one drain of buffered probe records

use dtrace_async_common::RecordDesc;

use super::probe_args;
use crate::decode::{decode_record, is_deferred};
use crate::domain::{DecodeError, Value};
use crate::engine::{
    BufferedAction, BufferedOutput, ConsumeAction, ConsumeHandler, ProbeData, SymbolLookup,
    TraceEngine, WorkStatus,
};
use crate::session::ErrorChannel;

/// Consume handler dispatching positional arguments to a host callback
///
/// Per record: `[provider, module, function, name, value]`. At the end of
/// each firing: `[provider, module, function, name]`. Per formatted
/// `printf()`: `[provider, module, function, name, text]`.
pub struct ConsumeLoop<'a> {
    callback: &'a mut dyn FnMut(&[Value]),
    failure: Option<DecodeError>,
}

impl<'a> ConsumeLoop<'a> {
    pub fn new(callback: &'a mut dyn FnMut(&[Value])) -> Self {
        Self { callback, failure: None }
    }

    /// Decode failure that aborted the drain, if any
    pub fn take_failure(&mut self) -> Option<DecodeError> {
        self.failure.take()
    }
}

impl ConsumeHandler for ConsumeLoop<'_> {
    fn on_record(
        &mut self,
        probe: &ProbeData<'_>,
        record: Option<&RecordDesc>,
        symbols: &dyn SymbolLookup,
    ) -> ConsumeAction {
        let Some(record) = record else {
            (self.callback)(&probe_args(probe.probe, 0));
            return ConsumeAction::This;
        };

        let value = match decode_record(record, probe.data, symbols) {
            Ok(Some(value)) => value,
            Ok(None) if is_deferred(record.action) => return ConsumeAction::This,
            Ok(None) => {
                self.failure = Some(DecodeError::UnsupportedRecord {
                    action: record.action,
                    probe: probe.probe.to_string(),
                });
                return ConsumeAction::Abort;
            }
            Err(err) => {
                self.failure = Some(err);
                return ConsumeAction::Abort;
            }
        };

        let mut args = probe_args(probe.probe, 1);
        args.push(value);
        (self.callback)(&args);
        ConsumeAction::This
    }

    fn on_buffered(&mut self, output: &BufferedOutput<'_>) -> BufferedAction {
        if !output.record.is_some_and(|r| is_deferred(r.action)) {
            return BufferedAction::Ok;
        }
        let mut args = probe_args(output.probe, 1);
        args.push(Value::from(output.text));
        (self.callback)(&args);
        BufferedAction::Ok
    }
}

/// Drain the engine once
///
/// Returns the drain status, or `None` after recording the failure in
/// `errors`.
pub fn consume<E: TraceEngine>(
    engine: &mut E,
    errors: &mut ErrorChannel,
    callback: &mut dyn FnMut(&[Value]),
) -> Option<WorkStatus> {
    errors.clear();
    let mut handler = ConsumeLoop::new(callback);
    let result = engine.work(&mut handler);

    if let Some(failure) = handler.take_failure() {
        errors.fail_decode(failure);
        return None;
    }
    match result {
        Ok(status) => {
            errors.succeed();
            Some(status)
        }
        Err(err) => {
            errors.fail(format!("couldn't consume trace data: {err}"));
            None
        }
    }
}
