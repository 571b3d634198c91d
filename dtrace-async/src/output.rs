//! Record and aggregation display for the command-line consumer
//!
//! Text mode prints one line per record and, once tracing ends, every
//! aggregation grouped by variable, with histograms drawn as
//! distributions. JSON mode prints one object per record or tuple as it
//! arrives.

// Distribution bars scale counts for display only
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::domain::{Value, VarId};
use crate::translate::{demangle_args, AggregateValue, AggregationEntry, Bucket, ProbeEvent};

/// Width of a distribution bar at 100%
const BAR_WIDTH: usize = 40;

/// Prints decoded callback arguments to a writer
pub struct Printer<W: Write> {
    out: W,
    json: bool,
    demangle: bool,
    aggregations: BTreeMap<VarId, Vec<AggregationEntry>>,
    pub records: u64,
    pub tuples: u64,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, json: bool, demangle: bool) -> Self {
        Self { out, json, demangle, aggregations: BTreeMap::new(), records: 0, tuples: 0 }
    }

    /// Handle one consume callback
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn record(&mut self, args: &[Value]) -> io::Result<()> {
        let mut args = args.to_vec();
        if self.demangle {
            demangle_args(&mut args);
        }
        let Some(event) = ProbeEvent::from_args(&args) else {
            return Ok(());
        };
        self.records += 1;

        if self.json {
            return self.json_line(&event);
        }
        match &event.data {
            Some(Value::Str(text)) => {
                writeln!(self.out, "{:<40} {}", event.probe.to_string(), text.trim_end_matches('\n'))
            }
            Some(value) => writeln!(self.out, "{:<40} {value}", event.probe.to_string()),
            None => Ok(()),
        }
    }

    /// Handle one aggregation callback; text output is deferred to
    /// [`Printer::flush_aggregations`]
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn aggregation(&mut self, args: &[Value]) -> io::Result<()> {
        let mut args = args.to_vec();
        if self.demangle {
            demangle_args(&mut args);
        }
        let Some(entry) = AggregationEntry::from_args(&args) else {
            return Ok(());
        };
        self.tuples += 1;

        if self.json {
            return self.json_line(&entry);
        }
        self.aggregations.entry(entry.varid).or_default().push(entry);
        Ok(())
    }

    /// Print and forget every aggregation collected so far
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn flush_aggregations(&mut self) -> io::Result<()> {
        for (varid, entries) in std::mem::take(&mut self.aggregations) {
            writeln!(self.out, "\n{varid}")?;
            for entry in entries {
                self.print_entry(&entry)?;
            }
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn json_line(&mut self, value: &impl serde::Serialize) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        writeln!(self.out)
    }

    fn print_entry(&mut self, entry: &AggregationEntry) -> io::Result<()> {
        let keys = entry.keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        match &entry.value {
            AggregateValue::Scalar(value) => {
                writeln!(self.out, "  {keys:<40} {:>12}", value.to_string())
            }
            AggregateValue::Buckets(buckets) => {
                if !keys.is_empty() {
                    writeln!(self.out, "  {keys}")?;
                }
                self.print_distribution(buckets)
            }
            AggregateValue::LogLinear { factor, low, high, nsteps, buckets } => {
                writeln!(
                    self.out,
                    "  {keys} (factor {factor}, magnitude {low}..{high}, {nsteps} steps)"
                )?;
                for (index, count) in buckets {
                    writeln!(self.out, "  {index:>16} {count:>12}")?;
                }
                Ok(())
            }
        }
    }

    fn print_distribution(&mut self, buckets: &[Bucket]) -> io::Result<()> {
        let total: i64 = buckets.iter().map(|b| b.count).sum();
        writeln!(
            self.out,
            "  {:>16}  {:-^width$} count",
            "value",
            " Distribution ",
            width = BAR_WIDTH
        )?;
        for bucket in buckets {
            let filled = if total > 0 {
                ((bucket.count as f64 / total as f64) * BAR_WIDTH as f64).round() as usize
            } else {
                0
            };
            writeln!(
                self.out,
                "  {:>16} |{:<width$} {}",
                bucket.range.0,
                "@".repeat(filled.min(BAR_WIDTH)),
                bucket.count,
                width = BAR_WIDTH
            )?;
        }
        Ok(())
    }
}
