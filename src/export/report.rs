use std::io::Write;
use tracing::warn;

use crate::check::{CheckOutcome, CheckReport, CheckTally};

/// Write one check as it finishes: a status line, then indented details
pub fn write_check<W: Write>(report: &CheckReport, mut writer: W) -> std::io::Result<()> {
    match &report.outcome {
        CheckOutcome::Pass => writeln!(writer, "  ({}) {}", report.outcome.label(), report.name)?,
        CheckOutcome::PassWithNote(note) | CheckOutcome::Fail(note) => writeln!(
            writer,
            "  ({}) {}: {}",
            report.outcome.label(),
            report.name,
            note
        )?,
    }
    for line in &report.details {
        writeln!(writer, "      {}", line)?;
    }
    Ok(())
}

/// Write the closing `passed/executed` line
pub fn write_summary<W: Write>(tally: &CheckTally, mut writer: W) -> std::io::Result<()> {
    writeln!(writer)?;
    writeln!(
        writer,
        "Summary: {}/{} checks passed",
        tally.passed(),
        tally.executed()
    )
}

/// Live check output.
///
/// The first write error (stdout closed, broken pipe) is logged once and
/// silences the stream; the run itself carries on.
pub struct CheckStream<W> {
    writer: W,
    open: bool,
}

impl<W: Write> CheckStream<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn write_check(&mut self, report: &CheckReport) {
        if !self.open {
            return;
        }
        if let Err(e) = write_check(report, &mut self.writer).and_then(|_| self.writer.flush()) {
            warn!("Cannot write check output, suppressing the rest: {}", e);
            self.open = false;
        }
    }

    /// Close with the summary line, unless the stream already failed
    pub fn finish(mut self, tally: &CheckTally) -> std::io::Result<()> {
        if !self.open {
            return Ok(());
        }
        write_summary(tally, &mut self.writer)?;
        self.writer.flush()
    }
}
