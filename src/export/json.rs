use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::check::{CheckReport, CheckTally};

/// Serializable record of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: u32,
    pub executed: u32,
    pub checks: Vec<CheckReport>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, checks: Vec<CheckReport>, tally: &CheckTally) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            started_at,
            finished_at: Utc::now(),
            passed: tally.passed(),
            executed: tally.executed(),
            checks,
        }
    }
}

/// Export a run to pretty-printed JSON
pub fn export_json<W: Write>(report: &RunReport, mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    Ok(())
}
