//! Check orchestration: turns probe results into pass/fail outcomes and
//! keeps the run's pass tally.
//!
//! Checks run strictly one after another. Each one receives the tally by
//! `&mut` and records its own outcome exactly once.

mod checks;
mod context;
mod plan;

pub use checks::*;
pub use context::CheckContext;
pub use plan::{PlannedCheck, build_plan, run_plan};

use serde::Serialize;

/// Verdict of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    /// Counted as a pass, with something worth a second look
    PassWithNote(String),
    Fail(String),
}

impl CheckOutcome {
    pub fn is_pass(&self) -> bool {
        !matches!(self, CheckOutcome::Fail(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            CheckOutcome::Pass | CheckOutcome::PassWithNote(_) => "Passed",
            CheckOutcome::Fail(_) => "Failed",
        }
    }
}

/// Increment-only count of passing checks for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckTally {
    passed: u32,
    executed: u32,
}

impl CheckTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one executed check, and one pass if it passed
    pub fn record(&mut self, outcome: &CheckOutcome) {
        self.executed += 1;
        if outcome.is_pass() {
            self.passed += 1;
        }
    }

    pub fn passed(&self) -> u32 {
        self.passed
    }

    pub fn executed(&self) -> u32 {
        self.executed
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.executed
    }
}

/// Result of one check as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub name: String,
    pub outcome: CheckOutcome,
    /// Per-target lines (endpoints, interfaces, health output)
    pub details: Vec<String>,
}
