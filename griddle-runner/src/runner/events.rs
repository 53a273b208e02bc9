//! Events emitted while a test run executes, and the terminal result set.

use crate::{
    analyze::{TestResult, TestStatus},
    spec::TestSpec,
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use std::{fmt, sync::Arc, time::Duration};

/// Identity of one test run: a spec plus a run index distinguishing repeated
/// executions. A retried run keeps its identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestRunId {
    /// The test name.
    pub name: String,
    /// Which repetition this run is, starting at 0.
    pub run_index: usize,
}

impl TestRunId {
    /// Directory-safe form of this identity.
    pub fn dir_name(&self) -> String {
        if self.run_index > 0 {
            format!("{}-run-{}", self.name, self.run_index)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for TestRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.run_index > 0 {
            write!(f, "{} Run {}", self.name, self.run_index)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Events forwarded to the caller's callback during a run.
#[derive(Clone, Debug)]
pub enum RunnerEvent {
    /// The run has started.
    RunStarted {
        /// Number of scheduled (non-disabled) test runs.
        total_runs: usize,
    },

    /// One test run started its first attempt.
    TestStarted {
        /// The run.
        id: TestRunId,
    },

    /// An attempt asked for a retry; the run is being re-executed.
    TestAttemptRetried {
        /// The run.
        id: TestRunId,
        /// The attempt about to start (the first attempt is 1).
        attempt: usize,
        /// Errors of the discarded attempt.
        errors: Vec<String>,
    },

    /// A test run reached a terminal result.
    TestFinished {
        /// The run.
        id: TestRunId,
        /// Its terminal status.
        status: TestStatus,
        /// Wall-clock time of the last attempt.
        runtime: Duration,
    },

    /// All runs have terminal results.
    RunFinished {
        /// Final counters.
        stats: RunStats,
    },
}

/// Counters over a whole run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Scheduled (non-disabled) test runs.
    pub initial_run_count: usize,
    /// Runs with a terminal result.
    pub finished_count: usize,
    /// Terminal SUCCESS results.
    pub passed: usize,
    /// Terminal FAILED results.
    pub failed: usize,
    /// Terminal PANIC results.
    pub panicked: usize,
    /// Terminal TIMEOUT results.
    pub timed_out: usize,
    /// Disabled specs, reported but never executed.
    pub disabled: usize,
    /// Attempts that were discarded and re-executed.
    pub retried_attempts: usize,
}

impl RunStats {
    /// Whether the whole run passes: no failure-status terminal results.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.panicked == 0 && self.timed_out == 0
    }

    pub(super) fn record_terminal(&mut self, status: TestStatus) {
        self.finished_count += 1;
        match status {
            TestStatus::Success => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Panic => self.panicked += 1,
            TestStatus::Timeout => self.timed_out += 1,
            TestStatus::Disabled | TestStatus::NotRun => {}
        }
    }
}

/// A run with its terminal result.
#[derive(Clone, Debug)]
pub struct CompletedRun {
    /// The run's identity.
    pub id: TestRunId,
    /// The spec this run executed.
    pub spec: Arc<TestSpec>,
    /// The terminal result. Never retry-flagged.
    pub result: TestResult,
    /// Wall-clock time of the last attempt.
    pub runtime: Duration,
    /// Where the last attempt's console log lives, for post-mortem reading.
    pub log_path: Utf8PathBuf,
}

/// The terminal result set of a whole run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Final counters.
    pub stats: RunStats,
    /// Every run with its terminal result, including disabled specs.
    pub runs: Vec<CompletedRun>,
    /// When the run started.
    pub started_at: DateTime<Local>,
    /// Wall-clock time of the whole run.
    pub elapsed: Duration,
}

impl RunReport {
    /// Whether the whole run passes.
    pub fn is_success(&self) -> bool {
        self.stats.is_success()
    }
}
