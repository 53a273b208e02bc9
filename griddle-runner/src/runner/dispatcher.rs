//! The controller for the test runner.
//!
//! The dispatcher is the single owner of the result set. Executor futures
//! report through a channel; nothing else mutates run state, so requeue
//! bookkeeping never lives behind a shared lock.

use crate::{
    analyze::{TestResult, TestStatus},
    runner::{CompletedRun, RunReport, RunStats, RunnerEvent, TestRunId},
    spec::TestSpec,
    time::StopwatchStart,
};
use camino::Utf8PathBuf;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// One message from an executor future to the dispatcher.
#[derive(Clone, Debug)]
pub(super) enum ExecutorEvent {
    Started {
        id: TestRunId,
    },
    Retrying {
        id: TestRunId,
        attempt: usize,
        errors: Vec<String>,
    },
    Finished {
        id: TestRunId,
        spec: Arc<TestSpec>,
        result: TestResult,
        runtime: Duration,
        log_path: Utf8PathBuf,
    },
}

/// Context for the dispatcher.
pub(super) struct DispatcherContext<F> {
    callback: F,
    stats: RunStats,
    runs: Vec<CompletedRun>,
    stopwatch: StopwatchStart,
}

impl<F> DispatcherContext<F>
where
    F: FnMut(RunnerEvent),
{
    pub(super) fn new(callback: F, initial_run_count: usize) -> Self {
        Self {
            callback,
            stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            runs: Vec::new(),
            stopwatch: crate::time::stopwatch(),
        }
    }

    /// Records disabled specs up front: they are reported, never executed.
    pub(super) fn record_disabled(&mut self, specs: &[Arc<TestSpec>]) {
        for spec in specs {
            self.stats.disabled += 1;
            self.runs.push(CompletedRun {
                id: TestRunId {
                    name: spec.name.clone(),
                    run_index: 0,
                },
                spec: spec.clone(),
                result: TestResult::new(TestStatus::Disabled),
                runtime: Duration::ZERO,
                log_path: Utf8PathBuf::new(),
            });
        }
    }

    /// Runs the dispatcher to completion.
    ///
    /// The executor senders outlive this future (they are polled alongside
    /// it), so completion is tracked by counting terminal results rather
    /// than waiting for channel closure.
    pub(super) async fn run(&mut self, mut executor_rx: UnboundedReceiver<ExecutorEvent>) {
        (self.callback)(RunnerEvent::RunStarted {
            total_runs: self.stats.initial_run_count,
        });

        while self.stats.finished_count < self.stats.initial_run_count {
            match executor_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }

        (self.callback)(RunnerEvent::RunFinished { stats: self.stats });
    }

    fn handle_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Started { id } => {
                debug!(target: "griddle::runner", run = %id, "started");
                (self.callback)(RunnerEvent::TestStarted { id });
            }
            ExecutorEvent::Retrying { id, attempt, errors } => {
                debug!(target: "griddle::runner", run = %id, attempt, "retrying");
                self.stats.retried_attempts += 1;
                (self.callback)(RunnerEvent::TestAttemptRetried { id, attempt, errors });
            }
            ExecutorEvent::Finished {
                id,
                spec,
                result,
                runtime,
                log_path,
            } => {
                debug!(
                    target: "griddle::runner",
                    run = %id,
                    status = %result.status,
                    "finished"
                );
                self.stats.record_terminal(result.status);
                (self.callback)(RunnerEvent::TestFinished {
                    id: id.clone(),
                    status: result.status,
                    runtime,
                });
                self.runs.push(CompletedRun {
                    id,
                    spec,
                    result,
                    runtime,
                    log_path,
                });
            }
        }
    }

    pub(super) fn into_report(self) -> RunReport {
        let snapshot = self.stopwatch.snapshot();
        RunReport {
            stats: self.stats,
            runs: self.runs,
            started_at: snapshot.start_time,
            elapsed: snapshot.duration,
        }
    }
}
