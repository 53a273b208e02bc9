//! The main test runner.

use crate::{
    analyze::{LogAnalyzer, LogParser, TestResult, TestStatus},
    config::{GriddleConfig, INT_SYSCALL, VMSTATE_TAG},
    runner::{
        RunReport, RunnerEvent, SNAPSHOT_IMAGE, TestRunId,
        dispatcher::{DispatcherContext, ExecutorEvent},
    },
    spec::TestSpec,
    time,
    vm::{Arch, CONSOLE_LOG, VmSession, VmSessionOptions},
};
use camino::{Utf8Path, Utf8PathBuf};
use future_queue::StreamExt;
use futures::prelude::*;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

/// Configuration for a test runner.
#[derive(Clone, Debug, Default)]
pub struct TestRunnerBuilder {
    jobs: Option<usize>,
    max_attempts: Option<usize>,
}

impl TestRunnerBuilder {
    /// Sets the number of test runs kept in flight at once, overriding the
    /// config file.
    pub fn set_jobs(&mut self, jobs: usize) -> &mut Self {
        self.jobs = Some(jobs);
        self
    }

    /// Sets the attempt cap per run, overriding the config file.
    pub fn set_max_attempts(&mut self, max_attempts: usize) -> &mut Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Creates a new test runner over the given specs.
    ///
    /// Disabled specs are split off here: they appear in the report but are
    /// never scheduled. Each enabled spec is scheduled `repeat` times.
    pub fn build<'cfg>(
        &self,
        config: &'cfg GriddleConfig,
        arch: Arch,
        specs: Vec<Arc<TestSpec>>,
        repeat: usize,
        snapshot: Utf8PathBuf,
    ) -> TestRunner<'cfg> {
        let (disabled, enabled): (Vec<_>, Vec<_>) =
            specs.into_iter().partition(|spec| spec.disabled);

        let repeat = repeat.max(1);
        let mut runs = Vec::with_capacity(enabled.len() * repeat);
        for run_index in 0..repeat {
            for spec in &enabled {
                runs.push(TestRun {
                    spec: spec.clone(),
                    run_index,
                });
            }
        }

        TestRunner {
            config,
            arch,
            snapshot,
            jobs: self.jobs.unwrap_or(config.threads).max(1),
            max_attempts: self.max_attempts.unwrap_or(config.max_attempts).max(1),
            runs,
            disabled,
        }
    }
}

/// One scheduled test run.
#[derive(Clone, Debug)]
pub struct TestRun {
    /// The spec this run executes.
    pub spec: Arc<TestSpec>,
    /// Which repetition this run is, starting at 0.
    pub run_index: usize,
}

impl TestRun {
    /// This run's identity.
    pub fn id(&self) -> TestRunId {
        TestRunId {
            name: self.spec.name.clone(),
            run_index: self.run_index,
        }
    }
}

/// Executes scheduled test runs against the shared base snapshot, with
/// bounded concurrency and bounded per-run retries.
pub struct TestRunner<'cfg> {
    config: &'cfg GriddleConfig,
    arch: Arch,
    snapshot: Utf8PathBuf,
    jobs: usize,
    max_attempts: usize,
    runs: Vec<TestRun>,
    disabled: Vec<Arc<TestSpec>>,
}

impl TestRunner<'_> {
    /// The number of scheduled (non-disabled) test runs.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Executes the runs to completion, forwarding progress events to
    /// `callback`, and returns the terminal result set.
    pub async fn execute<F>(mut self, callback: F) -> RunReport
    where
        F: FnMut(RunnerEvent),
    {
        let runs = std::mem::take(&mut self.runs);
        let disabled = std::mem::take(&mut self.disabled);
        let this = &self;
        execute_with(
            runs,
            disabled,
            self.jobs,
            self.max_attempts,
            callback,
            |run, attempt| this.run_attempt(run, attempt),
        )
        .await
    }

    /// Executes one attempt of one run: fresh overlay from the snapshot, a
    /// dedicated VM session, the finish-signal wait, then log analysis.
    ///
    /// Infrastructure failures before the test gets to run produce a
    /// retry-flagged NOT_RUN result rather than an error: the scheduler
    /// treats them like any other flaky attempt.
    async fn run_attempt(&self, run: TestRun, attempt: usize) -> AttemptOutcome {
        let stopwatch = time::stopwatch();
        let id = run.id();
        let work_dir = self.config.scratch_dir.join(id.dir_name());
        let log_path = work_dir.join(CONSOLE_LOG);

        debug!(target: "griddle::runner", run = %id, attempt, "attempt starting");

        let outcome = |result: TestResult| AttemptOutcome {
            result,
            runtime: stopwatch.snapshot().duration,
            log_path: log_path.clone(),
        };

        if let Err(error) = reset_dir(&work_dir).await {
            return outcome(infra_retry(format!(
                "Failed to prepare {work_dir}: {error}"
            )));
        }

        let overlay = work_dir.join(SNAPSHOT_IMAGE);
        if let Err(error) = tokio::fs::copy(&self.snapshot, &overlay).await {
            return outcome(infra_retry(format!(
                "Failed to copy snapshot image to {overlay}: {error}"
            )));
        }

        let options = VmSessionOptions {
            work_dir: work_dir.clone(),
            overlay,
            arch: self.arch,
            load_state: Some(VMSTATE_TAG.to_owned()),
            watchdog_grace: self.config.watchdog_grace,
            qemu_binary: None,
        };
        let mut session = match VmSession::open(options).await {
            Ok(session) => session,
            Err(error) => {
                return outcome(infra_retry(format!("VM failed to launch: {error}")));
            }
        };

        if !session.is_alive() {
            session.close().await;
            return outcome(infra_retry(
                "VM exited immediately after launch".to_owned(),
            ));
        }

        // The resumed shell is sitting at its prompt; type the test name.
        session.console_input(&format!("{}\n", run.spec.name)).await;

        let timeout = run.spec.timeout.unwrap_or(self.config.default_test_timeout);
        let expected = BTreeMap::from([(
            self.arch.return_register().to_owned(),
            self.config.finished_code,
        )]);
        let status = session
            .watchdog_mut()
            .wait_until(INT_SYSCALL, &expected, timeout)
            .await;

        // Let the serial file catch up with the guest's last output.
        tokio::time::sleep(self.config.settle_delay).await;
        session.close().await;

        let raw_log = match session.read_console_log().await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(target: "griddle::runner", run = %id, %error, "console log unreadable");
                String::new()
            }
        };

        let log_data = LogParser::new(&self.config.analyze).parse(&raw_log);
        let result = LogAnalyzer::new(&run.spec, &self.config.analyze, &self.config.expect_prefix)
            .analyze(&log_data, status);

        outcome(result)
    }
}

/// One attempt's result, as handed to the retry loop.
struct AttemptOutcome {
    result: TestResult,
    runtime: Duration,
    log_path: Utf8PathBuf,
}

fn infra_retry(message: String) -> TestResult {
    TestResult {
        status: TestStatus::NotRun,
        errors: vec![message],
        retry: true,
    }
}

/// Removes and recreates a per-run working directory.
async fn reset_dir(dir: &Utf8Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    tokio::fs::create_dir_all(dir).await
}

/// The scheduling core, generic over how an attempt is executed so the
/// scheduling behavior is testable without a VM.
async fn execute_with<F, A, Fut>(
    runs: Vec<TestRun>,
    disabled: Vec<Arc<TestSpec>>,
    jobs: usize,
    max_attempts: usize,
    callback: F,
    attempt_fn: A,
) -> RunReport
where
    F: FnMut(RunnerEvent),
    A: Fn(TestRun, usize) -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let (executor_tx, executor_rx) = mpsc::unbounded_channel();
    let mut dispatcher = DispatcherContext::new(callback, runs.len());
    dispatcher.record_disabled(&disabled);

    let attempt_fn = &attempt_fn;
    let exec_fut = stream::iter(runs)
        .map(|run| {
            let tx = executor_tx.clone();
            (1, move |_cx| run_to_completion(run, max_attempts, attempt_fn, tx))
        })
        .future_queue(jobs)
        .collect::<()>();

    let ((), ()) = tokio::join!(exec_fut, dispatcher.run(executor_rx));
    dispatcher.into_report()
}

/// Drives one run through its attempts until a terminal result.
async fn run_to_completion<A, Fut>(
    run: TestRun,
    max_attempts: usize,
    attempt_fn: &A,
    executor_tx: UnboundedSender<ExecutorEvent>,
) where
    A: Fn(TestRun, usize) -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let id = run.id();
    let _ = executor_tx.send(ExecutorEvent::Started { id: id.clone() });

    let mut attempt = 1;
    loop {
        let AttemptOutcome {
            mut result,
            runtime,
            log_path,
        } = attempt_fn(run.clone(), attempt).await;

        if result.retry {
            if attempt < max_attempts {
                attempt += 1;
                let errors = std::mem::take(&mut result.errors);
                let _ = executor_tx.send(ExecutorEvent::Retrying {
                    id: id.clone(),
                    attempt,
                    errors,
                });
                continue;
            }

            // Out of attempts: the last result stands, minus the retry flag.
            // A run that kept asking for retries is not a pass.
            result.retry = false;
            if !result.status.is_failure() {
                result.status = TestStatus::Failed;
            }
            result
                .errors
                .push(format!("Giving up after {max_attempts} attempts"));
        }

        let _ = executor_tx.send(ExecutorEvent::Finished {
            id,
            spec: run.spec.clone(),
            result,
            runtime,
            log_path,
        });
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec_named(name: &str) -> Arc<TestSpec> {
        Arc::new(TestSpec {
            name: name.to_owned(),
            category: "base".to_owned(),
            tags: Default::default(),
            expect_exit_codes: vec![0],
            expect_stdout: None,
            expect_timeout: false,
            timeout: None,
            disabled: false,
        })
    }

    fn runs_named(names: &[&str]) -> Vec<TestRun> {
        names
            .iter()
            .map(|name| TestRun {
                spec: spec_named(name),
                run_index: 0,
            })
            .collect()
    }

    fn outcome(result: TestResult) -> AttemptOutcome {
        AttemptOutcome {
            result,
            runtime: Duration::from_millis(1),
            log_path: Utf8PathBuf::new(),
        }
    }

    #[test]
    fn builder_expands_repeats_and_splits_disabled() {
        let config: GriddleConfig = toml::from_str(indoc! {r#"
            bootup-code = 1
            finished-code = 2
            base-image = "kernel.qcow2"
            scratch-dir = "/tmp/griddle"
        "#})
        .expect("config parses");

        let mut off = TestSpec::clone(&spec_named("c"));
        off.disabled = true;
        let specs = vec![spec_named("a"), spec_named("b"), Arc::new(off)];

        let runner = TestRunnerBuilder::default().build(
            &config,
            Arch::X86_64,
            specs,
            2,
            Utf8PathBuf::from("snapshot.qcow2"),
        );

        assert_eq!(runner.run_count(), 4);
        assert_eq!(runner.disabled.len(), 1);
        assert_eq!(runner.runs[0].id().to_string(), "a");
        assert_eq!(runner.runs[2].id().to_string(), "a Run 1");
        assert_eq!(runner.max_attempts, 3);
    }

    #[tokio::test]
    async fn concurrency_stays_within_jobs() {
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let current = &current;
        let peak = &peak;

        let report = execute_with(
            runs_named(&["t0", "t1", "t2", "t3", "t4", "t5"]),
            Vec::new(),
            2,
            1,
            |_| {},
            |_run, _attempt| async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                outcome(TestResult::new(TestStatus::Success))
            },
        )
        .await;

        assert_eq!(report.stats.passed, 6);
        assert_eq!(report.stats.finished_count, 6);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency was {peak}");
    }

    #[tokio::test]
    async fn retry_reexecutes_until_a_clean_attempt() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let mut events = Vec::new();

        let report = execute_with(
            runs_named(&["flaky"]),
            Vec::new(),
            1,
            3,
            |event| events.push(event),
            |_run, attempt| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    outcome(TestResult {
                        status: TestStatus::Success,
                        errors: vec!["Retry caused by flaky_marker".to_owned()],
                        retry: true,
                    })
                } else {
                    outcome(TestResult::new(TestStatus::Success))
                }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.stats.passed, 1);
        assert_eq!(report.stats.retried_attempts, 2);

        let run = &report.runs[0];
        assert_eq!(run.result.status, TestStatus::Success);
        assert!(!run.result.retry);
        // The discarded attempts' errors travel with the retry events, not
        // the terminal result.
        assert_eq!(run.result.errors, Vec::<String>::new());

        assert!(matches!(events[0], RunnerEvent::RunStarted { total_runs: 1 }));
        assert!(matches!(events[1], RunnerEvent::TestStarted { .. }));
        assert!(matches!(
            &events[2],
            RunnerEvent::TestAttemptRetried { attempt: 2, errors, .. }
                if errors == &["Retry caused by flaky_marker"]
        ));
        assert!(matches!(
            events[3],
            RunnerEvent::TestAttemptRetried { attempt: 3, .. }
        ));
        assert!(matches!(
            events[4],
            RunnerEvent::TestFinished {
                status: TestStatus::Success,
                ..
            }
        ));
        assert!(matches!(events[5], RunnerEvent::RunFinished { .. }));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let report = execute_with(
            runs_named(&["always_flaky"]),
            Vec::new(),
            1,
            3,
            |_| {},
            |_run, _attempt| async move {
                outcome(TestResult {
                    status: TestStatus::Success,
                    errors: vec!["Retry caused by flaky_marker".to_owned()],
                    retry: true,
                })
            },
        )
        .await;

        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.retried_attempts, 2);
        assert!(!report.is_success());

        let run = &report.runs[0];
        assert_eq!(run.result.status, TestStatus::Failed);
        assert!(!run.result.retry);
        assert_eq!(
            run.result.errors,
            [
                "Retry caused by flaky_marker",
                "Giving up after 3 attempts"
            ]
        );
    }

    #[tokio::test]
    async fn infrastructure_failures_that_persist_fail_the_run() {
        let report = execute_with(
            runs_named(&["no_vm"]),
            Vec::new(),
            1,
            2,
            |_| {},
            |_run, _attempt| async move {
                outcome(infra_retry("VM failed to launch: spawn failed".to_owned()))
            },
        )
        .await;

        let run = &report.runs[0];
        // NOT_RUN is not a pass once retries are exhausted.
        assert_eq!(run.result.status, TestStatus::Failed);
        assert_eq!(
            run.result.errors,
            [
                "VM failed to launch: spawn failed",
                "Giving up after 2 attempts"
            ]
        );
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn disabled_specs_are_reported_without_execution() {
        let mut off = TestSpec::clone(&spec_named("test_off"));
        off.disabled = true;

        let report = execute_with(
            Vec::new(),
            vec![Arc::new(off)],
            1,
            1,
            |_| {},
            |_run, _attempt| async move { outcome(TestResult::new(TestStatus::Success)) },
        )
        .await;

        assert_eq!(report.stats.disabled, 1);
        assert_eq!(report.stats.finished_count, 0);
        assert!(report.is_success());
        assert_eq!(report.runs[0].result.status, TestStatus::Disabled);
    }
}
