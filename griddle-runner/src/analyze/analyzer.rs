//! Rule-driven analysis of bucketed log data.

use crate::{
    analyze::LogData,
    config::{AnalyzeRule, RuleMode},
    spec::TestSpec,
    vm::WatchdogStatus,
};
use serde::Deserialize;
use std::fmt;

/// The outcome of a test run.
///
/// Variant order doubles as report sort order: the worst outcomes sort first.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    /// The kernel panicked during the run.
    Panic,
    /// The run completed but violated an expectation.
    Failed,
    /// The run hit its timeout without expecting to.
    Timeout,
    /// The run completed and met every expectation.
    Success,
    /// The spec is disabled; the test was never executed.
    Disabled,
    /// No result has been produced yet.
    NotRun,
}

impl TestStatus {
    /// Whether this status makes the overall run fail.
    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Panic | TestStatus::Failed | TestStatus::Timeout)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestStatus::Panic => "PANIC",
            TestStatus::Failed => "FAILED",
            TestStatus::Timeout => "TIMEOUT",
            TestStatus::Success => "SUCCESS",
            TestStatus::Disabled => "DISABLED",
            TestStatus::NotRun => "NOT_RUN",
        };
        f.write_str(name)
    }
}

/// The result of one test run.
///
/// Replaced wholesale when a run is retried; never merged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResult {
    /// The terminal status.
    pub status: TestStatus,
    /// Accumulated errors, in rule order.
    pub errors: Vec<String>,
    /// Signals the scheduler to discard this result and resubmit the run.
    pub retry: bool,
}

impl TestResult {
    /// Creates a result with the given status and no errors.
    pub fn new(status: TestStatus) -> Self {
        Self {
            status,
            errors: Vec::new(),
            retry: false,
        }
    }

    fn set_status_opt(&mut self, status: Option<TestStatus>) {
        if let Some(status) = status {
            self.status = status;
        }
    }

    /// Appends `errors` and applies `status` — but only if there is at least
    /// one error to append.
    fn add_errors<I, S>(&mut self, errors: I, status: Option<TestStatus>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.errors.len();
        self.errors.extend(errors.into_iter().map(Into::into));
        if self.errors.len() > before {
            self.set_status_opt(status);
        }
    }

    /// Reconstructs the guest's stdout from marker-prefixed console lines and
    /// compares it against the spec's expectation.
    fn check_expect_stdout(
        &mut self,
        lines: &[String],
        prefix: &str,
        spec: &TestSpec,
        status: Option<TestStatus>,
    ) {
        let Some(expected) = &spec.expect_stdout else {
            return;
        };

        let actual: String = lines
            .iter()
            .filter_map(|line| line.strip_prefix(prefix))
            .map(strip_line_terminator)
            .collect();

        if &actual != expected {
            self.errors.push(format!("Expected output:\n{expected:?}"));
            self.errors.push(format!("Actual output:\n{actual:?}"));
            self.set_status_opt(status);
        }
    }

    /// Checks captured exit-code tokens against the spec's expectation.
    ///
    /// A panic status dominates: exit-code mismatches must not downgrade it.
    /// Missing exit codes demote only a SUCCESS status to FAILED (the error
    /// line is appended regardless). A token that fails to parse is a hard
    /// error: FAILED plus retry, and the rule is abandoned.
    fn check_exit_codes(
        &mut self,
        tokens: &[String],
        expect_exit_codes: &[i32],
        status: Option<TestStatus>,
    ) {
        if self.status == TestStatus::Panic {
            return;
        }

        if tokens.is_empty() {
            self.errors.push("Missing exit code!".to_owned());
            if self.status == TestStatus::Success {
                self.status = TestStatus::Failed;
            }
            return;
        }

        let mut unexpected = false;
        for token in tokens {
            let code: i32 = match token.trim().parse() {
                Ok(code) => code,
                Err(_) => {
                    self.errors.push(format!("Failed to parse exit code {token}"));
                    self.status = TestStatus::Failed;
                    self.retry = true;
                    return;
                }
            };

            if !expect_exit_codes.contains(&code) {
                self.errors.push(format!("Unexpected exit code {code}"));
                unexpected = true;
            }
        }

        if unexpected {
            let expected = expect_exit_codes
                .iter()
                .map(|code| code.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.errors.push(format!("Expected exit code(s): {expected}"));
            self.set_status_opt(status);
        }
    }
}

/// Strips one trailing line terminator, if present. The final captured line
/// may lack one.
fn strip_line_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Applies the ordered rule set to bucketed log data, producing a verdict.
///
/// Rule order is a first-class contract: later rules may overwrite the
/// status set by earlier ones, except where explicitly guarded (panic
/// dominance in the exit-code check).
pub struct LogAnalyzer<'a> {
    spec: &'a TestSpec,
    rules: &'a [AnalyzeRule],
    expect_prefix: &'a str,
}

impl<'a> LogAnalyzer<'a> {
    /// Creates an analyzer for one spec and rule set.
    pub fn new(spec: &'a TestSpec, rules: &'a [AnalyzeRule], expect_prefix: &'a str) -> Self {
        Self {
            spec,
            rules,
            expect_prefix,
        }
    }

    /// Produces the verdict for one run.
    pub fn analyze(&self, log_data: &LogData, watchdog_status: WatchdogStatus) -> TestResult {
        let mut result = TestResult::new(TestStatus::Success);

        if self.spec.disabled {
            result.status = TestStatus::Disabled;
            return result;
        }

        if watchdog_status == WatchdogStatus::Stopped {
            result.add_errors(["No further interrupts arrived, VM presumed dead"], None);
        }

        if watchdog_status == WatchdogStatus::Timeout && !self.spec.expect_timeout {
            result.add_errors(["Test execution timed out"], Some(TestStatus::Timeout));
        }

        static EMPTY: Vec<String> = Vec::new();
        for rule in self.rules {
            // A rule whose bucket is absent is not an error: it just sees an
            // empty bucket.
            let lines = log_data.get(&rule.name).unwrap_or(&EMPTY);

            match rule.mode {
                RuleMode::AddAsError => {
                    result.add_errors(lines.iter().cloned(), rule.set_status);
                }
                RuleMode::AddAsErrorJoined => {
                    if !lines.is_empty() {
                        let block = format!("```\n{}\n```\n", lines.join("\n"));
                        result.add_errors([block], rule.set_status);
                    }
                }
                RuleMode::AddAsErrorLast => {
                    // Historical: takes the first line despite the name.
                    result.add_errors(lines.first().cloned(), rule.set_status);
                }
                RuleMode::Retry => {
                    if !lines.is_empty() {
                        result.add_errors([format!("Retry caused by {}", rule.name)], None);
                        result.retry = true;
                    }
                }
                RuleMode::ExpectStdout => {
                    result.check_expect_stdout(lines, self.expect_prefix, self.spec, rule.set_status);
                }
                RuleMode::ExitCodes => {
                    result.check_exit_codes(lines, &self.spec.expect_exit_codes, rule.set_status);
                }
            }
        }

        result
    }
}
