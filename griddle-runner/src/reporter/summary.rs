//! The markdown run summary.

use crate::{errors::ReportError, runner::{CompletedRun, RunReport}};
use camino::Utf8Path;
use swrite::{SWrite, swrite, swriteln};

/// Renders the run summary as markdown.
///
/// Runs are sorted worst-first so failures sit at the top of the table, and
/// every failing run gets its errors listed together with the path of its
/// console log.
pub fn markdown_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let stats = &report.stats;

    swriteln!(out, "# Test summary");
    swriteln!(out);
    swriteln!(
        out,
        "{} runs in {:.2?}: {} passed, {} failed, {} panicked, {} timed out, \
         {} disabled, {} attempts retried",
        stats.finished_count,
        report.elapsed,
        stats.passed,
        stats.failed,
        stats.panicked,
        stats.timed_out,
        stats.disabled,
        stats.retried_attempts,
    );
    swriteln!(out);

    let mut runs: Vec<&CompletedRun> = report.runs.iter().collect();
    runs.sort_by(|a, b| (a.result.status, &a.id).cmp(&(b.result.status, &b.id)));

    swriteln!(out, "| {:<40} | {:<20} |", "Test run", "Result");
    swriteln!(out, "| {:-<40} | {:-<20} |", "", "");
    for run in &runs {
        swriteln!(out, "| {:<40} | {:<20} |", run.id, run.result.status);
    }

    let failing: Vec<&&CompletedRun> = runs
        .iter()
        .filter(|run| run.result.status.is_failure())
        .collect();
    if !failing.is_empty() {
        swriteln!(out);
        swriteln!(out, "## Errors");
        for run in failing {
            swriteln!(out);
            swriteln!(out, "### {} - {}", run.id, run.log_path);
            swriteln!(out);
            for error in &run.result.errors {
                if error.starts_with("```") {
                    // Fenced blocks carry their own newlines.
                    swrite!(out, "{error}");
                } else {
                    swriteln!(out, "- {error}");
                }
            }
        }
    }

    out
}

/// Writes the markdown summary to `path`.
pub fn write_summary(report: &RunReport, path: &Utf8Path) -> Result<(), ReportError> {
    std::fs::write(path, markdown_summary(report)).map_err(|error| ReportError::Io {
        path: path.to_owned(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analyze::{TestResult, TestStatus},
        runner::{RunStats, TestRunId},
        spec::TestSpec,
    };
    use camino::Utf8PathBuf;
    use chrono::Local;
    use std::{sync::Arc, time::Duration};

    fn completed(name: &str, status: TestStatus, errors: &[&str]) -> CompletedRun {
        CompletedRun {
            id: TestRunId {
                name: name.to_owned(),
                run_index: 0,
            },
            spec: Arc::new(TestSpec {
                name: name.to_owned(),
                category: "base".to_owned(),
                tags: Default::default(),
                expect_exit_codes: vec![0],
                expect_stdout: None,
                expect_timeout: false,
                timeout: None,
                disabled: false,
            }),
            result: TestResult {
                status,
                errors: errors.iter().map(|e| (*e).to_owned()).collect(),
                retry: false,
            },
            runtime: Duration::from_secs(1),
            log_path: Utf8PathBuf::from(format!("/scratch/{name}/out.log")),
        }
    }

    #[test]
    fn failures_sort_first_and_list_their_errors() {
        let report = RunReport {
            stats: RunStats {
                initial_run_count: 3,
                finished_count: 3,
                passed: 1,
                failed: 1,
                panicked: 1,
                ..RunStats::default()
            },
            runs: vec![
                completed("test_ok", TestStatus::Success, &[]),
                completed("test_bad", TestStatus::Failed, &["Unexpected exit code 1"]),
                completed(
                    "test_boom",
                    TestStatus::Panic,
                    &["KERNEL PANIC", "```\nframe 0\nframe 1\n```\n"],
                ),
            ],
            started_at: Local::now(),
            elapsed: Duration::from_secs(5),
        };

        let summary = markdown_summary(&report);

        let boom = summary.find("test_boom").expect("panic run listed");
        let bad = summary.find("test_bad").expect("failed run listed");
        let ok = summary.find("test_ok").expect("passing run listed");
        assert!(boom < bad && bad < ok, "rows not sorted worst-first:\n{summary}");

        assert!(summary.contains("### test_boom - /scratch/test_boom/out.log"));
        assert!(summary.contains("- KERNEL PANIC\n"));
        // The fenced block is passed through without a bullet.
        assert!(summary.contains("```\nframe 0\nframe 1\n```\n"));
        assert!(!summary.contains("- ```"));
        // Passing runs contribute no error section.
        assert!(!summary.contains("### test_ok"));
    }

    #[test]
    fn clean_run_has_no_error_section() {
        let report = RunReport {
            stats: RunStats {
                initial_run_count: 1,
                finished_count: 1,
                passed: 1,
                ..RunStats::default()
            },
            runs: vec![completed("test_ok", TestStatus::Success, &[])],
            started_at: Local::now(),
            elapsed: Duration::from_secs(1),
        };

        let summary = markdown_summary(&report);
        assert!(!summary.contains("## Errors"));
        assert!(summary.contains("1 passed"));
    }
}
