//! JUnit XML report generation.

use crate::{analyze::TestStatus, errors::ReportError, runner::RunReport};
use camino::Utf8Path;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::fs::File;

/// Writes the run report as JUnit XML to `path`.
///
/// Runs are grouped into test suites by spec category. Panics map to JUnit
/// errors, other failing statuses to JUnit failures, and disabled specs to
/// skipped cases.
pub fn write_junit(report: &RunReport, path: &Utf8Path) -> Result<(), ReportError> {
    let mut junit = Report::new("griddle");
    junit
        .set_timestamp(report.started_at.fixed_offset())
        .set_time(report.elapsed);

    let mut test_suites: IndexMap<&str, TestSuite> = IndexMap::new();
    for run in &report.runs {
        let mut testcase_status = match run.result.status {
            TestStatus::Success => TestCaseStatus::success(),
            TestStatus::Disabled => TestCaseStatus::skipped(),
            TestStatus::Panic => TestCaseStatus::non_success(NonSuccessKind::Error),
            TestStatus::Failed | TestStatus::Timeout | TestStatus::NotRun => {
                TestCaseStatus::non_success(NonSuccessKind::Failure)
            }
        };
        if run.result.status != TestStatus::Success {
            testcase_status.set_type(run.result.status.to_string());
            if !run.result.errors.is_empty() {
                testcase_status.set_message(run.result.errors.join("\n"));
            }
        }

        let mut testcase = TestCase::new(run.id.to_string(), testcase_status);
        testcase.set_time(run.runtime);

        test_suites
            .entry(run.spec.category.as_str())
            .or_insert_with(|| TestSuite::new(run.spec.category.clone()))
            .add_test_case(testcase);
    }
    junit.add_test_suites(test_suites.into_values());

    let file = File::create(path).map_err(|error| ReportError::Io {
        path: path.to_owned(),
        error,
    })?;
    junit.serialize(file).map_err(ReportError::Junit)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analyze::TestResult,
        runner::{CompletedRun, RunStats, TestRunId},
        spec::TestSpec,
    };
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;
    use chrono::Local;
    use std::{sync::Arc, time::Duration};

    fn completed(name: &str, category: &str, status: TestStatus) -> CompletedRun {
        CompletedRun {
            id: TestRunId {
                name: name.to_owned(),
                run_index: 0,
            },
            spec: Arc::new(TestSpec {
                name: name.to_owned(),
                category: category.to_owned(),
                tags: Default::default(),
                expect_exit_codes: vec![0],
                expect_stdout: None,
                expect_timeout: false,
                timeout: None,
                disabled: status == TestStatus::Disabled,
            }),
            result: TestResult {
                status,
                errors: if status.is_failure() {
                    vec!["Unexpected exit code 1".to_owned()]
                } else {
                    Vec::new()
                },
                retry: false,
            },
            runtime: Duration::from_secs(2),
            log_path: Utf8PathBuf::new(),
        }
    }

    #[test]
    fn suites_group_by_category() {
        let report = RunReport {
            stats: RunStats::default(),
            runs: vec![
                completed("test_ok", "base", TestStatus::Success),
                completed("test_bad", "base", TestStatus::Failed),
                completed("test_boom", "pressure", TestStatus::Panic),
                completed("test_off", "pressure", TestStatus::Disabled),
            ],
            started_at: Local::now(),
            elapsed: Duration::from_secs(9),
        };

        let dir = Utf8TempDir::new().expect("tempdir");
        let path = dir.path().join("junit.xml");
        write_junit(&report, &path).expect("junit written");

        let xml = std::fs::read_to_string(&path).expect("junit readable");
        assert!(xml.contains(r#"<testsuite name="base""#), "{xml}");
        assert!(xml.contains(r#"<testsuite name="pressure""#), "{xml}");
        assert!(xml.contains(r#"<testcase name="test_boom""#), "{xml}");
        assert!(xml.contains("<error"), "{xml}");
        assert!(xml.contains("<failure"), "{xml}");
        assert!(xml.contains("<skipped"), "{xml}");
        assert!(xml.contains("Unexpected exit code 1"), "{xml}");
    }

    #[test]
    fn write_to_unwritable_path_is_an_io_error() {
        let report = RunReport {
            stats: RunStats::default(),
            runs: Vec::new(),
            started_at: Local::now(),
            elapsed: Duration::ZERO,
        };

        let err = write_junit(&report, Utf8Path::new("/nonexistent/dir/junit.xml")).unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }), "got {err:?}");
    }
}
