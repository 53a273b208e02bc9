//! Harness configuration.
//!
//! The config file (`griddle.toml` by convention) describes how to boot the
//! kernel under test and how to turn its console output into a verdict. The
//! analyze rules in particular are ordered: later rules may overwrite the
//! status set by earlier ones, so rule order in the file is a contract.

use crate::{analyze::TestStatus, errors::ConfigParseError};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// The interrupt number used as the guest-to-host synchronization signal.
pub const INT_SYSCALL: u32 = 0x80;

/// The vmstate tag used for `savevm`/`loadvm`.
pub const VMSTATE_TAG: &str = "griddle";

/// Harness configuration, deserialized from a TOML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GriddleConfig {
    /// Number of test runs to keep in flight at once.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Per-test timeout, unless the test spec overrides it.
    #[serde(with = "humantime_serde", default = "default_test_timeout")]
    pub default_test_timeout: Duration,

    /// How long the bootstrap boot may take before the whole run is aborted.
    #[serde(with = "humantime_serde", default = "default_bootup_timeout")]
    pub bootup_timeout: Duration,

    /// Maximum gap between consecutive interrupts before the guest is
    /// presumed dead. Must be shorter than the test timeout to be useful.
    #[serde(with = "humantime_serde", default = "default_watchdog_grace")]
    pub watchdog_grace: Duration,

    /// Delay after the finish signal, letting buffered console output flush
    /// before teardown.
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Register value the guest reports once bootup is complete.
    pub bootup_code: u64,

    /// Register value the guest reports once a test program has finished.
    pub finished_code: u64,

    /// Marker prefix on console lines that mirror the test program's stdout.
    #[serde(default = "default_expect_prefix")]
    pub expect_prefix: String,

    /// The pristine disk image of the kernel under test.
    pub base_image: Utf8PathBuf,

    /// Directory for per-run working directories and the shared snapshot.
    pub scratch_dir: Utf8PathBuf,

    /// Upper bound on attempts per run, counting the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Ordered analyze rules.
    #[serde(default)]
    pub analyze: Vec<AnalyzeRule>,
}

impl GriddleConfig {
    /// Reads the config from `path`.
    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigParseError> {
        let text = std::fs::read_to_string(path).map_err(|error| ConfigParseError::Read {
            path: path.to_owned(),
            error,
        })?;
        toml::from_str(&text).map_err(|error| ConfigParseError::Parse {
            path: path.to_owned(),
            error,
        })
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_test_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_bootup_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_watchdog_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_expect_prefix() -> String {
    "##EXPECT##".to_owned()
}

fn default_max_attempts() -> usize {
    3
}

/// One analyze rule: which console lines to collect and what to do with them.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AnalyzeRule {
    /// The bucket this rule fills and consumes.
    pub name: String,

    /// The console tag this rule matches, or `ALL` for every line.
    pub scope: String,

    /// Capture pattern applied to the line's message. Group 1, if present,
    /// is the captured text; otherwise the whole match.
    #[serde(default, deserialize_with = "deserialize_regex_opt")]
    pub pattern: Option<Regex>,

    /// What to do with the bucket's lines.
    pub mode: RuleMode,

    /// Status to apply when the rule fires.
    #[serde(default)]
    pub set_status: Option<TestStatus>,
}

/// The behavior of an analyze rule.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Append every bucket line as a separate error.
    AddAsError,

    /// Append the bucket's lines joined as one fenced block.
    AddAsErrorJoined,

    /// Append only the first line of the bucket.
    ///
    /// The name is historical: the original harness took index 0 here
    /// despite the "last" in the name, and verdicts depend on it.
    AddAsErrorLast,

    /// Mark the run for retry, citing the bucket name.
    Retry,

    /// Compare reconstructed guest stdout against the spec's expectation.
    ExpectStdout,

    /// Check captured exit codes against the spec's expectation.
    ExitCodes,
}

fn deserialize_regex_opt<'de, D>(deserializer: D) -> Result<Option<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern: Option<String> = Option::deserialize(deserializer)?;
    pattern
        .map(|p| Regex::new(&p).map_err(serde::de::Error::custom))
        .transpose()
}
