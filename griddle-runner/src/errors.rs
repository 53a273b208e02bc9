//! Errors produced by griddle.

use crate::vm::WatchdogStatus;
use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

/// An error that occurred while reading or parsing the harness config.
#[derive(Debug, Error)]
pub enum ConfigParseError {
    /// The config file could not be read.
    #[error("failed to read griddle config at `{path}`")]
    Read {
        /// The path to the config file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The config file could not be deserialized.
    #[error("failed to parse griddle config at `{path}`")]
    Parse {
        /// The path to the config file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },
}

/// An error that occurred while discovering test specifications.
#[derive(Debug, Error)]
pub enum SpecParseError {
    /// The test source directory could not be listed.
    #[error("failed to list test sources in `{path}`")]
    ListDir {
        /// The directory that was being listed.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A test source file could not be read.
    #[error("failed to read test source `{path}`")]
    Read {
        /// The path to the test source.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A metadata block was present but malformed.
    #[error("failed to parse test metadata in `{path}`")]
    Metadata {
        /// The path to the test source.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },
}

/// An error that occurred while launching a VM session.
///
/// Launch errors are treated as transient by the scheduler: the run that hit
/// one is marked for retry rather than failed.
#[derive(Debug, Error)]
pub enum VmLaunchError {
    /// The VM process could not be spawned.
    #[error("failed to spawn `{command}`")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Creating the copy-on-write overlay disk failed.
    #[error("qemu-img failed to create overlay `{overlay}` over `{base}`")]
    OverlayCreate {
        /// The base image.
        base: Utf8PathBuf,
        /// The overlay that was being created.
        overlay: Utf8PathBuf,
        /// The underlying error, if the process could not run at all.
        #[source]
        error: Option<std::io::Error>,
    },

    /// Setting up the session's working directory failed.
    #[error("failed to set up session directory `{path}`")]
    WorkDir {
        /// The session directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while producing the base snapshot.
///
/// Bootstrap errors are fatal: no test can run without the snapshot.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The bootstrap VM failed to launch.
    #[error(transparent)]
    Launch(#[from] VmLaunchError),

    /// The VM process exited before the boot signal was observed.
    #[error("VM process exited during bootup")]
    Died,

    /// The boot-complete interrupt never arrived.
    #[error("no boot signal within {timeout:?} (watchdog reported {status:?})")]
    BootSignal {
        /// The watchdog status that was observed instead of `Found`.
        status: WatchdogStatus,
        /// The bootup timeout that elapsed.
        timeout: Duration,
        /// The captured VM console log, for post-mortem display.
        log: String,
    },

    /// Preparing the snapshot working directory failed.
    #[error("failed to prepare snapshot directory `{path}`")]
    Workspace {
        /// The directory that was being prepared.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Copying the snapshot image to its shared location failed.
    #[error("failed to store snapshot image at `{path}`")]
    StoreImage {
        /// The snapshot destination.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report file could not be written.
    #[error("failed to write report to `{path}`")]
    Io {
        /// The report path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Serializing the JUnit report failed.
    #[error("failed to serialize JUnit report")]
    Junit(#[source] quick_junit::SerializeError),
}
