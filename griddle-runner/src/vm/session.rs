//! VM sessions.
//!
//! A [`VmSession`] owns exactly one QEMU process: its working directory, its
//! copy-on-write overlay disk, the monitor on the process's stdin, the serial
//! console captured to `out.log`, and the interrupt trace arriving on stderr.
//! Sessions are never shared between runs, and teardown is guaranteed: either
//! through [`VmSession::close`] or, as a last resort, in `Drop`.

use crate::{
    errors::VmLaunchError,
    vm::{Arch, InterruptEvent, InterruptWatchdog, TraceParser},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

/// File name of the captured serial console within a session directory.
pub const CONSOLE_LOG: &str = "out.log";

/// How long a session waits for QEMU to exit on its own after `quit` before
/// resorting to a kill. An in-flight `savevm` or serial flush must be able
/// to complete inside this window.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// How a [`VmSession`] is launched.
#[derive(Clone, Debug)]
pub struct VmSessionOptions {
    /// The session's working directory. Created if missing; the console log
    /// lands here.
    pub work_dir: Utf8PathBuf,
    /// The writable overlay disk this session boots from.
    pub overlay: Utf8PathBuf,
    /// Guest architecture.
    pub arch: Arch,
    /// Saved machine state to resume from (`loadvm` tag), if any.
    pub load_state: Option<String>,
    /// Liveness grace window handed to the interrupt watchdog.
    pub watchdog_grace: Duration,
    /// Overrides the QEMU binary chosen by `arch`.
    pub qemu_binary: Option<Utf8PathBuf>,
}

/// One live QEMU instance.
#[derive(Debug)]
pub struct VmSession {
    child: Child,
    monitor: Option<ChildStdin>,
    watchdog: InterruptWatchdog,
    trace_task: JoinHandle<()>,
    work_dir: Utf8PathBuf,
    closed: bool,
}

impl VmSession {
    /// Launches a new VM session.
    pub async fn open(options: VmSessionOptions) -> Result<VmSession, VmLaunchError> {
        tokio::fs::create_dir_all(&options.work_dir)
            .await
            .map_err(|error| VmLaunchError::WorkDir {
                path: options.work_dir.clone(),
                error,
            })?;

        let binary = options
            .qemu_binary
            .as_deref()
            .map_or_else(|| options.arch.qemu_system(), Utf8Path::as_str);
        let console_log = options.work_dir.join(CONSOLE_LOG);

        let mut command = Command::new(binary);
        command
            .arg("-m")
            .arg("8M")
            .arg("-display")
            .arg("none")
            .arg("-drive")
            .arg(format!("file={},index=0,media=disk", options.overlay))
            .arg("-serial")
            .arg(format!("file:{console_log}"))
            .arg("-monitor")
            .arg("stdio")
            .arg("-d")
            .arg("int")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(tag) = &options.load_state {
            command.arg("-loadvm").arg(tag);
        }

        let mut child = command.spawn().map_err(|error| VmLaunchError::Spawn {
            command: binary.to_owned(),
            error,
        })?;

        let monitor = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .expect("stderr was requested as piped");

        // The interrupt trace arrives on stderr; a tail task turns it into
        // watchdog events. The task ends at EOF, which closes the channel
        // and reads as guest death downstream.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let trace_task = tokio::spawn(tail_interrupt_trace(stderr, event_tx));

        debug!(
            target: "griddle::vm",
            work_dir = %options.work_dir,
            arch = %options.arch,
            "VM session launched"
        );

        Ok(VmSession {
            child,
            monitor,
            watchdog: InterruptWatchdog::new(event_rx, options.watchdog_grace),
            trace_task,
            work_dir: options.work_dir,
            closed: false,
        })
    }

    /// Whether the VM process is still running.
    pub fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }

    /// The session's interrupt watchdog.
    pub fn watchdog_mut(&mut self) -> &mut InterruptWatchdog {
        &mut self.watchdog
    }

    /// Path of the captured serial console log.
    pub fn console_log_path(&self) -> Utf8PathBuf {
        self.work_dir.join(CONSOLE_LOG)
    }

    /// Reads the captured serial console log.
    pub async fn read_console_log(&self) -> std::io::Result<String> {
        tokio::fs::read_to_string(self.console_log_path()).await
    }

    /// Sends a command on the monitor channel, fire-and-forget.
    ///
    /// Used for out-of-band control: `savevm`, `quit`. Failures are logged
    /// and swallowed; the caller observes the consequences through the
    /// watchdog and `is_alive` instead.
    pub async fn monitor_command(&mut self, command: &str) {
        let Some(monitor) = &mut self.monitor else {
            warn!(target: "griddle::vm", command, "monitor already closed");
            return;
        };
        let line = format!("{command}\n");
        if let Err(error) = monitor.write_all(line.as_bytes()).await {
            warn!(target: "griddle::vm", command, %error, "monitor write failed");
            return;
        }
        if let Err(error) = monitor.flush().await {
            warn!(target: "griddle::vm", command, %error, "monitor flush failed");
        }
    }

    /// Types `text` on the guest's console, one keystroke at a time.
    ///
    /// Characters with no key mapping are skipped with a warning.
    pub async fn console_input(&mut self, text: &str) {
        for ch in text.chars() {
            match key_name(ch) {
                Some(key) => self.monitor_command(&format!("sendkey {key}")).await,
                None => warn!(target: "griddle::vm", ?ch, "no key mapping, skipping"),
            }
        }
    }

    /// Tears the session down: terminates the process and stops the trace
    /// tail. Idempotent, and safe to call after a prior failure. The console
    /// log stays on disk for post-mortem reading.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Ask the monitor to quit and wait for QEMU to exit on its own
        // before killing it: a kill that lands while the vmstate or the
        // serial file is still being written corrupts them.
        self.monitor_command("quit").await;
        self.monitor = None;

        if tokio::time::timeout(QUIT_GRACE, self.child.wait())
            .await
            .is_err()
        {
            debug!(target: "griddle::vm", work_dir = %self.work_dir, "quit ignored, killing");
            if let Err(error) = self.child.start_kill() {
                debug!(target: "griddle::vm", %error, "kill after quit");
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
        }
        self.trace_task.abort();

        debug!(target: "griddle::vm", work_dir = %self.work_dir, "VM session closed");
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if !self.closed {
            // kill_on_drop covers the process; the tail task must not outlive
            // the session.
            self.trace_task.abort();
        }
    }
}

async fn tail_interrupt_trace(
    stderr: tokio::process::ChildStderr,
    events: mpsc::UnboundedSender<InterruptEvent>,
) {
    let mut parser = TraceParser::new();
    let mut lines = BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parser.push_line(&line) {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                if let Some(event) = parser.finish() {
                    let _ = events.send(event);
                }
                break;
            }
            Err(error) => {
                debug!(target: "griddle::vm", %error, "trace read failed");
                break;
            }
        }
    }
}

/// Maps a character to its QEMU `sendkey` name.
fn key_name(ch: char) -> Option<String> {
    match ch {
        'a'..='z' | '0'..='9' => Some(ch.to_string()),
        'A'..='Z' => Some(format!("shift-{}", ch.to_ascii_lowercase())),
        '\n' => Some("ret".to_owned()),
        ' ' => Some("spc".to_owned()),
        '.' => Some("dot".to_owned()),
        '-' => Some("minus".to_owned()),
        '_' => Some("shift-minus".to_owned()),
        '/' => Some("slash".to_owned()),
        _ => None,
    }
}

/// Creates a copy-on-write overlay disk over `base`.
pub async fn create_overlay(base: &Utf8Path, overlay: &Utf8Path) -> Result<(), VmLaunchError> {
    let status = Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
        .arg(base)
        .arg(overlay)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => Err(VmLaunchError::OverlayCreate {
            base: base.to_owned(),
            overlay: overlay.to_owned(),
            error: None,
        }),
        Err(error) => Err(VmLaunchError::OverlayCreate {
            base: base.to_owned(),
            overlay: overlay.to_owned(),
            error: Some(error),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn key_names_cover_test_binary_names() {
        assert_eq!(key_name('a').as_deref(), Some("a"));
        assert_eq!(key_name('7').as_deref(), Some("7"));
        assert_eq!(key_name('_').as_deref(), Some("shift-minus"));
        assert_eq!(key_name('.').as_deref(), Some("dot"));
        assert_eq!(key_name('\n').as_deref(), Some("ret"));
        assert_eq!(key_name('A').as_deref(), Some("shift-a"));
        assert_eq!(key_name('\t'), None);
    }

    #[tokio::test]
    async fn open_with_missing_binary_is_a_launch_error() {
        let dir = Utf8TempDir::new().expect("tempdir");
        let options = VmSessionOptions {
            work_dir: dir.path().join("session"),
            overlay: dir.path().join("overlay.qcow2"),
            arch: Arch::X86_64,
            load_state: None,
            watchdog_grace: Duration::from_secs(1),
            qemu_binary: Some(Utf8PathBuf::from("/nonexistent/qemu-system-x86_64")),
        };

        let err = VmSession::open(options).await.unwrap_err();
        assert!(matches!(err, VmLaunchError::Spawn { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = Utf8TempDir::new().expect("tempdir");
        let options = VmSessionOptions {
            work_dir: dir.path().join("session"),
            overlay: dir.path().join("overlay.qcow2"),
            arch: Arch::X86_64,
            load_state: None,
            watchdog_grace: Duration::from_millis(100),
            // Any spawnable binary will do; it exits on its own.
            qemu_binary: Some(Utf8PathBuf::from("/bin/cat")),
        };

        let mut session = VmSession::open(options).await.expect("spawn works");
        session.close().await;
        assert!(!session.is_alive());
        session.close().await;
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn close_lets_the_process_exit_on_its_own() {
        let dir = Utf8TempDir::new().expect("tempdir");
        let options = VmSessionOptions {
            work_dir: dir.path().join("session"),
            overlay: dir.path().join("overlay.qcow2"),
            arch: Arch::X86_64,
            load_state: None,
            watchdog_grace: Duration::from_millis(100),
            // cat exits by itself almost immediately.
            qemu_binary: Some(Utf8PathBuf::from("/bin/cat")),
        };

        let mut session = VmSession::open(options).await.expect("spawn works");
        let start = std::time::Instant::now();
        session.close().await;
        // The graceful wait picks up the exit; no kill window is burned.
        assert!(start.elapsed() < QUIT_GRACE, "close stalled: {:?}", start.elapsed());
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn close_grants_a_grace_window_before_killing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = Utf8TempDir::new().expect("tempdir");
        // Stand-in for a process still busy at quit time: ignores its
        // arguments and stdin and runs until killed.
        let stubborn = dir.path().join("stubborn.sh");
        std::fs::write(&stubborn, "#!/bin/sh\nexec sleep 60\n").expect("script written");
        std::fs::set_permissions(&stubborn, std::fs::Permissions::from_mode(0o755))
            .expect("script made executable");

        let options = VmSessionOptions {
            work_dir: dir.path().join("session"),
            overlay: dir.path().join("overlay.qcow2"),
            arch: Arch::X86_64,
            load_state: None,
            watchdog_grace: Duration::from_millis(100),
            qemu_binary: Some(stubborn),
        };

        let mut session = VmSession::open(options).await.expect("spawn works");
        let start = std::time::Instant::now();
        session.close().await;
        let elapsed = start.elapsed();

        // The full grace window elapses before the kill lands, and the
        // process is gone afterwards.
        assert!(elapsed >= QUIT_GRACE, "no grace window: {elapsed:?}");
        assert!(elapsed < QUIT_GRACE + Duration::from_secs(2), "kill did not land: {elapsed:?}");
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn overlay_create_failure_is_reported() {
        let dir = Utf8TempDir::new().expect("tempdir");
        // The base image does not exist (and qemu-img may not either); both
        // surface as an OverlayCreate error.
        let err = create_overlay(
            &dir.path().join("missing-base.qcow2"),
            &dir.path().join("overlay.qcow2"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VmLaunchError::OverlayCreate { .. }), "got {err:?}");
    }
}
