//! The interrupt watchdog.
//!
//! The watchdog answers one question from the VM's asynchronous interrupt
//! trace: has interrupt N with register values R occurred before timeout T,
//! and is the guest still alive in the meantime? Guest death is detected
//! independently of the hard timeout: if no interrupt of *any* kind arrives
//! for a grace window, the guest has stopped producing events entirely,
//! which is stronger evidence of a crash than a plain timeout.

use regex::Regex;
use std::{collections::BTreeMap, sync::LazyLock, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use tracing::trace;

/// One event from the interrupt trace: an interrupt number plus the register
/// snapshot QEMU dumped alongside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterruptEvent {
    /// The interrupt vector.
    pub num: u32,
    /// Register name to value, as captured from the trace.
    pub regs: BTreeMap<String, u64>,
}

/// Terminal outcome of one [`InterruptWatchdog::wait_until`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchdogStatus {
    /// An event matched the interrupt number and every specified register.
    Found,
    /// The hard timeout elapsed; the guest was still producing interrupts.
    Timeout,
    /// No interrupt of any kind arrived within the grace window, or the
    /// trace source went away. The guest is presumed dead.
    Stopped,
}

/// Watches a session's interrupt-event stream.
#[derive(Debug)]
pub struct InterruptWatchdog {
    events: mpsc::UnboundedReceiver<InterruptEvent>,
    grace: Duration,
}

impl InterruptWatchdog {
    /// Creates a watchdog over an event stream with the given liveness grace
    /// window.
    pub fn new(events: mpsc::UnboundedReceiver<InterruptEvent>, grace: Duration) -> Self {
        Self { events, grace }
    }

    /// Waits until an event with interrupt number `num` and every register in
    /// `expected` matching exactly arrives, the hard `timeout` elapses, or
    /// the guest stops producing events.
    ///
    /// Unrelated interrupts reset the liveness window and are otherwise
    /// skipped. When the grace window and the deadline would fire together,
    /// the deadline wins: `Timeout`, not `Stopped`.
    pub async fn wait_until(
        &mut self,
        num: u32,
        expected: &BTreeMap<String, u64>,
        timeout: Duration,
    ) -> WatchdogStatus {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WatchdogStatus::Timeout;
            }
            let window = remaining.min(self.grace);

            match tokio::time::timeout(window, self.events.recv()).await {
                Ok(Some(event)) => {
                    trace!(target: "griddle::watchdog", num = event.num, "interrupt");
                    if matches(&event, num, expected) {
                        return WatchdogStatus::Found;
                    }
                    // Not the one we want; the guest is alive, keep scanning.
                }
                // Trace source gone: the VM process is dead.
                Ok(None) => return WatchdogStatus::Stopped,
                Err(_) => {
                    return if window >= remaining {
                        WatchdogStatus::Timeout
                    } else {
                        WatchdogStatus::Stopped
                    };
                }
            }
        }
    }
}

fn matches(event: &InterruptEvent, num: u32, expected: &BTreeMap<String, u64>) -> bool {
    event.num == num
        && expected
            .iter()
            .all(|(name, value)| event.regs.get(name) == Some(value))
}

/// Start of an interrupt record in QEMU `-d int` output, e.g.
/// `     6: v=80 e=0000 i=1 cpl=3 IP=001b:...`.
static INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+: v=([0-9a-fA-F]+)").expect("int regex is valid"));

/// A `NAME=hexvalue` register pair in the dump that follows, e.g.
/// `RAX=0000000000000233`. Short hex fields (selectors, `e=0000`) are
/// excluded by the length bound.
static REG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Z0-9]{1,3})=([0-9a-fA-F]{8,16})\b").expect("reg regex is valid")
});

/// Incremental parser for QEMU's `-d int` trace output.
///
/// An event starts at a `v=NN` line; the register dump on the following
/// lines is folded into it. The event is emitted once a line with no
/// register pairs arrives (the dump is over) or the next `v=` line starts.
#[derive(Debug, Default)]
pub struct TraceParser {
    pending: Option<InterruptEvent>,
}

impl TraceParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one trace line; returns a completed event, if any.
    pub fn push_line(&mut self, line: &str) -> Option<InterruptEvent> {
        if let Some(caps) = INT_RE.captures(line) {
            let num = u32::from_str_radix(&caps[1], 16).ok()?;
            return self.pending.replace(InterruptEvent {
                num,
                regs: BTreeMap::new(),
            });
        }

        let pending = self.pending.as_mut()?;
        let mut saw_pair = false;
        for caps in REG_RE.captures_iter(line) {
            if let Ok(value) = u64::from_str_radix(&caps[2], 16) {
                pending.regs.insert(caps[1].to_owned(), value);
                saw_pair = true;
            }
        }

        if saw_pair { None } else { self.pending.take() }
    }

    /// Flushes the trailing event at end of stream.
    pub fn finish(&mut self) -> Option<InterruptEvent> {
        self.pending.take()
    }
}
