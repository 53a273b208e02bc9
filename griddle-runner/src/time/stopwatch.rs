//! Stopwatch for tracking how long a test run takes.
//!
//! Runs need a start time and a duration. For that we use a combination of a
//! realtime clock (`DateTime<Local>`) for report timestamps and a monotonic
//! clock (`Instant`) for the elapsed duration.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls happen imperceptibly close to each other,
            // which is good enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_snapshot_monotonic() {
        let start = stopwatch();
        std::thread::sleep(Duration::from_millis(50));
        let first = start.snapshot();
        std::thread::sleep(Duration::from_millis(50));
        let second = start.snapshot();

        assert!(first.duration >= Duration::from_millis(50));
        assert!(second.duration > first.duration);
        assert_eq!(first.start_time, second.start_time);
    }
}
