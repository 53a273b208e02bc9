//! Time-related utilities.

mod stopwatch;

pub(crate) use stopwatch::*;
