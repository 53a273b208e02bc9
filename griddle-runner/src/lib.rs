//! Core logic for griddle, a QEMU-based kernel test harness.
//!
//! griddle boots a kernel image once, snapshots the warm machine state, and
//! then executes each test program in its own VM resumed from that snapshot.
//! Guest progress is observed through the interrupt trace rather than the
//! console: an interrupt watchdog decides whether a run finished, timed out,
//! or died. Verdicts come from a rule-driven analysis of the captured serial
//! console log.
//!
//! For more information about griddle, see the documentation for the
//! `griddle-cli` crate.

pub mod analyze;
pub mod config;
pub mod errors;
pub mod reporter;
pub mod runner;
pub mod spec;
mod time;
pub mod vm;
