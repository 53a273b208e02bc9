//! Turning captured console output into a verdict.
//!
//! [`LogParser`] buckets raw console lines by analyze rule;
//! [`LogAnalyzer`] applies the ordered rule set to the buckets, the
//! watchdog status and the captured exit codes, producing a [`TestResult`].

mod analyzer;
mod parser;

pub use analyzer::*;
pub use parser::*;
