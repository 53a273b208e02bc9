//! Report generation.
//!
//! Two outputs are produced from the same terminal result set: a markdown
//! summary for humans and JUnit XML for CI.

mod junit;
mod summary;

pub use junit::*;
pub use summary::*;
