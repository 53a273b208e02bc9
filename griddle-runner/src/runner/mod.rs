//! The test scheduler.
//!
//! The main structure in this module is [`TestRunner`].

mod bootstrap;
mod dispatcher;
mod events;
mod imp;

pub use bootstrap::*;
pub use events::*;
pub use imp::*;
