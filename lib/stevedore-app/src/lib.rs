//! Process bootstrap primitives.
//!
//! Everything a `stevedore` entry point needs before it can start orchestrating: logging setup and a way to bail out
//! early when that setup fails.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
