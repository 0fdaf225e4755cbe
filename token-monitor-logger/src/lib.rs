//! Tracing subscriber setup shared by the token monitor binaries.

mod logging;

pub use logging::*;
