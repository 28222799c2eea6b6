//! # Built-in subscribers
//!
//! - [`LogWriter`]: writes status events through `tracing`.

mod log;

pub use log::LogWriter;
