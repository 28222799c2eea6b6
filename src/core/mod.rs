//! Runtime core: the manager and what it owns.
//!
//! The only entry points are [`Manager`] (built with [`ManagerBuilder`] from a
//! [`ManagerConfig`]) and the [`RateCache`] it shares with its tasks.
//!
//! Internal modules:
//! - `manager`: start/stop/restart, success dedup, shutdown;
//! - `registry`: running tasks and shared monitors;
//! - `shutdown`: cross-platform termination signals.

mod builder;
mod config;
mod manager;
mod rates;
mod registry;
mod shutdown;

pub use builder::ManagerBuilder;
pub use config::ManagerConfig;
pub use manager::Manager;
pub use rates::RateCache;
pub use shutdown::wait_for_shutdown_signal;
