//! Status events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: checkout tasks and rate fetchers (through their
//!   [`Context`](crate::context::Context)), monitors, and the manager itself
//!   (`Profile already used!`).
//! - **Consumers**: the manager's status listener, which fans out to the
//!   [`SubscriberSet`](crate::SubscriberSet) and runs success dedup.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
