//! # Status subscribers.
//!
//! This module provides the [`Subscribe`] trait, the dynamic [`SubscriberSet`]
//! fan-out, and the built-in [`LogWriter`].
//!
//! ## Architecture
//! ```text
//! Task / Monitor ── publish(Event) ──► Bus ──► Manager status listener
//!                                                  │
//!                                                  ├──► SubscriberSet::emit(&Event)
//!                                                  │         │
//!                                                  │    ┌────┴────┬─────────┬───────┐
//!                                                  │    ▼         ▼         ▼       ▼
//!                                                  │  LogWriter   UI      Custom  ...
//!                                                  │
//!                                                  └──► success dedup (handle_success)
//! ```

mod embedded;
mod set;
mod subscriber;

pub use embedded::LogWriter;
pub use set::{SubscriberSet, SubscriptionId};
pub use subscriber::Subscribe;
