//! # Status events emitted by tasks and monitors.
//!
//! The [`EventKind`] enum classifies events into the two categories of the
//! manager-level status stream:
//! - **TaskStatus**: a checkout task (or rate fetcher) moved to a new state.
//! - **MonitorStatus**: a monitor resolved, refreshed or lost a product; tagged
//!   with every task id attached to it at the time of the event.
//!
//! The [`Event`] struct carries the human-readable status message plus the
//! optional fields the UI cares about (proxy, product, size, rate...).
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Events of one task are published by that task alone, so they arrive in transition order.
//!
//! ## Example
//! ```rust
//! use cartvisor::{Event, EventKind, State};
//!
//! let ev = Event::new(EventKind::TaskStatus)
//!     .with_task("task-1")
//!     .with_state(State::AddToCart)
//!     .with_message("Adding to cart");
//!
//! assert_eq!(ev.kind, EventKind::TaskStatus);
//! assert_eq!(ev.task_ids[0].as_ref(), "task-1");
//! assert_eq!(ev.message.as_deref(), Some("Adding to cart"));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::model::ShippingRate;
use crate::task::State;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A task transitioned (including in-place retries).
    ///
    /// Sets:
    /// - `task_ids`: the task id
    /// - `state`: state the task is about to run
    /// - `message`: status text
    /// - `proxy` / `product` / `size` / `image`: when they changed
    /// - `rate`: selected shipping rate (rate fetchers)
    /// - `success`: `Some(true)` on a confirmed order, `Some(false)` on a decline
    /// - `at`, `seq`
    TaskStatus,

    /// A monitor reported progress.
    ///
    /// Sets:
    /// - `task_ids`: every task attached to the monitor
    /// - `message`: status text
    /// - `product` / `image`: resolved product, when found
    /// - `at`, `seq`
    MonitorStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskStatus => "TaskStatus",
            EventKind::MonitorStatus => "MonitorStatus",
        }
    }
}

/// Status event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Task ids this event is about.
    pub task_ids: Vec<Arc<str>>,
    /// Human-readable status text.
    pub message: Option<Arc<str>>,
    /// State the task entered.
    pub state: Option<State>,
    /// Proxy in use.
    pub proxy: Option<Arc<str>>,
    /// Product title.
    pub product: Option<Arc<str>>,
    /// Chosen size.
    pub size: Option<Arc<str>>,
    /// Product image URL.
    pub image: Option<Arc<str>>,
    /// Shipping rate found or selected.
    pub rate: Option<ShippingRate>,
    /// Order outcome, when known.
    pub success: Option<bool>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            task_ids: Vec::new(),
            message: None,
            state: None,
            proxy: None,
            product: None,
            size: None,
            image: None,
            rate: None,
            success: None,
        }
    }

    /// Adds a task id.
    #[inline]
    pub fn with_task(mut self, id: impl Into<Arc<str>>) -> Self {
        self.task_ids.push(id.into());
        self
    }

    /// Replaces the task id list.
    #[inline]
    pub fn with_tasks<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        self.task_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    #[inline]
    pub fn with_message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[inline]
    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    #[inline]
    pub fn with_proxy(mut self, proxy: impl Into<Arc<str>>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    #[inline]
    pub fn with_product(mut self, product: impl Into<Arc<str>>) -> Self {
        self.product = Some(product.into());
        self
    }

    #[inline]
    pub fn with_size(mut self, size: impl Into<Arc<str>>) -> Self {
        self.size = Some(size.into());
        self
    }

    #[inline]
    pub fn with_image(mut self, image: impl Into<Arc<str>>) -> Self {
        self.image = Some(image.into());
        self
    }

    #[inline]
    pub fn with_rate(mut self, rate: ShippingRate) -> Self {
        self.rate = Some(rate);
        self
    }

    #[inline]
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// True for a confirmed order.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.kind == EventKind::TaskStatus && self.success == Some(true)
    }

    /// True when the event ends the task's status stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(|s| s.is_terminal())
    }

    /// True when the event concerns the given task id.
    #[inline]
    pub fn concerns(&self, id: &str) -> bool {
        self.task_ids.iter().any(|t| t.as_ref() == id)
    }
}
