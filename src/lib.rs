//! # cartvisor
//!
//! **Cartvisor** runs checkout automation tasks against Shopify-style stores.
//!
//! Every task is a state machine that walks a checkout from "gather data" to
//! "order placed", one HTTP step per state. Tasks that watch the same product
//! share one [`Monitor`](monitor::Monitor); proxies are leased from a shared
//! pool, captcha solving is bridged to an external harvester, and successful
//! orders are reported through webhooks.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  TaskConfig  │   │  TaskConfig  │   │  TaskConfig  │
//!     │   (task #1)  │   │   (task #2)  │   │   (task #3)  │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Manager                                                          │
//! │  - Registry (tasks by id, monitors by MonitorKey)                 │
//! │  - ProxyManager / CaptchaManager / WebhookManager                 │
//! │  - SubscriberSet (fans out to user subscribers)                   │
//! └──────┬──────────────────┬──────────────────┬───────────────┬──────┘
//!        ▼                  ▼                  ▼               │
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//!     │ CheckoutTask │   │ CheckoutTask │   │ RateFetcher  │   │
//!     │ (state loop) │   │ (state loop) │   │ (phase loop) │   │
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘   │
//!      │ product watch    │                  │                 │
//!      └──────────┬───────┘                  │                 │
//!                 ▼                          │                 │
//!          ┌──────────────┐                  │                 │
//!          │   Monitor    │ (one per store + matcher)          │
//!          └──────┬───────┘                  │                 │
//!                 │ MonitorStatus            │ TaskStatus      │
//!                 ▼                          ▼                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │               (capacity: ManagerConfig::bus_capacity)             │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                       ┌────────────────────────┐
//!                       │    status listener     │
//!                       │     (in Manager)       │
//!                       └───┬────────────────┬───┘
//!                           ▼                ▼
//!                   handle_success     SubscriberSet
//!                  (same purchase)    (per-sub queues)
//! ```
//!
//! ### Lifecycle
//! ```text
//! Manager::start(config) ──► lease proxy ──► attach monitor ──► CheckoutTask::run()
//!
//! loop {
//!   ├─► state terminal (DONE / ERROR / ABORT)? ─► exit
//!   ├─► handler for state (gather data, add to cart, shipping, payment, ...)
//!   │       ├─ Ok(next)  ──► publish TaskStatus, continue
//!   │       ├─ Err / panic ──► ERROR + status event
//!   │       └─ HTTP error ──► classifier: proxy swap, delay, or resume
//!   └─► cancelled ──► ABORT "Stopped"
//! }
//!
//! On exit: release proxy lease; Manager::stop detaches the monitor.
//! ```
//!
//! ## Features
//! | Area              | Description                                                    | Key types / traits                          |
//! |-------------------|----------------------------------------------------------------|---------------------------------------------|
//! | **Manager**       | Start, stop and restart tasks; dedup monitors and purchases.   | [`Manager`], [`ManagerBuilder`]             |
//! | **Subscriber API**| Hook into task and monitor status events.                      | [`Subscribe`], [`Event`]                    |
//! | **Policies**      | Backoff after proxy swaps, jitter on monitor polls.            | [`BackoffPolicy`], [`JitterPolicy`]         |
//! | **Services**      | Proxy leasing, captcha bridging, webhook delivery.             | [`ProxyManager`], [`CaptchaManager`], [`WebhookManager`] |
//! | **Transport**     | Swappable HTTP sessions.                                       | [`Connector`], [`HttpSession`]              |
//! | **Errors**        | Typed errors for tasks, transport and configuration.           | [`TaskError`], [`FetchError`], [`RuntimeError`] |
//! | **Configuration** | Runtime settings from TOML, task lists from JSON.              | [`ManagerConfig`], [`TaskConfig`]           |
//!
//! ## Optional features
//! - `logging` (default): [`init_logging`] installs a `tracing-subscriber` formatter.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cartvisor::{LogWriter, ManagerBuilder, ManagerConfig, ProxyPool, TaskConfig, TaskKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ManagerConfig::from_toml_str(&std::fs::read_to_string("cartvisor.toml")?)?;
//!     let tasks = TaskConfig::list_from_json_str(&std::fs::read_to_string("tasks.json")?)?;
//!     let proxies = ProxyPool::from_lines(std::fs::read_to_string("proxies.txt")?.lines()).await;
//!
//!     let manager = ManagerBuilder::new(cfg)
//!         .with_subscribers(vec![Arc::new(LogWriter::new())])
//!         .with_proxies(Arc::new(proxies))
//!         .build()
//!         .await;
//!
//!     manager.start_all(tasks, TaskKind::Normal).await;
//!     manager.run_until_signal().await?;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod context;
mod core;
mod error;
mod events;
pub mod http;
pub mod model;
pub mod monitor;
mod policies;
pub mod services;
mod subscribers;
pub mod task;

#[cfg(feature = "logging")]
mod logging;

#[cfg(test)]
mod testing;

// ---- Public re-exports ----

pub use crate::core::{Manager, ManagerBuilder, ManagerConfig, RateCache, wait_for_shutdown_signal};
pub use error::{ConfigError, FetchError, ParseError, RuntimeError, TaskError, TransportKind};
pub use events::{Event, EventKind};
pub use http::{Connector, HttpSession, ReqwestConnector};
pub use model::{DelayKind, TaskConfig, TaskKind};
pub use monitor::{Parser, ParserFactory};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use services::{
    CaptchaManager, HarvestQueue, ProxyManager, ProxyPool, WebhookDispatcher, WebhookManager,
};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet, SubscriptionId};
pub use task::State;

#[cfg(feature = "logging")]
pub use logging::init_logging;
