//! Collaborators shared by tasks, monitors and the manager.
//!
//! ## Contents
//! - [`ProxyManager`] / [`ProxyPool`]           proxy leasing per (task, store, platform)
//! - [`CaptchaManager`] / [`HarvestQueue`]      captcha requests and harvesting
//! - [`WebhookManager`] / [`WebhookDispatcher`] checkout notifications
//!
//! Each trait is object safe; the manager holds them as `Arc<dyn ..>` and the
//! builder accepts any implementation.

mod captcha;
mod proxy;
mod webhook;

pub use captcha::{
    CaptchaManager, CaptchaRequest, CaptchaStatus, CaptchaTicket, HarvestQueue, HarvestRequest,
};
pub use proxy::{Proxy, ProxyManager, ProxyPool};
pub use webhook::{OrderRef, StoreRef, WebhookDispatcher, WebhookManager, WebhookRecord};
