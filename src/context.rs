//! # Per-task context.
//!
//! A [`Context`] is the state record a [`CheckoutTask`](crate::task::CheckoutTask)
//! owns for its whole life. The manager builds it at start and only touches it
//! again through the channels it kept: the config watch (restart, change_delay),
//! the [`Delayer`] and the cancellation token (stop).
//!
//! ```text
//!  Manager ── config watch ──────────────► Context.config()
//!  Monitor ── product watch ─────────────► Context.product()
//!  Manager ── Delayer::clear / cancel ───► Context.wait(..) returns early
//!  Context.emit(event) ──► Bus ──► manager listener ──► subscribers
//! ```
//!
//! ## Rules
//! - The task is the only writer of `proxy` and the captcha fields.
//! - The monitor is the only writer of the product watch.
//! - Every wait is cancellable; a cancelled wait returns `false`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event, EventKind};
use crate::model::TaskConfig;
use crate::monitor::Product;
use crate::services::{CaptchaRequest, Proxy};

/// Cancellable sleep that can be cut short from outside.
#[derive(Debug, Clone, Default)]
pub struct Delayer {
    notify: Arc<Notify>,
}

impl Delayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay`. Returns `false` if `cancel` fired first.
    ///
    /// A [`clear`](Self::clear) ends the sleep early and returns `true`.
    pub async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        select! {
            _ = cancel.cancelled() => false,
            _ = self.notify.notified() => true,
            _ = time::sleep(delay) => true,
        }
    }

    /// Wakes every pending [`wait`](Self::wait).
    pub fn clear(&self) {
        self.notify.notify_waiters();
    }
}

/// Publishes status events on behalf of one task.
#[derive(Clone)]
pub struct StatusSink {
    task_id: Arc<str>,
    bus: Bus,
}

impl StatusSink {
    pub fn new(task_id: Arc<str>, bus: Bus) -> Self {
        Self { task_id, bus }
    }

    /// Publishes a `TaskStatus` event built by `f`, tagged with this task.
    pub fn emit(&self, f: impl FnOnce(Event) -> Event) {
        let ev = f(Event::new(EventKind::TaskStatus).with_task(Arc::clone(&self.task_id)));
        self.bus.publish(ev);
    }
}

/// State record shared by a task and, read-only, by the manager.
pub struct Context {
    pub id: Arc<str>,
    config: watch::Receiver<Arc<TaskConfig>>,
    product: watch::Receiver<Option<Arc<Product>>>,
    /// Current proxy lease, `None` when running direct.
    pub proxy: Option<Proxy>,
    /// Pending captcha, only set while the task is in CAPTCHA.
    pub captcha: Option<CaptchaRequest>,
    /// Solved token waiting to be submitted.
    pub captcha_token: Option<String>,
    pub cancel: CancellationToken,
    pub delayer: Delayer,
    /// Span every log line of the task runs in.
    pub span: tracing::Span,
    status: StatusSink,
}

impl Context {
    pub fn new(
        id: Arc<str>,
        config: watch::Receiver<Arc<TaskConfig>>,
        product: watch::Receiver<Option<Arc<Product>>>,
        proxy: Option<Proxy>,
        cancel: CancellationToken,
        delayer: Delayer,
        bus: Bus,
    ) -> Self {
        let span = tracing::info_span!("task", id = %id);
        Self {
            status: StatusSink::new(Arc::clone(&id), bus),
            id,
            config,
            product,
            proxy,
            captcha: None,
            captcha_token: None,
            cancel,
            delayer,
            span,
        }
    }

    /// Latest configuration.
    pub fn config(&self) -> Arc<TaskConfig> {
        Arc::clone(&*self.config.borrow())
    }

    /// Latest product published by the monitor.
    pub fn product(&self) -> Option<Arc<Product>> {
        self.product.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellable wait; `false` means the task was stopped.
    pub async fn wait(&self, delay: Duration) -> bool {
        self.delayer.wait(delay, &self.cancel).await
    }

    pub fn emit(&self, f: impl FnOnce(Event) -> Event) {
        self.status.emit(f);
    }

    /// Shorthand for a message-only status event.
    pub fn say(&self, message: impl Into<Arc<str>>) {
        let message = message.into();
        self.emit(|ev| ev.with_message(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[tokio::test(start_paused = true)]
    async fn test_delayer_clear_and_cancel() {
        let delayer = Delayer::new();
        let cancel = CancellationToken::new();

        assert!(delayer.wait(Duration::from_millis(10), &cancel).await);

        let d = delayer.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { d.wait(Duration::from_secs(3600), &c).await });
        tokio::task::yield_now().await;
        delayer.clear();
        assert!(waiter.await.unwrap());

        cancel.cancel();
        assert!(!delayer.wait(Duration::from_secs(3600), &cancel).await);
    }

    #[tokio::test]
    async fn test_context_reads_latest_config_and_tags_events() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let (config_tx, config_rx) = watch::channel(Arc::new(fixtures::task("t1")));
        let (_product_tx, product_rx) = watch::channel(None);
        let ctx = Context::new(
            "t1".into(),
            config_rx,
            product_rx,
            None,
            CancellationToken::new(),
            Delayer::new(),
            bus,
        );

        let mut next = fixtures::task("t1");
        next.size = "11".into();
        config_tx.send_replace(Arc::new(next));
        assert_eq!(ctx.config().size, "11");
        assert!(ctx.product().is_none());

        ctx.say("Adding to cart");
        let ev = rx.recv().await.unwrap();
        assert!(ev.concerns("t1"));
        assert_eq!(ev.message.as_deref(), Some("Adding to cart"));
    }
}
