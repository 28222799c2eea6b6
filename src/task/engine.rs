//! # Checkout engine.
//!
//! One [`CheckoutTask`] drives one attempt through the closed [`State`] set.
//! Every state has one handler returning `Result<State, TaskError>`; the
//! dispatch loop owns transitions, status events and failure mapping.
//!
//! ```text
//! loop {
//!   ├─► cancelled?                 → ABORT (no I/O)
//!   ├─► handler(state)             (catch_unwind)
//!   │     ├─ Ok(next)              → next
//!   │     ├─ Err(Canceled)         → ABORT
//!   │     └─ Err(e) / panic        → ERROR, message from the error
//!   ├─► record origin of QUEUE / CAPTCHA / SWAP
//!   └─► emit one TaskStatus event (state, message, proxy, product, size)
//! } until ERROR | ABORT | DONE
//! ```
//!
//! ## Request helper
//! Handlers talk to the store through [`CheckoutTask::request`], which
//! races the send against cancellation, records redirect side effects,
//! runs the classifier, and only then consults the caller's redirect table.
//!
//! ## Rules
//! - A classifier result always wins over redirect and body inspection.
//! - Redirect side effects apply before classification (a 303 to a checkout
//!   still records the checkout hash).
//! - Pending status text is flushed before every wait.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::select;
use tracing::Instrument;

use super::forms::{self, CheckoutForm, Fields};
use super::mode::{Strategy, Target};
use super::state::State;
use super::table::{Next, Rule, Table};
use crate::classify::{Fallback, Signal, Transition, classify};
use crate::context::Context;
use crate::core::RateCache;
use crate::error::TaskError;
use crate::http::{Connector, HttpRequest, HttpResponse, HttpSession};
use crate::model::{Delays, ShippingRate, TaskConfig};
use crate::monitor::{ParserFactory, Pick, Product};
use crate::policies::BackoffPolicy;
use crate::services::{CaptchaManager, ProxyManager, WebhookManager};

/// Engine-wide intervals and endpoints.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Interval between queue polls.
    pub queue_poll: Duration,
    /// Interval between captcha status checks.
    pub captcha_poll: Duration,
    /// Interval between product checks in WAIT_FOR_PRODUCT.
    pub product_poll: Duration,
    /// Interval for rate, tax and processing polls.
    pub stock_poll: Duration,
    /// Card vault endpoint used by PAYMENT_TOKEN.
    pub vault_url: String,
    pub swap_backoff: BackoffPolicy,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            queue_poll: Duration::from_millis(2500),
            captcha_poll: Duration::from_millis(150),
            product_poll: Duration::from_millis(150),
            stock_poll: Duration::from_millis(500),
            vault_url: "https://deposit.us.shopifycs.com/sessions".to_string(),
            swap_backoff: BackoffPolicy::default(),
        }
    }
}

/// Collaborators shared by every task of a manager.
#[derive(Clone)]
pub struct TaskDeps {
    pub proxies: Arc<dyn ProxyManager>,
    pub captcha: Arc<dyn CaptchaManager>,
    pub webhooks: Arc<dyn WebhookManager>,
    pub connector: Arc<dyn Connector>,
    pub parsers: Arc<dyn ParserFactory>,
    pub rates: RateCache,
    pub settings: TaskSettings,
}

/// Checkout fields accumulated along the funnel.
#[derive(Debug, Default)]
pub struct Checkout {
    pub store_id: Option<String>,
    pub hash: Option<String>,
    /// Storefront access token.
    pub access_token: Option<String>,
    pub cart: Fields,
    pub checkpoint: Fields,
    pub form: CheckoutForm,
    pub rate: Option<ShippingRate>,
    /// Queue cursor (`_ctd`).
    pub ctd: Option<String>,
    /// Vaulted card session.
    pub payment_token: Option<String>,
    pub gateway: Option<String>,
    pub sitekey: Option<String>,
    pub pick: Option<Pick>,
    pub product: Option<Arc<Product>>,
    /// Api mode: customer information is already on the checkout.
    pub setup: bool,
    /// A checkout redirect was seen since the last queue poll.
    pub admitted: bool,
    pub webhook_sent: bool,
    pub failure_sent: bool,
    /// Consecutive proxy swaps.
    pub swaps: u32,
}

impl Checkout {
    /// `/{store id}/checkouts/{hash}` once both are known.
    pub fn url(&self) -> Option<String> {
        Some(format!(
            "/{}/checkouts/{}",
            self.store_id.as_deref()?,
            self.hash.as_deref()?
        ))
    }
}

/// States that sent the task into QUEUE, CAPTCHA and SWAP.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Origins {
    pub queue: Option<State>,
    pub captcha: Option<State>,
    pub swap: Option<State>,
}

#[derive(Debug, Default)]
struct Pending {
    message: Option<Arc<str>>,
    success: Option<bool>,
}

/// What the request helper made of a response.
#[derive(Debug)]
pub(super) enum Reply {
    /// The classifier or a redirect rule picked the next state.
    Moved(State),
    /// A redirect rule marked the response as the expected success.
    Proceed(HttpResponse),
    /// Nothing matched; the handler inspects the response.
    Response(HttpResponse),
}

/// The checkout state machine of one task.
pub struct CheckoutTask {
    pub(super) ctx: Context,
    pub(super) deps: TaskDeps,
    pub(super) session: Box<dyn HttpSession>,
    pub(super) ck: Checkout,
    pub(super) state: State,
    /// Last state that differs from the current one.
    pub(super) prev: State,
    pub(super) origins: Origins,
    pending: Pending,
}

impl CheckoutTask {
    /// Opens a session for the task's store through its current proxy.
    pub fn new(ctx: Context, deps: TaskDeps) -> Result<Self, TaskError> {
        let config = ctx.config();
        let session = deps.connector.session(&config.store, ctx.proxy.as_ref())?;
        let ck = Checkout {
            access_token: config.store.api_key.clone(),
            ..Checkout::default()
        };
        Ok(Self {
            ctx,
            deps,
            session,
            ck,
            state: State::GatherData,
            prev: State::GatherData,
            origins: Origins::default(),
            pending: Pending::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn checkout(&self) -> &Checkout {
        &self.ck
    }

    /// Runs until a terminal state and returns it.
    pub async fn run(self) -> State {
        let span = self.ctx.span.clone();
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> State {
        let id = Arc::clone(&self.ctx.id);
        self.deps.captcha.attach_handler(&id).await;
        if let Some(rate) = self.deps.rates.get(&self.ctx.config()).await {
            tracing::debug!(rate = %rate.id, "using cached shipping rate");
            self.ck.rate = Some(rate);
        }
        tracing::info!("task started");
        self.say("Starting task");
        self.publish();

        while !self.state.is_terminal() {
            let current = self.state;
            let next = if self.ctx.is_cancelled() {
                State::Abort
            } else {
                match AssertUnwindSafe(self.step(current)).catch_unwind().await {
                    Ok(Ok(next)) => next,
                    Ok(Err(TaskError::Canceled)) => State::Abort,
                    Ok(Err(err)) => {
                        tracing::warn!(state = %current, error = %err, label = err.as_label(), "handler failed");
                        self.say(err.as_message());
                        State::Error
                    }
                    Err(_) => {
                        tracing::error!(state = %current, "handler panicked");
                        self.say("Unexpected error");
                        State::Error
                    }
                }
            };
            if next == State::Abort {
                self.say("Stopped");
            }
            self.transition(current, next);
            self.publish();
        }

        self.cleanup(&id).await;
        tracing::info!(state = %self.state, "task finished");
        self.state
    }

    async fn step(&mut self, state: State) -> Result<State, TaskError> {
        match state {
            State::GatherData => self.gather_data().await,
            State::Login => self.login().await,
            State::WaitForProduct => self.wait_for_product().await,
            State::AddToCart => self.add_to_cart().await,
            State::GoToCart => self.go_to_cart().await,
            State::CreateCheckout => self.create_checkout().await,
            State::GoToCheckpoint => self.go_to_checkpoint().await,
            State::SubmitCheckpoint => self.submit_checkpoint().await,
            State::Queue => self.queue().await,
            State::GoToCheckout => self.go_to_checkout().await,
            State::SubmitCustomer => self.submit_customer().await,
            State::GoToShipping => self.go_to_shipping().await,
            State::SubmitShipping => self.submit_shipping().await,
            State::GoToPayment => self.go_to_payment().await,
            State::PaymentToken => self.payment_token().await,
            State::SubmitPayment => self.submit_payment().await,
            State::CompletePayment => self.complete_payment().await,
            State::ProcessPayment => self.process_payment().await,
            State::Captcha => self.captcha().await,
            State::Swap => self.swap().await,
            State::Error | State::Abort | State::Done => Ok(state),
        }
    }

    fn transition(&mut self, from: State, to: State) {
        if from != to {
            self.prev = from;
            match (from, to) {
                (State::Swap, _) => {}
                (State::Queue, State::Captcha) => self.origins.captcha = self.origins.queue,
                (_, State::Queue) => self.origins.queue = Some(from),
                (_, State::Captcha) => self.origins.captcha = Some(from),
                (_, State::Swap) => self.origins.swap = Some(from),
                _ => {}
            }
            tracing::debug!(from = %from, to = %to, "transition");
        }
        self.state = to;
    }

    async fn cleanup(&mut self, id: &str) {
        if let Some(request) = self.ctx.captcha.take() {
            request.cancel();
        }
        self.deps.captcha.detach_handler(id).await;
        if let Some(proxy) = self.ctx.proxy.take() {
            let config = self.ctx.config();
            self.deps
                .proxies
                .release(id, config.store.base(), config.platform, &proxy.id)
                .await;
        }
    }

    // -- shared helpers for the step handlers --

    pub(super) fn config(&self) -> Arc<TaskConfig> {
        self.ctx.config()
    }

    pub(super) fn delays(&self) -> Delays {
        self.ctx.config().delays
    }

    pub(super) fn strategy(&self) -> &'static Strategy {
        Strategy::of(self.ctx.config().mode)
    }

    /// Checkout target for the strategy's request builders.
    pub(super) fn target<'a>(&'a self, url: &'a str) -> Target<'a> {
        Target {
            url,
            hash: self.ck.hash.as_deref().unwrap_or_default(),
            token: self.ck.access_token.as_deref(),
        }
    }

    /// Sets the status text carried by the next event.
    pub(super) fn say(&mut self, message: impl Into<Arc<str>>) {
        self.pending.message = Some(message.into());
    }

    /// Marks the next event as an order outcome.
    pub(super) fn report_outcome(&mut self, success: bool) {
        self.pending.success = Some(success);
    }

    /// Emits one status event with the current state and pending text.
    pub(super) fn publish(&mut self) {
        let message = self.pending.message.take();
        let success = self.pending.success.take();
        let state = self.state;
        let proxy = self.ctx.proxy.as_ref().map(|p| p.label().to_string());
        let product = self.ck.product.clone();
        let size = self.ck.pick.as_ref().map(|p| p.size.clone());
        self.ctx.emit(|mut ev| {
            ev = ev.with_state(state);
            if let Some(message) = message {
                ev = ev.with_message(message);
            }
            if let Some(success) = success {
                ev = ev.with_success(success);
            }
            if let Some(proxy) = proxy {
                ev = ev.with_proxy(proxy);
            }
            if let Some(product) = product {
                ev = ev.with_product(product.title.as_str());
                if let Some(image) = &product.image {
                    ev = ev.with_image(image.as_str());
                }
            }
            if let Some(size) = size {
                ev = ev.with_size(size);
            }
            ev
        });
    }

    /// Cancellable wait; pending status text is published first.
    pub(super) async fn pause(&mut self, delay: Duration) -> Result<(), TaskError> {
        if self.pending.message.is_some() {
            self.publish();
        }
        if self.ctx.wait(delay).await {
            Ok(())
        } else {
            Err(TaskError::Canceled)
        }
    }

    pub(super) async fn pause_error(&mut self) -> Result<(), TaskError> {
        let delay = self.delays().error;
        self.pause(delay).await
    }

    /// Sends `req` and classifies the outcome.
    ///
    /// `fallback` is where timeouts and server errors leave the task;
    /// `redirects` is the calling state's redirect table, if it has one.
    pub(super) async fn request(
        &mut self,
        req: HttpRequest,
        fallback: Fallback<'_>,
        redirects: Option<&Table>,
    ) -> Result<Reply, TaskError> {
        if self.ctx.is_cancelled() {
            return Err(TaskError::Canceled);
        }
        tracing::debug!(method = %req.method, target = %req.target, "request");
        let sent = select! {
            _ = self.ctx.cancel.cancelled() => return Err(TaskError::Canceled),
            sent = self.session.send(req) => sent,
        };

        let resp = match sent {
            Ok(resp) => resp,
            Err(err) => {
                return match classify(&Signal::transport(err.kind()), &fallback) {
                    Some(t) => self.follow(t, fallback.next).await,
                    None => {
                        tracing::warn!(error = %err, "request failed");
                        self.say(format!("{} ({})", fallback.message, err.kind().as_label()));
                        self.pause_error().await?;
                        Ok(Reply::Moved(fallback.next))
                    }
                };
            }
        };

        if let Some(location) = resp.location.clone() {
            self.note_redirect(&location).await?;
        }
        if let Some(t) = classify(&Signal::status(resp.status), &fallback) {
            return self.follow(t, fallback.next).await;
        }
        self.ck.swaps = 0;

        let rule = match (redirects, resp.location.as_deref()) {
            (Some(table), Some(location)) if resp.is_redirect() => table.find(location).copied(),
            _ => None,
        };
        match rule {
            Some(rule) if rule.next == Next::Proceed => {
                if !rule.message.is_empty() {
                    self.say(rule.message);
                }
                Ok(Reply::Proceed(resp))
            }
            Some(rule) => match self.apply(&rule).await? {
                Some(next) => Ok(Reply::Moved(next)),
                None => Ok(Reply::Response(resp)),
            },
            None => Ok(Reply::Response(resp)),
        }
    }

    async fn follow(&mut self, t: Transition, fallback: State) -> Result<Reply, TaskError> {
        if t.next == State::Abort {
            return Err(TaskError::Canceled);
        }
        if let Some(message) = t.message {
            self.say(message);
        }
        if t.next == fallback {
            self.pause_error().await?;
        }
        Ok(Reply::Moved(t.next))
    }

    /// Applies a matched rule: status text, pause, next state.
    pub(super) async fn apply(&mut self, rule: &Rule) -> Result<Option<State>, TaskError> {
        if !rule.message.is_empty() {
            self.say(rule.message);
        }
        let monitor = self.delays().monitor;
        if let Some(delay) = rule.pause.duration(monitor, self.deps.settings.stock_poll) {
            self.pause(delay).await?;
        }
        Ok(rule.next.resolve(self.state, self.strategy().mode))
    }

    /// Matches `text` against a body or step table.
    pub(super) async fn consult(&mut self, table: &Table, text: &str) -> Result<Option<State>, TaskError> {
        match table.find(text).copied() {
            Some(rule) => self.apply(&rule).await,
            None => Ok(None),
        }
    }

    async fn note_redirect(&mut self, location: &str) -> Result<(), TaskError> {
        let lower = location.to_ascii_lowercase();
        if let Some(ctd) = forms::queue_cursor(location) {
            self.ck.ctd = Some(ctd);
        }
        if lower.contains("checkouts") && !lower.contains("checkpoint") && !lower.contains("throttle") {
            if let Some((store_id, hash)) = forms::checkout_ids(location) {
                self.ck.store_id = Some(store_id);
                self.ck.hash = Some(hash);
                self.ck.admitted = true;
            }
        }
        if lower.contains("processing") {
            self.ck.payment_token = None;
            self.ctx.captcha_token = None;
        }
        if lower.contains("password") {
            let delay = self.delays().monitor;
            self.say("Password page");
            self.pause(delay).await?;
        }
        if lower.contains("stock_problems")
            && matches!(
                self.state,
                State::GoToPayment | State::SubmitPayment | State::CompletePayment
            )
        {
            let delay = self.delays().monitor;
            self.say(format!("Out of stock! Delaying {}ms", delay.as_millis()));
            self.pause(delay).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Delayer;
    use crate::events::{Bus, Event};
    use crate::model::{Mode, fixtures};
    use crate::services::{HarvestQueue, ProxyPool};
    use crate::testing::{self, RecordingWebhooks, ScriptedConnector, ScriptedSession, StubParsers};
    use tokio::sync::{broadcast, watch};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        task: CheckoutTask,
        session: ScriptedSession,
        webhooks: Arc<RecordingWebhooks>,
        captcha: Arc<HarvestQueue>,
        proxies: Arc<ProxyPool>,
        events: broadcast::Receiver<Event>,
        cancel: CancellationToken,
    }

    async fn harness(product: Option<Product>) -> Harness {
        harness_with(fixtures::task("t1"), product).await
    }

    async fn harness_with(config: TaskConfig, product: Option<Product>) -> Harness {
        let bus = Bus::new(256);
        let events = bus.subscribe();
        let session = ScriptedSession::new();
        let webhooks = Arc::new(RecordingWebhooks::default());
        let captcha = Arc::new(HarvestQueue::new());
        let proxies = Arc::new(ProxyPool::from_lines(["1.1.1.1:80", "2.2.2.2:80"]).await);
        let proxy = proxies
            .reserve("t1", config.store.base(), config.platform)
            .await;

        let (_, config_rx) = watch::channel(Arc::new(config));
        let (_, product_rx) = watch::channel(product.map(Arc::new));

        let cancel = CancellationToken::new();
        let ctx = Context::new(
            "t1".into(),
            config_rx,
            product_rx,
            proxy,
            cancel.clone(),
            Delayer::new(),
            bus,
        );
        let deps = TaskDeps {
            proxies: proxies.clone(),
            captcha: captcha.clone(),
            webhooks: webhooks.clone(),
            connector: Arc::new(ScriptedConnector::new(session.clone())),
            parsers: Arc::new(StubParsers::missing()),
            rates: RateCache::new(),
            settings: TaskSettings::default(),
        };
        Harness {
            task: CheckoutTask::new(ctx, deps).unwrap(),
            session,
            webhooks,
            captcha,
            proxies,
            events,
            cancel,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn in_checkout(task: &mut CheckoutTask) {
        task.ck.store_id = Some("1".into());
        task.ck.hash = Some("abc123".into());
        task.ck.product = Some(Arc::new(testing::product()));
        task.ck.pick = Some(Pick {
            id: "21".into(),
            size: "10".into(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_data_reads_token() {
        let mut h = harness(None).await;
        h.session.push(HttpResponse::new(200).with_body(
            r#"<meta name="shopify-checkout-api-token" content="tok42">"#,
        ));
        let next = h.task.step(State::GatherData).await.unwrap();
        assert_eq!(next, State::WaitForProduct);
        assert_eq!(h.task.ck.access_token.as_deref(), Some("tok42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_data_without_token_fails() {
        let mut h = harness(None).await;
        h.session.push(HttpResponse::new(200).with_body("<html></html>"));

        let state = h.task.run().await;
        assert_eq!(state, State::Error);
        let events = drain(&mut h.events);
        let last = events.last().unwrap();
        assert_eq!(last.state, Some(State::Error));
        assert_eq!(last.message.as_deref(), Some("Invalid store"));
        assert_eq!(h.proxies.leased().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_swaps_then_resumes_origin() {
        let mut h = harness(None).await;
        h.session.push(HttpResponse::new(430));
        let next = h.task.step(State::GatherData).await.unwrap();
        assert_eq!(next, State::Swap);
        h.task.transition(State::GatherData, State::Swap);

        let before = h.task.ctx.proxy.clone().unwrap();
        let next = h.task.step(State::Swap).await.unwrap();
        assert_eq!(next, State::GatherData);
        let after = h.task.ctx.proxy.clone().unwrap();
        assert_ne!(before.id, after.id);
        assert_eq!(h.session.proxies().last().unwrap().as_deref(), Some(after.url.as_str()));
        assert_eq!(h.proxies.leased().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_captcha_resumes_after_origin() {
        let mut h = harness(None).await;
        in_checkout(&mut h.task);
        h.task.transition(State::GoToShipping, State::Captcha);

        assert_eq!(h.task.step(State::Captcha).await.unwrap(), State::Captcha);
        let ticket = h.captcha.try_next_ticket().await.unwrap();
        assert_eq!(ticket.task_id, "t1");
        assert!(ticket.fulfill("solved"));

        assert_eq!(h.task.step(State::Captcha).await.unwrap(), State::SubmitShipping);
        assert_eq!(h.task.ctx.captcha_token.as_deref(), Some("solved"));
        assert!(h.task.ctx.captcha.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_order_sends_one_webhook() {
        let mut h = harness(None).await;
        in_checkout(&mut h.task);
        h.task.state = State::ProcessPayment;
        h.session.push(HttpResponse::new(200).with_body(r#"{"payments":[]}"#));
        h.session.push(HttpResponse::new(200).with_body(
            r#"{"payments":[{"transaction":{"status":"success"},
                "checkout":{"order":{"id":1001,"status_url":"https://shop.example.com/orders/1"}}}]}"#,
        ));

        let state = h.task.run().await;
        assert_eq!(state, State::Done);

        let records = h.webhooks.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].product, "Yeezy Boost 350");
        assert_eq!(records[0].price, "220.00");
        assert_eq!(records[0].order.as_ref().unwrap().number, "1001");
        assert_eq!(
            records[0].checkout_url,
            "https://shop.example.com/1/checkouts/abc123"
        );
        assert_eq!(h.webhooks.flushes(), 1);

        let events = drain(&mut h.events);
        let done = events.last().unwrap();
        assert_eq!(done.state, Some(State::Done));
        assert_eq!(done.success, Some(true));
        assert_eq!(done.message.as_deref(), Some("Check email!"));
        assert_eq!(events.iter().filter(|e| e.is_success()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_request() {
        let h = harness(None).await;
        let cancel = h.cancel.clone();
        let mut events = h.events;
        let join = tokio::spawn(h.task.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert_eq!(join.await.unwrap(), State::Abort);
        let last = drain(&mut events).pop().unwrap();
        assert_eq!(last.state, Some(State::Abort));
        assert_eq!(last.message.as_deref(), Some("Stopped"));
        assert_eq!(h.proxies.leased().await, 0);
        assert_eq!(h.session.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_size_matched_stops() {
        let mut product = testing::product();
        product.variants[0].title = "12".into();
        product.variants[0].options = vec!["12".into()];
        let mut h = harness(Some(product)).await;
        let next = h.task.step(State::WaitForProduct).await.unwrap();
        assert_eq!(next, State::Error);
        assert_eq!(h.task.ck.product.as_ref().unwrap().title, "Yeezy Boost 350");
        assert!(h.task.ck.pick.is_none());
    }

    const DECLINED: &str = r#"{"payments":[{"payment_processing_error_message":"Card declined",
        "transaction":{"status":"failure"}}]}"#;

    #[tokio::test(start_paused = true)]
    async fn test_declines_send_one_failure_webhook_and_rewind() {
        for (mode, rewind) in [
            (Mode::Frontend, State::GoToPayment),
            (Mode::Api, State::PaymentToken),
        ] {
            let mut config = fixtures::task("t1");
            config.mode = mode;
            let mut h = harness_with(config, None).await;
            in_checkout(&mut h.task);

            for _ in 0..2 {
                h.task.ck.payment_token = Some("session-1".into());
                h.session.push(HttpResponse::new(200).with_body(DECLINED));
                let next = h.task.step(State::ProcessPayment).await.unwrap();
                assert_eq!(next, rewind);
                assert!(h.task.ck.payment_token.is_none());
            }

            let records = h.webhooks.records();
            assert_eq!(records.len(), 1);
            assert!(!records[0].success);
            let messages: Vec<_> = drain(&mut h.events)
                .into_iter()
                .filter_map(|e| e.message.map(|m| m.to_string()))
                .collect();
            assert!(messages.contains(&"Payment failed: Card declined".to_string()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_retries_until_admitted() {
        let mut h = harness(None).await;
        h.task.transition(State::CreateCheckout, State::Queue);
        h.session.push(HttpResponse::new(200).with_body("<p>You are in line</p>"));

        let started = tokio::time::Instant::now();
        assert_eq!(h.task.step(State::Queue).await.unwrap(), State::Queue);
        assert!(started.elapsed() >= TaskSettings::default().queue_poll);
        assert!(!h.task.ck.admitted);
        assert_eq!(h.session.requests()[0].target, "/checkout/poll?js_poll=1");

        h.session.push(HttpResponse::new(200).with_body(
            r#"<a href="/1/checkouts/abc123">Continue</a>"#,
        ));
        assert_eq!(h.task.step(State::Queue).await.unwrap(), State::GoToCheckout);
        assert_eq!(h.task.ck.store_id.as_deref(), Some("1"));
        assert_eq!(h.task.ck.hash.as_deref(), Some("abc123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_admission_by_redirect_resumes_origin() {
        let mut config = fixtures::task("t1");
        config.mode = Mode::Api;
        let mut h = harness_with(config, None).await;
        h.task.transition(State::AddToCart, State::Queue);
        h.session.push(
            HttpResponse::new(302).with_location("https://shop.example.com/7/checkouts/def456"),
        );

        assert_eq!(h.task.step(State::Queue).await.unwrap(), State::GoToCheckout);
        assert!(h.task.ck.admitted);
        assert_eq!(h.task.ck.store_id.as_deref(), Some("7"));
        assert_eq!(h.task.ck.hash.as_deref(), Some("def456"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_solved_captcha_cuts_poll_short() {
        let mut h = harness(None).await;
        in_checkout(&mut h.task);
        h.task.deps.settings.captcha_poll = Duration::from_secs(3600);
        h.task.transition(State::GoToShipping, State::Captcha);

        let started = tokio::time::Instant::now();
        let captcha = h.captcha.clone();
        let (next, fulfilled) = tokio::join!(h.task.step(State::Captcha), async move {
            captcha.next_ticket().await.fulfill("solved")
        });
        assert_eq!(next.unwrap(), State::Captcha);
        assert!(fulfilled);
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(h.task.step(State::Captcha).await.unwrap(), State::SubmitShipping);
    }

    /// Webhook sink whose flush never completes.
    #[derive(Default)]
    struct StalledWebhooks {
        inserted: std::sync::Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl WebhookManager for StalledWebhooks {
        async fn insert(&self, _record: crate::services::WebhookRecord) {
            *self.inserted.lock().unwrap() += 1;
        }

        async fn send(&self) {
            futures::future::pending::<()>().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_webhook_flush() {
        let mut h = harness(None).await;
        in_checkout(&mut h.task);
        let stalled = Arc::new(StalledWebhooks::default());
        h.task.deps.webhooks = stalled.clone();
        h.task.state = State::ProcessPayment;
        h.session.push(HttpResponse::new(200).with_body(
            r#"{"payments":[{"transaction":{"status":"success"},"checkout":{"order":{"id":7}}}]}"#,
        ));

        let cancel = h.cancel.clone();
        let join = tokio::spawn(h.task.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let state = tokio::time::timeout(Duration::from_secs(60), join)
            .await
            .expect("task kept waiting on the webhook flush")
            .unwrap();
        assert_eq!(state, State::Done);
        assert_eq!(*stalled.inserted.lock().unwrap(), 1);
    }
}
