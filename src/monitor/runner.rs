//! # Monitor: the product polling loop.
//!
//! One monitor serves every task whose [`MonitorKey`] is equal. It resolves
//! the product through the raced parsers, publishes it into a watch channel
//! read by the attached tasks, then keeps polling at the monitor delay so
//! variant availability stays fresh.
//!
//! ```text
//! loop {
//!   ├─► cancelled?                    → release proxy, exit
//!   ├─► race(parsers)
//!   │     ├─ Ok(product)              → publish if changed, "Product found: .."
//!   │     ├─ ban / reset              → "Proxy banned!", swap proxy, backoff
//!   │     ├─ unsupported matcher      → report once, park until stopped
//!   │     └─ not found / placeholder  → "<reason> Delaying Nms"
//!   └─► wait (cancellable, cut short by Delayer::clear)
//! }
//! ```
//!
//! ## Rules
//! - The monitor holds its own proxy lease, keyed by the monitor id.
//! - Cancelling a task never cancels its monitor; the registry stops it
//!   when the last attached task id is detached.
//! - Status events carry every task id attached at the time of the event.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::matcher::{MonitorKey, ProductMatcher};
use super::parser::{ParserFactory, race};
use super::product::Product;
use crate::classify::{Fallback, Signal, classify};
use crate::context::Delayer;
use crate::error::ParseError;
use crate::events::{Bus, Event, EventKind};
use crate::http::Connector;
use crate::model::{Platform, Store, TaskConfig};
use crate::policies::{BackoffPolicy, JitterPolicy};
use crate::services::ProxyManager;
use crate::task::State;

/// Collaborators a monitor needs.
#[derive(Clone)]
pub struct MonitorDeps {
    pub proxies: Arc<dyn ProxyManager>,
    pub connector: Arc<dyn Connector>,
    pub parsers: Arc<dyn ParserFactory>,
    pub bus: Bus,
    pub backoff: BackoffPolicy,
    pub jitter: JitterPolicy,
}

/// Channels shared between a running monitor and the registry.
#[derive(Clone)]
pub struct MonitorHandle {
    tasks: Arc<watch::Sender<Vec<Arc<str>>>>,
    product: Arc<watch::Sender<Option<Arc<Product>>>>,
    delay: Arc<watch::Sender<Duration>>,
    delayer: Delayer,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Adds a dependent task id. Returns `false` if it was already attached.
    pub fn attach(&self, task_id: &str) -> bool {
        self.tasks.send_if_modified(|ids| {
            if ids.iter().any(|id| id.as_ref() == task_id) {
                false
            } else {
                ids.push(Arc::from(task_id));
                true
            }
        })
    }

    /// Removes a dependent task id and returns how many remain.
    pub fn detach(&self, task_id: &str) -> usize {
        self.tasks.send_if_modified(|ids| {
            let before = ids.len();
            ids.retain(|id| id.as_ref() != task_id);
            ids.len() != before
        });
        self.tasks.borrow().len()
    }

    pub fn task_ids(&self) -> Vec<Arc<str>> {
        self.tasks.borrow().clone()
    }

    /// Receiver a task reads the resolved product from.
    pub fn product(&self) -> watch::Receiver<Option<Arc<Product>>> {
        self.product.subscribe()
    }

    /// Changes the poll delay and wakes the monitor so it applies at once.
    pub fn set_delay(&self, delay: Duration) {
        self.delay.send_replace(delay);
        self.delayer.clear();
    }

    /// Ends the current wait early.
    pub fn refresh(&self) {
        self.delayer.clear();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

enum Recovery {
    Swap,
    Delay(String),
    Park(&'static str),
    Stop,
}

fn recovery(err: &ParseError) -> Recovery {
    let signal = match err {
        ParseError::Fetch(f) => Signal::transport(f.kind()),
        ParseError::Status { status } => Signal::status(*status),
        _ => Signal::default(),
    };
    let fallback = Fallback {
        next: State::WaitForProduct,
        message: "Monitor error",
    };
    if let Some(t) = classify(&signal, &fallback) {
        return match t.next {
            State::Swap => Recovery::Swap,
            State::Abort => Recovery::Stop,
            _ => Recovery::Delay(t.message.unwrap_or_else(|| fallback.message.to_string())),
        };
    }
    match err {
        ParseError::Placeholder => Recovery::Delay("Placeholder found!".into()),
        ParseError::Password => Recovery::Delay("Password page.".into()),
        ParseError::Unsupported { .. } => Recovery::Park("Unsupported product matcher"),
        _ => Recovery::Delay("No product found.".into()),
    }
}

/// Product poller shared by tasks with an equal [`MonitorKey`].
pub struct Monitor {
    id: Arc<str>,
    key: MonitorKey,
    platform: Platform,
    store: Store,
    matcher: ProductMatcher,
    handle: MonitorHandle,
    deps: MonitorDeps,
}

impl Monitor {
    /// Builds a monitor for `config`'s product, with `config`'s task attached.
    pub fn new(id: impl Into<Arc<str>>, config: &TaskConfig, deps: MonitorDeps) -> Self {
        let (tasks, _) = watch::channel(vec![Arc::from(config.id.as_str())]);
        let (product, _) = watch::channel(None);
        let (delay, _) = watch::channel(config.delays.monitor);
        Self {
            id: id.into(),
            key: MonitorKey::of(config),
            platform: config.platform,
            store: config.store.clone(),
            matcher: config.product.clone(),
            handle: MonitorHandle {
                tasks: Arc::new(tasks),
                product: Arc::new(product),
                delay: Arc::new(delay),
                delayer: Delayer::new(),
                cancel: CancellationToken::new(),
            },
            deps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &MonitorKey {
        &self.key
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    fn status(&self, f: impl FnOnce(Event) -> Event) {
        let ev = Event::new(EventKind::MonitorStatus).with_tasks(self.handle.task_ids());
        self.deps.bus.publish(f(ev));
    }

    fn say(&self, message: impl Into<Arc<str>>) {
        let message = message.into();
        self.status(|ev| ev.with_message(message));
    }

    /// Runs until stopped.
    pub async fn run(self) {
        let span = tracing::info_span!("monitor", id = %self.id, key = %self.key);
        self.poll().instrument(span).await
    }

    async fn poll(self) {
        let cancel = self.handle.cancel.clone();
        let store_url = self.store.base().to_string();
        let mut proxy = self
            .deps
            .proxies
            .reserve(&self.id, &store_url, self.platform)
            .await;
        let mut session = match self.deps.connector.session(&self.store, proxy.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "monitor cannot open a session");
                self.say("Invalid store");
                if let Some(p) = proxy {
                    self.deps
                        .proxies
                        .release(&self.id, &store_url, self.platform, &p.id)
                        .await;
                }
                return;
            }
        };

        let mut swaps: u32 = 0;
        let mut last_message: Option<String> = None;
        self.say("Parsing products");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let parsers = self.deps.parsers.parsers(self.platform, &self.matcher);
            let result = select! {
                _ = cancel.cancelled() => break,
                r = race(&parsers, session.as_ref(), &self.store, &self.matcher) => r,
            };
            let delay = *self.handle.delay.borrow();

            let wait = match result {
                Ok(product) => {
                    swaps = 0;
                    last_message = None;
                    let product = Arc::new(product);
                    let changed = self.handle.product.send_if_modified(|current| {
                        if current.as_deref() == Some(product.as_ref()) {
                            false
                        } else {
                            *current = Some(Arc::clone(&product));
                            true
                        }
                    });
                    if changed {
                        tracing::debug!(title = %product.title, "product resolved");
                        let title = product.title.clone();
                        let image = product.image.clone();
                        self.status(|ev| {
                            let ev = ev
                                .with_message(format!("Product found: {title}"))
                                .with_product(title);
                            match image {
                                Some(image) => ev.with_image(image),
                                None => ev,
                            }
                        });
                    }
                    self.deps.jitter.apply(delay)
                }
                Err(err) => match recovery(&err) {
                    Recovery::Swap => {
                        tracing::debug!(error = %err, "proxy banned, swapping");
                        self.say("Proxy banned!");
                        let next = self
                            .deps
                            .proxies
                            .swap(&self.id, &store_url, self.platform, proxy.as_ref())
                            .await;
                        if let Err(e) = session.use_proxy(next.as_ref()) {
                            tracing::warn!(error = %e, "monitor proxy rejected, running direct");
                        }
                        proxy = next;
                        let wait = self.deps.backoff.next(swaps);
                        swaps = swaps.saturating_add(1);
                        wait
                    }
                    Recovery::Delay(reason) => {
                        let message = format!("{reason} Delaying {}ms", delay.as_millis());
                        if last_message.as_deref() != Some(message.as_str()) {
                            self.say(message.clone());
                            last_message = Some(message);
                        }
                        delay
                    }
                    Recovery::Park(reason) => {
                        tracing::warn!(error = %err, "monitor parked");
                        self.say(reason);
                        cancel.cancelled().await;
                        break;
                    }
                    Recovery::Stop => break,
                },
            };

            if !self.handle.delayer.wait(wait, &cancel).await {
                break;
            }
        }

        if let Some(p) = proxy {
            self.deps
                .proxies
                .release(&self.id, &store_url, self.platform, &p.id)
                .await;
        }
        tracing::debug!("monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::model::fixtures;
    use crate::monitor::DefaultParsers;
    use crate::services::ProxyPool;
    use crate::testing::{ScriptedConnector, ScriptedSession};

    const PRODUCTS: &str = r#"{"products":[{"id":2,"title":"Yeezy Boost 350","handle":"yb",
        "variants":[{"id":21,"title":"10","available":true,"price":"220.00"}]}]}"#;

    fn deps(session: &ScriptedSession, proxies: Arc<ProxyPool>, bus: &Bus) -> MonitorDeps {
        MonitorDeps {
            proxies,
            connector: Arc::new(ScriptedConnector::new(session.clone())),
            parsers: Arc::new(DefaultParsers),
            bus: bus.clone(),
            backoff: BackoffPolicy::default(),
            jitter: JitterPolicy::None,
        }
    }

    async fn next_message(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> String {
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::MonitorStatus);
        ev.message.as_deref().unwrap_or_default().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_product_to_attached_tasks() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let session = ScriptedSession::new();
        session.push(HttpResponse::new(200).with_body(r#"{"products":[]}"#));
        session.push(HttpResponse::new(200).with_body(PRODUCTS));
        let pool = Arc::new(ProxyPool::from_lines(["1.1.1.1:80"]).await);

        let monitor = Monitor::new("m1", &fixtures::task("a"), deps(&session, pool.clone(), &bus));
        let handle = monitor.handle();
        assert!(handle.attach("b"));
        assert!(!handle.attach("b"));
        let mut product = handle.product();
        let join = tokio::spawn(monitor.run());

        assert_eq!(next_message(&mut rx).await, "Parsing products");
        assert_eq!(next_message(&mut rx).await, "No product found. Delaying 3500ms");

        product.changed().await.unwrap();
        assert_eq!(product.borrow().as_ref().unwrap().title, "Yeezy Boost 350");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.message.as_deref(), Some("Product found: Yeezy Boost 350"));
        assert_eq!(ev.task_ids.len(), 2);
        assert_eq!(pool.leased().await, 1);

        assert_eq!(handle.detach("a"), 1);
        handle.stop();
        join.await.unwrap();
        assert_eq!(pool.leased().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_swaps_proxy() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let session = ScriptedSession::new();
        session.push(HttpResponse::new(430));
        session.push(HttpResponse::new(200).with_body(PRODUCTS));
        let pool = Arc::new(ProxyPool::from_lines(["1.1.1.1:80", "2.2.2.2:80"]).await);

        let monitor = Monitor::new("m1", &fixtures::task("a"), deps(&session, pool.clone(), &bus));
        let handle = monitor.handle();
        let join = tokio::spawn(monitor.run());

        assert_eq!(next_message(&mut rx).await, "Parsing products");
        assert_eq!(next_message(&mut rx).await, "Proxy banned!");
        assert_eq!(
            next_message(&mut rx).await,
            "Product found: Yeezy Boost 350"
        );
        let used = session.proxies();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_matcher_parks() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let session = ScriptedSession::new();
        let mut cfg = fixtures::task("a");
        cfg.product = ProductMatcher::Special {
            name: "drop".into(),
            value: String::new(),
        };
        let pool = Arc::new(ProxyPool::new());
        let monitor = Monitor::new("m1", &cfg, deps(&session, pool, &bus));
        let handle = monitor.handle();
        let join = tokio::spawn(monitor.run());

        assert_eq!(next_message(&mut rx).await, "Parsing products");
        assert_eq!(next_message(&mut rx).await, "Unsupported product matcher");
        handle.stop();
        join.await.unwrap();
    }
}
