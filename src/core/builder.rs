use std::sync::Arc;

use crate::core::{ManagerConfig, RateCache};
use crate::events::Bus;
use crate::http::{Connector, ReqwestConnector};
use crate::monitor::{DefaultParsers, MonitorDeps, ParserFactory};
use crate::services::{
    CaptchaManager, HarvestQueue, ProxyManager, ProxyPool, WebhookDispatcher, WebhookManager,
};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::task::TaskDeps;

use super::manager::Manager;

/// Builder for a [`Manager`] with its collaborators.
///
/// Every collaborator has an in-process default: an empty [`ProxyPool`]
/// (tasks run direct), a [`HarvestQueue`] nobody drains, a
/// [`WebhookDispatcher`] without hooks, the `reqwest` connector and the
/// built-in JSON parser.
pub struct ManagerBuilder {
    cfg: ManagerConfig,
    subscribers: Vec<Arc<dyn Subscribe>>,
    proxies: Option<Arc<dyn ProxyManager>>,
    captcha: Option<Arc<dyn CaptchaManager>>,
    webhooks: Option<Arc<dyn WebhookManager>>,
    connector: Option<Arc<dyn Connector>>,
    parsers: Option<Arc<dyn ParserFactory>>,
    rates: Option<RateCache>,
}

impl ManagerBuilder {
    pub fn new(cfg: ManagerConfig) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            proxies: None,
            captcha: None,
            webhooks: None,
            connector: None,
            parsers: None,
            rates: None,
        }
    }

    /// Subscribers registered before the first task starts.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    pub fn with_proxies(mut self, proxies: Arc<dyn ProxyManager>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_captcha(mut self, captcha: Arc<dyn CaptchaManager>) -> Self {
        self.captcha = Some(captcha);
        self
    }

    pub fn with_webhooks(mut self, webhooks: Arc<dyn WebhookManager>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_parsers(mut self, parsers: Arc<dyn ParserFactory>) -> Self {
        self.parsers = Some(parsers);
        self
    }

    /// Shares a rate cache with another manager, or pre-seeds one.
    pub fn with_rates(mut self, rates: RateCache) -> Self {
        self.rates = Some(rates);
        self
    }

    /// Builds the manager and spawns its status listener.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn build(self) -> Arc<Manager> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let subs = Arc::new(SubscriberSet::new());
        for sub in self.subscribers {
            subs.add(sub).await;
        }

        let proxies = self
            .proxies
            .unwrap_or_else(|| Arc::new(ProxyPool::new()));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ReqwestConnector::new(self.cfg.request_timeout)));
        let parsers = self.parsers.unwrap_or_else(|| Arc::new(DefaultParsers));

        let deps = TaskDeps {
            proxies: Arc::clone(&proxies),
            captcha: self.captcha.unwrap_or_else(|| Arc::new(HarvestQueue::new())),
            webhooks: self
                .webhooks
                .unwrap_or_else(|| Arc::new(WebhookDispatcher::new(Vec::<String>::new()))),
            connector: Arc::clone(&connector),
            parsers: Arc::clone(&parsers),
            rates: self.rates.unwrap_or_default(),
            settings: self.cfg.task_settings(),
        };
        let monitor_deps = MonitorDeps {
            proxies,
            connector,
            parsers,
            bus: bus.clone(),
            backoff: self.cfg.swap_backoff,
            jitter: self.cfg.monitor_jitter,
        };

        let manager = Arc::new(Manager::new_internal(self.cfg, bus, subs, deps, monitor_deps));
        manager.spawn_listener();
        manager
    }
}
