//! # Manager: supervises checkout tasks and their monitors.
//!
//! The [`Manager`] owns the status bus, the [`SubscriberSet`] and the registry
//! of running units. Tasks are spawned on `start` and stay registered until
//! `stop`, even after they reach a terminal state.
//!
//! ## Architecture
//! ```text
//! start(config, kind)
//!   ├─► reserve proxy (task id, store, platform)
//!   ├─► Normal: attach to the monitor for MonitorKey, or create and spawn it
//!   ├─► Context { config watch, product watch, proxy, cancel, delayer, bus }
//!   └─► spawn CheckoutTask::run | RateFetcher::run ──► registry
//!
//! Task / Monitor ── publish(Event) ──► Bus ──► status listener
//!                                                 ├─► SubscriberSet::emit (fire-and-forget)
//!                                                 └─► success? ─► handle_success(id)
//!
//! stop(id)
//!   ├─► cancel token ─► task reaches ABORT, releases its proxy
//!   ├─► await join
//!   └─► detach from monitor (monitor stopped when no ids remain)
//! ```
//!
//! ## Rules
//! - `start` never fails: start errors are logged, reported as an ERROR status and cleaned up.
//! - `stop` of an unknown id is a logged no-op returning `None`.
//! - `start` and `stop` are serialized; an id is claimed before its proxy
//!   is reserved or its monitor attached.
//! - A monitor is started before the task that reads it.
//! - Once a task reports success, every other task with the same
//!   (profile, store, product) is stopped with `Profile already used!`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::ManagerConfig;
use super::rates::RateCache;
use super::registry::{Registry, TaskEntry};
use super::shutdown;
use crate::context::{Context, Delayer};
use crate::error::RuntimeError;
use crate::events::{Bus, Event, EventKind};
use crate::model::{DelayKind, TaskConfig, TaskKind};
use crate::monitor::{Monitor, MonitorDeps, MonitorKey};
use crate::subscribers::{Subscribe, SubscriberSet, SubscriptionId};
use crate::task::{CheckoutTask, RateFetcher, State, TaskDeps};

/// Supervisor of checkout tasks, rate fetchers and shared monitors.
pub struct Manager {
    cfg: ManagerConfig,
    bus: Bus,
    subs: Arc<SubscriberSet>,
    registry: Registry,
    deps: TaskDeps,
    monitor_deps: MonitorDeps,
    runtime: CancellationToken,
    monitor_seq: AtomicU64,
    /// Held across the claim and release of a task id.
    lifecycle: Mutex<()>,
}

impl Manager {
    pub(super) fn new_internal(
        cfg: ManagerConfig,
        bus: Bus,
        subs: Arc<SubscriberSet>,
        deps: TaskDeps,
        monitor_deps: MonitorDeps,
    ) -> Self {
        Self {
            cfg,
            bus,
            subs,
            registry: Registry::new(),
            deps,
            monitor_deps,
            runtime: CancellationToken::new(),
            monitor_seq: AtomicU64::new(1),
            lifecycle: Mutex::new(()),
        }
    }

    /// Forwards bus events to subscribers and runs the success dedup.
    ///
    /// Holds a weak reference so a dropped manager ends the listener.
    pub(super) fn spawn_listener(self: &Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let subs = Arc::clone(&self.subs);
        let runtime = self.runtime.clone();
        let me: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    _ = runtime.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => ev,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "status listener lagged");
                            continue;
                        }
                    },
                };
                subs.emit(&ev).await;
                if ev.is_success() {
                    let Some(manager) = me.upgrade() else { break };
                    for id in ev.task_ids.iter() {
                        let manager = Arc::clone(&manager);
                        let id = id.to_string();
                        tokio::spawn(async move { manager.handle_success(&id).await });
                    }
                }
            }
        });
    }

    /// Starts a task. Never fails; problems are reported on the task's status stream.
    pub async fn start(&self, config: TaskConfig, kind: TaskKind) {
        let id = config.id.clone();
        let _claim = self.lifecycle.lock().await;
        if self.registry.contains(&id).await {
            tracing::warn!(task = %id, "task already running; start ignored");
            return;
        }
        let config = Arc::new(config);
        let proxy = self
            .deps
            .proxies
            .reserve(&id, config.store.base(), config.platform)
            .await;

        let monitor = match kind {
            TaskKind::Normal => {
                let key = MonitorKey::of(&config);
                let (handle, created) = self
                    .registry
                    .attach_monitor(&key, &id, || self.new_monitor(&config))
                    .await;
                tracing::debug!(task = %id, monitor = %key, created, "monitor attached");
                Some((key, handle.product()))
            }
            TaskKind::Rates => None,
        };
        let product = match &monitor {
            Some((_, product)) => product.clone(),
            None => watch::channel(None).1,
        };

        let (config_tx, config_rx) = watch::channel(Arc::clone(&config));
        let cancel = self.runtime.child_token();
        let delayer = Delayer::new();
        let ctx = Context::new(
            Arc::from(id.as_str()),
            config_rx,
            product,
            proxy.clone(),
            cancel.clone(),
            delayer.clone(),
            self.bus.clone(),
        );
        let deps = self.deps.clone();
        let spawned: Result<JoinHandle<State>, _> = match kind {
            TaskKind::Normal => CheckoutTask::new(ctx, deps).map(|t| tokio::spawn(t.run())),
            TaskKind::Rates => RateFetcher::new(ctx, deps).map(|t| tokio::spawn(t.run())),
        };
        let monitor = monitor.map(|(key, _)| key);

        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                tracing::error!(task = %id, error = %err, label = err.as_label(), "task failed to start");
                self.bus.publish(
                    Event::new(EventKind::TaskStatus)
                        .with_task(id.as_str())
                        .with_state(State::Error)
                        .with_message(err.as_message()),
                );
                if let Some(key) = &monitor {
                    self.registry.detach_monitor(key, &id).await;
                }
                if let Some(proxy) = proxy {
                    self.deps
                        .proxies
                        .release(&id, config.store.base(), config.platform, &proxy.id)
                        .await;
                }
                return;
            }
        };

        let entry = TaskEntry {
            kind,
            config: config_tx,
            cancel,
            delayer,
            join,
            monitor,
        };
        if let Err(entry) = self.registry.insert(id.clone(), entry).await {
            // the registered entry owns the monitor attachment
            tracing::warn!(task = %id, "task already running; start ignored");
            entry.cancel.cancel();
            let _ = entry.join.await;
            return;
        }
        tracing::info!(task = %id, kind = ?kind, "task started");
    }

    fn new_monitor(&self, config: &TaskConfig) -> Monitor {
        let n = self.monitor_seq.fetch_add(1, Ordering::Relaxed);
        Monitor::new(format!("monitor-{n}"), config, self.monitor_deps.clone())
    }

    /// Stops a task and returns its id, or `None` if no such task runs.
    pub async fn stop(&self, id: &str) -> Option<String> {
        let _claim = self.lifecycle.lock().await;
        let Some(entry) = self.registry.remove(id).await else {
            tracing::warn!(task = id, "stop of unknown task ignored");
            return None;
        };
        entry.cancel.cancel();
        match entry.join.await {
            Ok(state) => tracing::info!(task = id, state = %state, "task stopped"),
            Err(e) => tracing::warn!(task = id, error = %e, "task join failed"),
        }
        if let Some(key) = &entry.monitor {
            if self.registry.detach_monitor(key, id).await {
                tracing::debug!(monitor = %key, "monitor removed");
            }
        }
        Some(id.to_string())
    }

    /// Applies a new configuration to a running task without resetting its state.
    ///
    /// A changed product matcher or store moves the task to another monitor.
    /// That is a full stop and start, so the task begins again at its
    /// initial state.
    pub async fn restart(&self, config: TaskConfig) {
        let id = config.id.clone();
        let current = self
            .registry
            .with_task(&id, |e| (e.kind, e.monitor.clone()))
            .await;
        let Some((kind, monitor)) = current else {
            tracing::warn!(task = %id, "restart of unknown task ignored");
            return;
        };

        if kind == TaskKind::Normal && monitor.as_ref() != Some(&MonitorKey::of(&config)) {
            tracing::info!(task = %id, "product changed; restarting task");
            self.stop(&id).await;
            self.start(config, kind).await;
            return;
        }

        let delay = config.delays.monitor;
        let config = Arc::new(config);
        self.registry
            .with_task(&id, |e| {
                e.config.send_replace(config);
                e.delayer.clear();
            })
            .await;
        if let Some(key) = &monitor {
            if let Some(handle) = self.registry.monitor(key).await {
                handle.set_delay(delay);
            }
        }
        tracing::info!(task = %id, "task configuration updated");
    }

    pub async fn start_all(&self, configs: Vec<TaskConfig>, kind: TaskKind) {
        for config in configs {
            self.start(config, kind).await;
        }
    }

    /// Stops every registered task; returns the ids stopped.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for id in self.registry.ids().await {
            if let Some(id) = self.stop(&id).await {
                stopped.push(id);
            }
        }
        stopped
    }

    pub async fn restart_all(&self, configs: Vec<TaskConfig>) {
        for config in configs {
            self.restart(config).await;
        }
    }

    /// Sets the monitor or error delay of every running task and wakes pending waits.
    pub async fn change_delay(&self, delay: Duration, kind: DelayKind) {
        tracing::info!(kind = ?kind, delay_ms = delay.as_millis() as u64, "changing delay");
        self.registry
            .for_each(|_, entry| {
                entry.config.send_modify(|config| {
                    let mut next = TaskConfig::clone(config);
                    match kind {
                        DelayKind::Monitor => next.delays.monitor = delay,
                        DelayKind::Error => next.delays.error = delay,
                    }
                    *config = Arc::new(next);
                });
                entry.delayer.clear();
            })
            .await;
        if kind == DelayKind::Monitor {
            self.registry.for_each_monitor(|h| h.set_delay(delay)).await;
        }
    }

    /// Stops every other task that would buy the same product with the same profile at the same store.
    pub async fn handle_success(&self, id: &str) {
        let Some(key) = self
            .registry
            .with_task(id, |e| e.config().purchase_key())
            .await
        else {
            return;
        };
        let mut duplicates = Vec::new();
        self.registry
            .for_each(|other, entry| {
                if other != id
                    && entry.kind == TaskKind::Normal
                    && entry.config().purchase_key() == key
                {
                    duplicates.push(other.to_string());
                }
            })
            .await;

        for other in duplicates {
            tracing::info!(task = %other, winner = id, "profile already used; stopping");
            self.bus.publish(
                Event::new(EventKind::TaskStatus)
                    .with_task(other.as_str())
                    .with_message("Profile already used!"),
            );
            self.stop(&other).await;
        }
    }

    pub async fn register_for_task_events(&self, sub: Arc<dyn Subscribe>) -> SubscriptionId {
        self.subs.add(sub).await
    }

    pub async fn deregister_for_task_events(&self, id: SubscriptionId) -> bool {
        self.subs.remove(id).await
    }

    /// Raw receiver on the status bus.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Sorted ids of registered tasks.
    pub async fn running(&self) -> Vec<String> {
        self.registry.ids().await
    }

    pub async fn monitor_count(&self) -> usize {
        self.registry.monitor_count().await
    }

    /// Task ids attached to the monitor that serves `config`.
    pub async fn monitor_tasks(&self, config: &TaskConfig) -> Option<Vec<String>> {
        let handle = self.registry.monitor(&MonitorKey::of(config)).await?;
        Some(handle.task_ids().iter().map(|id| id.to_string()).collect())
    }

    /// Rates cached by rate fetchers.
    pub fn rates(&self) -> &RateCache {
        &self.deps.rates
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    /// Waits for a termination signal, then shuts down within the configured grace.
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        shutdown::wait_for_shutdown_signal().await?;
        tracing::info!("termination signal received");
        self.shutdown(self.cfg.grace).await
    }

    /// Cancels every task and monitor and waits up to `grace` for them to exit.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), RuntimeError> {
        let mut joins: Vec<(String, JoinHandle<()>)> = Vec::new();
        for id in self.registry.ids().await {
            if let Some(entry) = self.registry.remove(&id).await {
                entry.cancel.cancel();
                let join = tokio::spawn(async move {
                    let _ = entry.join.await;
                });
                joins.push((id, join));
            }
        }
        joins.extend(self.registry.drain_monitors().await);

        let done = async {
            for (_, join) in joins.iter_mut() {
                let _ = join.await;
            }
        };
        let result = match tokio::time::timeout(grace, done).await {
            Ok(()) => {
                tracing::info!("all tasks stopped within grace");
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<String> = joins
                    .iter()
                    .filter(|(_, j)| !j.is_finished())
                    .map(|(id, _)| id.clone())
                    .collect();
                tracing::warn!(?stuck, "shutdown grace exceeded");
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        };
        self.runtime.cancel();
        self.subs.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManagerBuilder;
    use crate::error::FetchError;
    use crate::http::{Connector, HttpResponse, HttpSession};
    use crate::model::{Store, fixtures};
    use crate::policies::JitterPolicy;
    use crate::services::{Proxy, ProxyManager, ProxyPool};
    use crate::testing::{RecordingWebhooks, ScriptedConnector, ScriptedSession, StubParsers};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Collect(Arc<Mutex<Vec<Event>>>);

    #[async_trait]
    impl Subscribe for Collect {
        async fn on_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct BrokenConnector;

    impl Connector for BrokenConnector {
        fn session(
            &self,
            _store: &Store,
            _proxy: Option<&Proxy>,
        ) -> Result<Box<dyn HttpSession>, FetchError> {
            Err(FetchError::InvalidRequest {
                reason: "broken".into(),
            })
        }
    }

    async fn manager(
        session: &ScriptedSession,
        parsers: StubParsers,
        proxies: Arc<ProxyPool>,
    ) -> Arc<Manager> {
        let cfg = ManagerConfig {
            monitor_jitter: JitterPolicy::None,
            ..ManagerConfig::default()
        };
        ManagerBuilder::new(cfg)
            .with_proxies(proxies)
            .with_webhooks(Arc::new(RecordingWebhooks::default()))
            .with_connector(Arc::new(ScriptedConnector::new(session.clone())))
            .with_parsers(Arc::new(parsers))
            .build()
            .await
    }

    async fn pool() -> Arc<ProxyPool> {
        Arc::new(ProxyPool::from_lines(["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80", "4.4.4.4:80"]).await)
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_tasks_share_one_monitor() {
        let session = ScriptedSession::new();
        let m = manager(&session, StubParsers::missing(), pool().await).await;
        for id in ["a", "b", "c"] {
            m.start(fixtures::task(id), TaskKind::Normal).await;
        }
        assert_eq!(m.monitor_count().await, 1);
        assert_eq!(
            m.monitor_tasks(&fixtures::task("x")).await.unwrap(),
            ["a", "b", "c"]
        );

        assert_eq!(m.stop("a").await.as_deref(), Some("a"));
        assert_eq!(m.running().await, ["b", "c"]);
        assert_eq!(m.monitor_count().await, 1);

        assert_eq!(m.stop_all().await, ["b", "c"]);
        assert!(m.running().await.is_empty());
        assert_eq!(m.monitor_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_share_one_monitor() {
        let session = ScriptedSession::new();
        let m = manager(&session, StubParsers::missing(), pool().await).await;
        let starts: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|id| {
                let m = Arc::clone(&m);
                tokio::spawn(async move { m.start(fixtures::task(id), TaskKind::Normal).await })
            })
            .collect();
        for start in starts {
            start.await.unwrap();
        }

        assert_eq!(m.monitor_count().await, 1);
        let mut attached = m.monitor_tasks(&fixtures::task("x")).await.unwrap();
        attached.sort();
        assert_eq!(attached, ["a", "b", "c", "d", "e"]);
        m.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_of_one_id_keeps_its_monitor() {
        for _ in 0..100 {
            let session = ScriptedSession::new();
            let proxies = pool().await;
            let m = manager(&session, StubParsers::missing(), proxies.clone()).await;
            let (m1, m2) = (Arc::clone(&m), Arc::clone(&m));
            let first =
                tokio::spawn(async move { m1.start(fixtures::task("a"), TaskKind::Normal).await });
            let second =
                tokio::spawn(async move { m2.start(fixtures::task("a"), TaskKind::Normal).await });
            first.await.unwrap();
            second.await.unwrap();

            assert_eq!(m.running().await, ["a"]);
            assert_eq!(m.monitor_count().await, 1);
            assert_eq!(m.monitor_tasks(&fixtures::task("x")).await.unwrap(), ["a"]);

            m.stop("a").await;
            assert_eq!(m.monitor_count().await, 0);
            m.shutdown(Duration::from_secs(5)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unknown_is_a_no_op() {
        let session = ScriptedSession::new();
        let proxies = pool().await;
        let m = manager(&session, StubParsers::missing(), proxies.clone()).await;
        let held = proxies
            .reserve("outside", "https://shop.example.com", crate::model::Platform::Shopify)
            .await;
        assert!(held.is_some());

        assert_eq!(m.stop("ghost").await, None);
        assert_eq!(proxies.leased().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_task_proxy() {
        let session = ScriptedSession::new();
        let proxies = pool().await;
        let m = manager(&session, StubParsers::missing(), proxies.clone()).await;
        m.start(fixtures::task("a"), TaskKind::Normal).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        // one lease for the task, one for its monitor
        assert_eq!(proxies.leased().await, 2);

        m.stop("a").await;
        assert_eq!(proxies.leased().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_only_same_purchase() {
        let session = ScriptedSession::new();
        let m = manager(&session, StubParsers::missing(), pool().await).await;
        let mut events = m.events();

        let mut other_profile = fixtures::task("c");
        other_profile.profile.id = "profile-2".into();
        m.start(fixtures::task("a"), TaskKind::Normal).await;
        m.start(fixtures::task("b"), TaskKind::Normal).await;
        m.start(other_profile, TaskKind::Normal).await;

        m.handle_success("a").await;
        assert_eq!(m.running().await, ["a", "c"]);

        let mut used = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.message.as_deref() == Some("Profile already used!") {
                used.extend(ev.task_ids.iter().map(|id| id.to_string()));
            }
        }
        assert_eq!(used, ["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_is_reported_and_cleaned_up() {
        let proxies = pool().await;
        let m = ManagerBuilder::new(ManagerConfig::default())
            .with_proxies(proxies.clone())
            .with_connector(Arc::new(BrokenConnector))
            .with_parsers(Arc::new(StubParsers::missing()))
            .build()
            .await;
        let mut events = m.events();

        m.start(fixtures::task("a"), TaskKind::Normal).await;
        assert!(m.running().await.is_empty());
        assert_eq!(m.monitor_count().await, 0);
        assert_eq!(proxies.leased().await, 0);

        let failed = std::iter::from_fn(|| events.try_recv().ok())
            .find(|ev| ev.kind == EventKind::TaskStatus)
            .unwrap();
        assert_eq!(failed.state, Some(State::Error));
        assert!(failed.concerns("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_and_change_delay_update_config_in_place() {
        let session = ScriptedSession::new();
        let m = manager(&session, StubParsers::missing(), pool().await).await;
        m.start(fixtures::task("a"), TaskKind::Normal).await;

        let mut edited = fixtures::task("a");
        edited.profile.name = "Backup".into();
        m.restart(edited).await;
        let name = m
            .registry
            .with_task("a", |e| e.config().profile.name.clone())
            .await;
        assert_eq!(name.as_deref(), Some("Backup"));
        assert_eq!(m.monitor_count().await, 1);

        m.change_delay(Duration::from_millis(900), DelayKind::Error).await;
        let error = m.registry.with_task("a", |e| e.config().delays.error).await;
        assert_eq!(error, Some(Duration::from_millis(900)));

        let mut moved = fixtures::task("a");
        moved.product = crate::monitor::ProductMatcher::Variant { id: "99".into() };
        m.restart(moved).await;
        assert_eq!(m.running().await, ["a"]);
        assert_eq!(m.monitor_count().await, 1);
        assert!(m.monitor_tasks(&fixtures::task("x")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_fetcher_fills_cache() {
        let session = ScriptedSession::new();
        session.push(HttpResponse::new(200).with_body("{}"));
        session.push(HttpResponse::new(200).with_body(
            r#"{"shipping_rates":[{"name":"Ground","code":"Ground","price":"7.50","source":"ups"}]}"#,
        ));
        let m = manager(&session, StubParsers::found(), pool().await).await;
        let mut events = m.events();

        m.start(fixtures::task("r"), TaskKind::Rates).await;
        assert_eq!(m.monitor_count().await, 0);
        loop {
            let ev = events.recv().await.unwrap();
            if ev.state == Some(State::Done) {
                assert_eq!(ev.rate.as_ref().unwrap().id, "ups-Ground-7.50");
                break;
            }
        }
        let cached = m.rates().get(&fixtures::task("other")).await.unwrap();
        assert_eq!(cached.price, "7.50");
        assert_eq!(m.running().await, ["r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_and_shutdown() {
        let session = ScriptedSession::new();
        let proxies = pool().await;
        let m = manager(&session, StubParsers::missing(), proxies.clone()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = m
            .register_for_task_events(Arc::new(Collect(Arc::clone(&seen))))
            .await;

        m.start(fixtures::task("a"), TaskKind::Normal).await;
        m.start(fixtures::task("b"), TaskKind::Normal).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().iter().any(|e| e.concerns("a")));
        assert!(m.deregister_for_task_events(sub).await);

        m.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(m.running().await.is_empty());
        assert_eq!(m.monitor_count().await, 0);
        assert_eq!(proxies.leased().await, 0);
    }
}
