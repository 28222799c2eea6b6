//! # Proxy leasing.
//!
//! A lease binds one proxy to one task for one (store, platform). No two
//! tasks hold the same proxy for the same store at the same time; the same
//! proxy may serve different stores concurrently.
//!
//! ```text
//! reserve(task, store, platform) ──► first free proxy, moved to the back (round robin)
//! release(task, store, platform, id) ──► frees the lease if `task` holds it
//! swap(task, store, platform, old) ──► reserve new, then release old
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::model::Platform;

/// Proxy ready for use by an HTTP session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    /// Proxy URL, credentials included.
    pub url: String,
}

impl Proxy {
    /// Formats `ip:port`, `ip:port:user:pass` or `http://host:port[:user:pass]`
    /// into a proxy URL. Localhost entries mean "no proxy" and yield `None`.
    pub fn format(raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("127.") || raw.starts_with("localhost") {
            return None;
        }

        if let Some((schema, rest)) = raw.split_once("://") {
            let mut parts = rest.split(':');
            let host = parts.next()?.trim_matches('/');
            let port = parts.next()?;
            return Some(match (parts.next(), parts.next()) {
                (Some(user), Some(pass)) => format!("{schema}://{user}:{pass}@{host}:{port}"),
                _ => format!("{schema}://{host}:{port}"),
            });
        }

        let mut parts = raw.split(':');
        let ip = parts.next()?;
        let port = parts.next()?;
        Some(match (parts.next(), parts.next()) {
            (Some(user), Some(pass)) => format!("http://{user}:{pass}@{ip}:{port}"),
            _ => format!("http://{ip}:{port}"),
        })
    }

    /// `host:port` without credentials, for status lines.
    pub fn label(&self) -> &str {
        let rest = self.url.split_once("://").map_or(self.url.as_str(), |(_, r)| r);
        rest.rsplit_once('@').map_or(rest, |(_, host)| host)
    }
}

/// Proxy leasing collaborator.
#[async_trait]
pub trait ProxyManager: Send + Sync + 'static {
    /// Leases a free proxy for `(store_url, platform)` to `task_id`; `None` runs direct.
    async fn reserve(&self, task_id: &str, store_url: &str, platform: Platform) -> Option<Proxy>;

    /// Frees a lease held by `task_id`.
    async fn release(&self, task_id: &str, store_url: &str, platform: Platform, proxy_id: &str);

    /// Replaces `current` with a fresh lease. The new proxy is reserved before
    /// the old one is released, so a swap never hands back the same proxy.
    async fn swap(
        &self,
        task_id: &str,
        store_url: &str,
        platform: Platform,
        current: Option<&Proxy>,
    ) -> Option<Proxy> {
        let next = self.reserve(task_id, store_url, platform).await;
        if let Some(current) = current {
            self.release(task_id, store_url, platform, &current.id).await;
        }
        next
    }
}

struct Entry {
    proxy: Proxy,
    raw: String,
    /// (store, platform) -> task holding the lease.
    leases: HashMap<(String, Platform), String>,
}

/// In-memory [`ProxyManager`].
#[derive(Default)]
pub struct ProxyPool {
    entries: Mutex<VecDeque<Entry>>,
    next_id: AtomicU64,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool from raw proxy lines.
    pub async fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool = Self::new();
        for line in lines {
            pool.register(line.as_ref()).await;
        }
        pool
    }

    /// Adds a proxy unless the same raw entry is already registered.
    ///
    /// Returns the new proxy id.
    pub async fn register(&self, raw: &str) -> Option<String> {
        let url = Proxy::format(raw)?;
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.raw == raw) {
            tracing::debug!(raw, "proxy already registered");
            return None;
        }
        let id = format!("proxy-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push_back(Entry {
            proxy: Proxy {
                id: id.clone(),
                url,
            },
            raw: raw.to_string(),
            leases: HashMap::new(),
        });
        Some(id)
    }

    /// Removes a proxy from the pool. Tasks holding it keep using it until they swap.
    pub async fn deregister(&self, raw: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.raw != raw);
        entries.len() != before
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Number of leases currently held across all stores.
    pub async fn leased(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.leases.len())
            .sum()
    }
}

#[async_trait]
impl ProxyManager for ProxyPool {
    async fn reserve(&self, task_id: &str, store_url: &str, platform: Platform) -> Option<Proxy> {
        let key = (store_url.to_ascii_lowercase(), platform);
        let mut entries = self.entries.lock().await;
        let pos = entries.iter().position(|e| !e.leases.contains_key(&key))?;
        let mut entry = entries.remove(pos)?;
        entry.leases.insert(key, task_id.to_string());
        let proxy = entry.proxy.clone();
        entries.push_back(entry);
        tracing::debug!(task = task_id, store = store_url, proxy = proxy.label(), "proxy reserved");
        Some(proxy)
    }

    async fn release(&self, task_id: &str, store_url: &str, platform: Platform, proxy_id: &str) {
        let key = (store_url.to_ascii_lowercase(), platform);
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.proxy.id == proxy_id) else {
            tracing::debug!(proxy = proxy_id, "release of unknown proxy skipped");
            return;
        };
        if entry.leases.get(&key).is_some_and(|holder| holder == task_id) {
            entry.leases.remove(&key);
        }
    }
}
