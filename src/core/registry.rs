//! # Registry of running tasks and monitors.
//!
//! The registry owns the handles the manager needs to reach a running unit
//! after it was spawned: the config sender, the cancellation token, the
//! delayer and the join handle of every task, plus the shared monitors.
//!
//! ```text
//! tasks:    task id ──► TaskEntry { config tx, cancel, delayer, join, monitor key }
//! monitors: MonitorKey ──► MonitorEntry { handle (attached ids, product), join }
//! ```
//!
//! ## Rules
//! - At most one entry per task id.
//! - Monitor lookup and insert happen under one lock, so tasks started
//!   concurrently for the same key share one monitor.
//! - A monitor is removed (and stopped) together with its last attached task id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::Delayer;
use crate::model::{TaskConfig, TaskKind};
use crate::monitor::{Monitor, MonitorHandle, MonitorKey};
use crate::task::State;

/// Handles of one running task.
pub(super) struct TaskEntry {
    pub kind: TaskKind,
    pub config: watch::Sender<Arc<TaskConfig>>,
    pub cancel: CancellationToken,
    pub delayer: Delayer,
    pub join: JoinHandle<State>,
    /// Monitor the task is attached to; rate fetchers have none.
    pub monitor: Option<MonitorKey>,
}

impl TaskEntry {
    pub fn config(&self) -> Arc<TaskConfig> {
        Arc::clone(&*self.config.borrow())
    }
}

struct MonitorEntry {
    handle: MonitorHandle,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub(super) struct Registry {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    monitors: Mutex<HashMap<MonitorKey, MonitorEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    /// Inserts a task. Hands the entry back if the id is already taken.
    pub async fn insert(&self, id: String, entry: TaskEntry) -> Result<(), TaskEntry> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(entry);
        }
        tasks.insert(id, entry);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Option<TaskEntry> {
        self.tasks.write().await.remove(id)
    }

    /// Sorted ids of registered tasks.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Runs `f` on the task's entry, if registered.
    pub async fn with_task<R>(&self, id: &str, f: impl FnOnce(&TaskEntry) -> R) -> Option<R> {
        self.tasks.read().await.get(id).map(f)
    }

    /// Runs `f` on every task entry.
    pub async fn for_each(&self, mut f: impl FnMut(&str, &TaskEntry)) {
        for (id, entry) in self.tasks.read().await.iter() {
            f(id, entry);
        }
    }

    /// Attaches `task_id` to the monitor for `key`, creating it with `create` if none runs.
    ///
    /// Returns the handle and whether a new monitor was spawned.
    pub async fn attach_monitor(
        &self,
        key: &MonitorKey,
        task_id: &str,
        create: impl FnOnce() -> Monitor,
    ) -> (MonitorHandle, bool) {
        let mut monitors = self.monitors.lock().await;
        if let Some(entry) = monitors.get(key) {
            entry.handle.attach(task_id);
            return (entry.handle.clone(), false);
        }
        let monitor = create();
        let handle = monitor.handle();
        handle.attach(task_id);
        let join = tokio::spawn(monitor.run());
        monitors.insert(
            key.clone(),
            MonitorEntry {
                handle: handle.clone(),
                join,
            },
        );
        (handle, true)
    }

    /// Detaches `task_id`; stops and awaits the monitor if no task id remains.
    ///
    /// Returns `true` if the monitor was removed.
    pub async fn detach_monitor(&self, key: &MonitorKey, task_id: &str) -> bool {
        let removed = {
            let mut monitors = self.monitors.lock().await;
            let Some(entry) = monitors.get(key) else {
                return false;
            };
            if entry.handle.detach(task_id) > 0 {
                return false;
            }
            monitors.remove(key)
        };
        match removed {
            Some(entry) => {
                entry.handle.stop();
                if let Err(e) = entry.join.await {
                    tracing::warn!(monitor = %key, error = %e, "monitor join failed");
                }
                true
            }
            None => false,
        }
    }

    pub async fn monitor(&self, key: &MonitorKey) -> Option<MonitorHandle> {
        self.monitors
            .lock()
            .await
            .get(key)
            .map(|e| e.handle.clone())
    }

    pub async fn monitor_count(&self) -> usize {
        self.monitors.lock().await.len()
    }

    /// Runs `f` on every monitor handle.
    pub async fn for_each_monitor(&self, mut f: impl FnMut(&MonitorHandle)) {
        for entry in self.monitors.lock().await.values() {
            f(&entry.handle);
        }
    }

    /// Removes every monitor, stopping each; returns their joins keyed by display name.
    pub async fn drain_monitors(&self) -> Vec<(String, JoinHandle<()>)> {
        let drained: Vec<(MonitorKey, MonitorEntry)> =
            self.monitors.lock().await.drain().collect();
        drained
            .into_iter()
            .map(|(key, entry)| {
                entry.handle.stop();
                (key.to_string(), entry.join)
            })
            .collect()
    }
}
