//! # Captcha harvesting.
//!
//! A task that hits a captcha asks the [`CaptchaManager`] for a
//! [`CaptchaRequest`] and polls it from the CAPTCHA state. Whoever solves
//! captchas (a browser window, a solving service) pulls [`CaptchaTicket`]s from
//! the [`HarvestQueue`] and fulfills them.
//!
//! ```text
//!  CheckoutTask ── get_captcha(req) ──► HarvestQueue ──► next_ticket() ──► harvester
//!       │                                   (per sitekey,                     │
//!       │                                    checkpoint first)                │
//!       └──── request.status() ◄──────── watch channel ◄──── ticket.fulfill(token)
//! ```
//!
//! ## Rules
//! - A request only leaves `Pending` once; later transitions are ignored.
//! - Dropping an unfulfilled ticket marks the request `Destroyed`.
//! - One pending request per task; asking again returns the same request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, watch};

use crate::model::Platform;

/// Lifecycle of a captcha request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaStatus {
    Pending,
    Fulfilled(String),
    Cancelled,
    Destroyed,
}

type Slot = Arc<watch::Sender<CaptchaStatus>>;

fn settle(slot: &Slot, status: CaptchaStatus) -> bool {
    slot.send_if_modified(|current| {
        if *current == CaptchaStatus::Pending {
            *current = status;
            true
        } else {
            false
        }
    })
}

/// Task-side handle of a captcha request.
#[derive(Debug, Clone)]
pub struct CaptchaRequest {
    slot: Slot,
}

impl CaptchaRequest {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(CaptchaStatus::Pending);
        Self { slot: Arc::new(tx) }
    }

    pub fn status(&self) -> CaptchaStatus {
        self.slot.borrow().clone()
    }

    /// Gives up on the request. No-op once settled.
    pub fn cancel(&self) {
        settle(&self.slot, CaptchaStatus::Cancelled);
    }

    /// Waits until the request leaves `Pending`.
    pub async fn settled(&self) -> CaptchaStatus {
        let mut rx = self.slot.subscribe();
        let status = match rx.wait_for(|s| *s != CaptchaStatus::Pending).await {
            Ok(status) => status.clone(),
            Err(_) => CaptchaStatus::Destroyed,
        };
        status
    }

    fn ticket(&self, task_id: String, sitekey: String, host: String) -> CaptchaTicket {
        CaptchaTicket {
            task_id,
            sitekey,
            host,
            slot: Arc::clone(&self.slot),
        }
    }
}

/// Harvester-side handle of a captcha request.
#[derive(Debug)]
pub struct CaptchaTicket {
    pub task_id: String,
    pub sitekey: String,
    /// Store URL the captcha must be solved for.
    pub host: String,
    slot: Slot,
}

impl CaptchaTicket {
    /// Hands the solved token to the waiting task.
    pub fn fulfill(self, token: impl Into<String>) -> bool {
        settle(&self.slot, CaptchaStatus::Fulfilled(token.into()))
    }

    pub fn cancel(self) -> bool {
        settle(&self.slot, CaptchaStatus::Cancelled)
    }

    /// True once the task no longer waits for this ticket.
    pub fn is_abandoned(&self) -> bool {
        *self.slot.borrow() != CaptchaStatus::Pending
    }
}

impl Drop for CaptchaTicket {
    fn drop(&mut self) {
        settle(&self.slot, CaptchaStatus::Destroyed);
    }
}

/// What a task asks to be harvested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRequest {
    pub task_id: String,
    pub store_url: String,
    pub sitekey: Option<String>,
    pub platform: Platform,
    /// Checkpoint captchas jump ahead of checkout captchas.
    pub priority: bool,
}

/// Captcha collaborator.
#[async_trait]
pub trait CaptchaManager: Send + Sync + 'static {
    async fn attach_handler(&self, task_id: &str);

    /// Drops every pending request of the task.
    async fn detach_handler(&self, task_id: &str);

    async fn get_captcha(&self, request: HarvestRequest) -> CaptchaRequest;

    /// Stops harvesting for the task once it holds a token.
    async fn suspend_harvest(&self, task_id: &str, platform: Platform);
}

struct Waiting {
    task_id: String,
    host: String,
    priority: bool,
    request: CaptchaRequest,
}

#[derive(Default)]
struct Queues {
    attached: HashSet<String>,
    by_sitekey: HashMap<String, VecDeque<Waiting>>,
}

impl Queues {
    fn find(&self, task_id: &str) -> Option<&CaptchaRequest> {
        self.by_sitekey
            .values()
            .flat_map(|q| q.iter())
            .find(|w| w.task_id == task_id && w.request.status() == CaptchaStatus::Pending)
            .map(|w| &w.request)
    }

    fn remove_task(&mut self, task_id: &str) {
        for queue in self.by_sitekey.values_mut() {
            queue.retain(|w| {
                if w.task_id == task_id {
                    w.request.cancel();
                    false
                } else {
                    true
                }
            });
        }
        self.by_sitekey.retain(|_, q| !q.is_empty());
    }
}

/// In-memory [`CaptchaManager`] feeding an external harvester.
#[derive(Default)]
pub struct HarvestQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl HarvestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next waiting request, if any.
    pub async fn try_next_ticket(&self) -> Option<CaptchaTicket> {
        let mut queues = self.queues.lock().await;
        let mut found = None;
        for (sitekey, queue) in queues.by_sitekey.iter_mut() {
            while let Some(w) = queue.pop_front() {
                if w.request.status() == CaptchaStatus::Pending {
                    found = Some(w.request.ticket(w.task_id, sitekey.clone(), w.host));
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }
        queues.by_sitekey.retain(|_, q| !q.is_empty());
        found
    }

    /// Waits for the next waiting request.
    pub async fn next_ticket(&self) -> CaptchaTicket {
        loop {
            if let Some(ticket) = self.try_next_ticket().await {
                return ticket;
            }
            self.notify.notified().await;
        }
    }

    /// Number of waiting requests across all sitekeys.
    pub async fn pending(&self) -> usize {
        self.queues
            .lock()
            .await
            .by_sitekey
            .values()
            .map(|q| q.len())
            .sum()
    }
}

#[async_trait]
impl CaptchaManager for HarvestQueue {
    async fn attach_handler(&self, task_id: &str) {
        self.queues.lock().await.attached.insert(task_id.to_string());
    }

    async fn detach_handler(&self, task_id: &str) {
        let mut queues = self.queues.lock().await;
        queues.attached.remove(task_id);
        queues.remove_task(task_id);
    }

    async fn get_captcha(&self, req: HarvestRequest) -> CaptchaRequest {
        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.find(&req.task_id) {
            return existing.clone();
        }
        if !queues.attached.contains(&req.task_id) {
            tracing::debug!(task = %req.task_id, "captcha requested by unattached task");
        }

        let request = CaptchaRequest::new();
        let waiting = Waiting {
            task_id: req.task_id,
            host: req.store_url,
            priority: req.priority,
            request: request.clone(),
        };
        let queue = queues
            .by_sitekey
            .entry(req.sitekey.unwrap_or_default())
            .or_default();
        if waiting.priority {
            let at = queue.iter().position(|w| !w.priority).unwrap_or(queue.len());
            queue.insert(at, waiting);
        } else {
            queue.push_back(waiting);
        }
        drop(queues);

        self.notify.notify_one();
        request
    }

    async fn suspend_harvest(&self, task_id: &str, _platform: Platform) {
        self.queues.lock().await.remove_task(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(task: &str, priority: bool) -> HarvestRequest {
        HarvestRequest {
            task_id: task.into(),
            store_url: "https://shop.example.com".into(),
            sitekey: Some("key".into()),
            platform: Platform::Shopify,
            priority,
        }
    }

    #[tokio::test]
    async fn test_fulfill_reaches_task() {
        let queue = HarvestQueue::new();
        let request = queue.get_captcha(req("a", false)).await;
        assert_eq!(request.status(), CaptchaStatus::Pending);

        let ticket = queue.next_ticket().await;
        assert_eq!(ticket.task_id, "a");
        assert!(ticket.fulfill("tok"));
        assert_eq!(request.status(), CaptchaStatus::Fulfilled("tok".into()));
        assert_eq!(request.settled().await, CaptchaStatus::Fulfilled("tok".into()));
    }

    #[tokio::test]
    async fn test_checkpoint_requests_go_first() {
        let queue = HarvestQueue::new();
        let _a = queue.get_captcha(req("a", false)).await;
        let _b = queue.get_captcha(req("b", false)).await;
        let _c = queue.get_captcha(req("c", true)).await;

        let order: Vec<String> = [
            queue.try_next_ticket().await.unwrap(),
            queue.try_next_ticket().await.unwrap(),
            queue.try_next_ticket().await.unwrap(),
        ]
        .into_iter()
        .map(|t| {
            let id = t.task_id.clone();
            t.cancel();
            id
        })
        .collect();
        assert_eq!(order, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_dropped_ticket_destroys_request() {
        let queue = HarvestQueue::new();
        let request = queue.get_captcha(req("a", false)).await;
        drop(queue.next_ticket().await);
        assert_eq!(request.status(), CaptchaStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_same_task_gets_same_request() {
        let queue = HarvestQueue::new();
        let first = queue.get_captcha(req("a", false)).await;
        let second = queue.get_captcha(req("a", true)).await;
        assert_eq!(queue.pending().await, 1);
        first.cancel();
        assert_eq!(second.status(), CaptchaStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_detach_cancels_and_skips() {
        let queue = HarvestQueue::new();
        queue.attach_handler("a").await;
        let request = queue.get_captcha(req("a", false)).await;
        queue.detach_handler("a").await;
        assert_eq!(request.status(), CaptchaStatus::Cancelled);
        assert!(queue.try_next_ticket().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_request_abandons_ticket() {
        let queue = HarvestQueue::new();
        let request = queue.get_captcha(req("a", false)).await;
        let ticket = queue.next_ticket().await;
        request.cancel();
        assert!(ticket.is_abandoned());
        assert!(!ticket.fulfill("late"));
        assert_eq!(request.status(), CaptchaStatus::Cancelled);
    }
}
