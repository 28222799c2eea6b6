//! # Checkout notifications.
//!
//! PROCESS_PAYMENT reports an order outcome by inserting a [`WebhookRecord`]
//! and calling [`WebhookManager::send`]. The default [`WebhookDispatcher`]
//! posts every queued record as JSON to each registered hook.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::model::Mode;

/// Store a record refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreRef {
    pub name: String,
    pub url: String,
}

/// Confirmed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRef {
    pub number: String,
    pub url: String,
}

/// One checkout outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRecord {
    pub success: bool,
    pub checkout_url: String,
    pub product: String,
    pub price: String,
    pub store: StoreRef,
    pub order: Option<OrderRef>,
    /// Profile name.
    pub profile: String,
    pub size: String,
    pub image: Option<String>,
    pub mode: Mode,
}

/// Notification collaborator.
#[async_trait]
pub trait WebhookManager: Send + Sync + 'static {
    async fn insert(&self, record: WebhookRecord);

    /// Flushes queued records.
    async fn send(&self);
}

/// Posts records to a fixed list of hook URLs.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    hooks: Vec<String>,
    queue: Mutex<Vec<WebhookRecord>>,
}

impl WebhookDispatcher {
    pub fn new<I, S>(hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            hooks: hooks.into_iter().map(Into::into).collect(),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl WebhookManager for WebhookDispatcher {
    async fn insert(&self, record: WebhookRecord) {
        self.queue.lock().await.push(record);
    }

    async fn send(&self) {
        let records = std::mem::take(&mut *self.queue.lock().await);
        if self.hooks.is_empty() {
            tracing::debug!(dropped = records.len(), "no webhooks configured");
            return;
        }
        for record in &records {
            for hook in &self.hooks {
                let result = self
                    .client
                    .post(hook)
                    .json(record)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = result {
                    tracing::warn!(hook = %hook, error = %e, "webhook delivery failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WebhookRecord {
        WebhookRecord {
            success: true,
            checkout_url: "https://shop.example.com/1/checkouts/abc".into(),
            product: "Boost 350".into(),
            price: "220.00 USD".into(),
            store: StoreRef {
                name: "Shop".into(),
                url: "https://shop.example.com".into(),
            },
            order: Some(OrderRef {
                number: "#1001".into(),
                url: "https://shop.example.com/orders/1".into(),
            }),
            profile: "Main".into(),
            size: "10".into(),
            image: None,
            mode: Mode::Frontend,
        }
    }

    #[test]
    fn test_record_serializes_flat_fields() {
        let v = serde_json::to_value(record()).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["store"]["name"], "Shop");
        assert_eq!(v["order"]["number"], "#1001");
        assert_eq!(v["mode"], "frontend");
    }

    #[tokio::test]
    async fn test_send_without_hooks_drains_queue() {
        let d = WebhookDispatcher::new(Vec::<String>::new());
        d.insert(record()).await;
        assert_eq!(d.queued().await, 1);
        d.send().await;
        assert_eq!(d.queued().await, 0);
    }
}
