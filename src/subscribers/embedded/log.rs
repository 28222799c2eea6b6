//! # LogWriter: status event logger
//!
//! A minimal subscriber that writes incoming [`Event`]s through `tracing`.
//!
//! ## Example output
//! ```text
//! INFO status tasks=["t1"] state=ADD_TO_CART text="Adding to cart"
//! INFO status tasks=["t1"] state=DONE success=true text="Check email"
//! DEBUG monitor tasks=["t1", "t2"] text="Product found!"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let message = e.message.as_deref().unwrap_or("");
        match e.kind {
            EventKind::TaskStatus => {
                tracing::info!(
                    tasks = ?e.task_ids,
                    state = e.state.map(|s| s.as_str()).unwrap_or("-"),
                    proxy = e.proxy.as_deref(),
                    success = e.success,
                    text = message,
                    "status"
                );
            }
            EventKind::MonitorStatus => {
                tracing::debug!(
                    tasks = ?e.task_ids,
                    product = e.product.as_deref(),
                    text = message,
                    "monitor"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::State;

    #[tokio::test]
    async fn test_writes_both_event_kinds() {
        let writer = LogWriter::new();
        writer
            .on_event(
                &Event::new(EventKind::TaskStatus)
                    .with_task("t1")
                    .with_state(State::Done)
                    .with_success(true)
                    .with_message("Check email!"),
            )
            .await;
        writer
            .on_event(
                &Event::new(EventKind::MonitorStatus)
                    .with_tasks(["t1", "t2"])
                    .with_product("Yeezy Boost 350"),
            )
            .await;
        assert_eq!(writer.name(), "LogWriter");
    }
}
