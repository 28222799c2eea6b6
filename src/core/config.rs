//! # Manager configuration.
//!
//! [`ManagerConfig`] holds the settings shared by every task and monitor a
//! [`Manager`](crate::Manager) runs. Per-task settings (store, profile,
//! delays) live in [`TaskConfig`](crate::model::TaskConfig).
//!
//! Every field has a default, so a TOML document only needs the values it
//! changes. Durations are written in milliseconds:
//!
//! ```toml
//! bus_capacity = 2048
//! grace = 5000
//! queue_poll = 2500
//!
//! [swap_backoff]
//! first = 500
//! max = 10000
//! factor = 2.0
//! jitter = "equal"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::millis;
use crate::policies::{BackoffPolicy, JitterPolicy};
use crate::task::TaskSettings;

/// Runtime-wide settings for a manager.
///
/// ## Field semantics
/// - `bus_capacity`: status bus ring buffer size (min 1; clamped by the bus)
/// - `grace`: how long [`Manager::shutdown`](crate::Manager::shutdown) waits for tasks and monitors
/// - `request_timeout`: per-request timeout of the default connector
/// - `queue_poll` / `captcha_poll` / `product_poll` / `stock_poll`: engine poll intervals
/// - `swap_backoff`: wait after consecutive proxy swaps
/// - `monitor_jitter`: spread applied to every monitor poll
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub bus_capacity: usize,
    #[serde(with = "millis")]
    pub grace: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "millis")]
    pub queue_poll: Duration,
    #[serde(with = "millis")]
    pub captcha_poll: Duration,
    #[serde(with = "millis")]
    pub product_poll: Duration,
    #[serde(with = "millis")]
    pub stock_poll: Duration,
    /// Card vault endpoint used to tokenize payment details.
    pub vault_url: String,
    pub swap_backoff: BackoffPolicy,
    pub monitor_jitter: JitterPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let settings = TaskSettings::default();
        Self {
            bus_capacity: 1024,
            grace: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            queue_poll: settings.queue_poll,
            captcha_poll: settings.captcha_poll,
            product_poll: settings.product_poll,
            stock_poll: settings.stock_poll,
            vault_url: settings.vault_url,
            swap_backoff: settings.swap_backoff,
            monitor_jitter: JitterPolicy::Equal,
        }
    }
}

impl ManagerConfig {
    /// Decodes a configuration from TOML; missing fields keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Engine settings handed to every checkout task and rate fetcher.
    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            queue_poll: self.queue_poll,
            captcha_poll: self.captcha_poll,
            product_poll: self.product_poll,
            stock_poll: self.stock_poll,
            vault_url: self.vault_url.clone(),
            swap_backoff: self.swap_backoff,
        }
    }
}
