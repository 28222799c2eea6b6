//! # Task configuration data.
//!
//! Everything a checkout attempt needs to know about *what* to buy and *who*
//! buys it. All types are serde-friendly so a task list can be loaded from
//! JSON or TOML.
//!
//! ```text
//! TaskConfig
//!   ├─ store      (url, name, storefront api key)
//!   ├─ profile    (shipping, billing, payment)
//!   ├─ product    (ProductMatcher: keywords / url / variant / special)
//!   ├─ mode       (Frontend | Api)
//!   ├─ account    (optional login)
//!   └─ delays     (monitor, error)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::monitor::{NormalizedMatcher, ProductMatcher};

/// Storefront platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Shopify,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Shopify => "shopify",
        }
    }
}

/// Checkout strategy.
///
/// Both modes share the same state names and collaborators; they differ in
/// which endpoints they talk to and in what order the funnel is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Multi-page HTML checkout with hidden-field scraping.
    #[default]
    #[serde(alias = "safe")]
    Frontend,
    /// JSON wallets endpoint; checkout is prepared before the product is live.
    #[serde(alias = "fast")]
    Api,
}

/// What a started task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Full checkout, backed by a shared monitor.
    #[default]
    Normal,
    /// Rate fetcher: add to cart and cache the cheapest shipping rate.
    Rates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub url: String,
    /// Storefront access token; filled in by GATHER_DATA when absent.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Store {
    /// Store URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Lowercased base URL, used in dedup keys.
    pub fn key(&self) -> String {
        self.base().to_ascii_lowercase()
    }
}

/// Country or province with its code and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    #[serde(default)]
    pub apt: String,
    pub city: String,
    pub country: Region,
    #[serde(default)]
    pub province: Option<Region>,
    pub zip: String,
    pub phone: String,
}

impl Address {
    pub fn province_code(&self) -> &str {
        self.province.as_ref().map(|p| p.value.as_str()).unwrap_or("")
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub email: String,
    pub card_holder: String,
    pub card_number: String,
    /// `MM/YY` or `MM/YYYY`.
    pub exp: String,
    pub cvv: String,
}

impl Payment {
    /// Splits the expiry into `(month, four digit year)`.
    pub fn expiry(&self) -> Option<(u32, u32)> {
        let (month, year) = self.exp.split_once('/')?;
        let month: u32 = month.trim().parse().ok()?;
        let year: u32 = year.trim().parse().ok()?;
        let year = if year < 100 { 2000 + year } else { year };
        Some((month, year))
    }
}

impl std::fmt::Debug for Payment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payment")
            .field("email", &self.email)
            .field("card_holder", &self.card_holder)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub shipping: Address,
    /// `None` means billing matches shipping.
    #[serde(default)]
    pub billing: Option<Address>,
    pub payment: Payment,
}

impl Profile {
    pub fn billing(&self) -> &Address {
        self.billing.as_ref().unwrap_or(&self.shipping)
    }

    pub fn billing_matches(&self) -> bool {
        self.billing.is_none()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Shipping rate as offered by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRate {
    pub id: String,
    pub name: String,
    pub price: String,
}

impl ShippingRate {
    pub(crate) fn price_value(&self) -> f64 {
        self.price.parse().unwrap_or(f64::MAX)
    }
}

/// Per-task delays, mutable at runtime through `Manager::change_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delays {
    /// Monitor poll interval; also used for password and stock waits.
    #[serde(with = "millis", default = "default_monitor_delay")]
    pub monitor: Duration,
    /// Wait after a retryable failure.
    #[serde(with = "millis", default = "default_error_delay")]
    pub error: Duration,
}

fn default_monitor_delay() -> Duration {
    Duration::from_millis(3500)
}

fn default_error_delay() -> Duration {
    Duration::from_millis(3500)
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            monitor: default_monitor_delay(),
            error: default_error_delay(),
        }
    }
}

/// Which delay `Manager::change_delay` updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayKind {
    Monitor,
    Error,
}

fn default_size() -> String {
    "random".to_string()
}

/// Full configuration of one checkout attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    #[serde(default)]
    pub platform: Platform,
    pub store: Store,
    pub profile: Profile,
    pub product: ProductMatcher,
    /// Size to pick; `random` picks any variant.
    #[serde(default = "default_size")]
    pub size: String,
    /// Fall back to a random in-stock variant when the size is unavailable.
    #[serde(default)]
    pub random_in_stock: bool,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub account: Option<Account>,
    /// Always solve a captcha before submitting customer information.
    #[serde(default)]
    pub captcha: bool,
    #[serde(default)]
    pub delays: Delays,
}

impl TaskConfig {
    /// Decodes a single task from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Decodes a task list from JSON.
    pub fn list_from_json_str(s: &str) -> Result<Vec<Self>, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Identity used to stop duplicate purchases once one task succeeds.
    pub fn purchase_key(&self) -> PurchaseKey {
        PurchaseKey {
            profile: self.profile.id.clone(),
            store: self.store.key(),
            product: self.product.normalized(),
        }
    }
}

/// (profile id, store, matched product).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurchaseKey {
    pub profile: String,
    pub store: String,
    pub product: NormalizedMatcher,
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn address() -> Address {
        Address {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            address: "1 Main St".into(),
            apt: String::new(),
            city: "Springfield".into(),
            country: Region {
                value: "US".into(),
                label: "United States".into(),
            },
            province: Some(Region {
                value: "IL".into(),
                label: "Illinois".into(),
            }),
            zip: "62701".into(),
            phone: "5555555555".into(),
        }
    }

    pub fn task(id: &str) -> TaskConfig {
        TaskConfig {
            id: id.into(),
            platform: Platform::Shopify,
            store: Store {
                name: "Test Store".into(),
                url: "https://shop.example.com".into(),
                api_key: None,
            },
            profile: Profile {
                id: "profile-1".into(),
                name: "Main".into(),
                shipping: address(),
                billing: None,
                payment: Payment {
                    email: "ada@example.com".into(),
                    card_holder: "Ada Lovelace".into(),
                    card_number: "4242424242424242".into(),
                    exp: "12/30".into(),
                    cvv: "123".into(),
                },
            },
            product: ProductMatcher::Keywords {
                positive: vec!["boost".into(), "350".into()],
                negative: vec!["kids".into()],
            },
            size: "10".into(),
            random_in_stock: false,
            mode: Mode::Frontend,
            account: None,
            captcha: false,
            delays: Delays::default(),
        }
    }
}
