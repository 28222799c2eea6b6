//! Product matchers and the monitor dedup key.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Platform, TaskConfig};

/// How a task names the product it wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProductMatcher {
    /// Title must contain every positive keyword and none of the negative ones.
    Keywords {
        positive: Vec<String>,
        #[serde(default)]
        negative: Vec<String>,
    },
    /// Direct product page.
    Url { url: String },
    /// Known variant id; no lookup needed.
    Variant { id: String },
    /// Store-specific logic, resolved by a custom parser.
    Special {
        name: String,
        #[serde(default)]
        value: String,
    },
}

impl ProductMatcher {
    pub fn kind(&self) -> &'static str {
        match self {
            ProductMatcher::Keywords { .. } => "keywords",
            ProductMatcher::Url { .. } => "url",
            ProductMatcher::Variant { .. } => "variant",
            ProductMatcher::Special { .. } => "special",
        }
    }

    /// Canonical form: keywords are lowercased sets, URLs lose case, query and trailing slash.
    pub fn normalized(&self) -> NormalizedMatcher {
        fn set(words: &[String]) -> BTreeSet<String> {
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect()
        }

        match self {
            ProductMatcher::Keywords { positive, negative } => NormalizedMatcher::Keywords {
                positive: set(positive),
                negative: set(negative),
            },
            ProductMatcher::Url { url } => {
                let url = url.split(['?', '#']).next().unwrap_or_default();
                NormalizedMatcher::Url(url.trim().trim_end_matches('/').to_lowercase())
            }
            ProductMatcher::Variant { id } => NormalizedMatcher::Variant(id.trim().to_string()),
            ProductMatcher::Special { name, value } => NormalizedMatcher::Special {
                name: name.trim().to_lowercase(),
                value: value.trim().to_lowercase(),
            },
        }
    }

    /// True if `title` satisfies a keyword matcher. Other matchers never match titles.
    pub fn matches_title(&self, title: &str) -> bool {
        let ProductMatcher::Keywords { positive, negative } = self else {
            return false;
        };
        let title = title.to_lowercase();
        positive.iter().all(|k| title.contains(&k.trim().to_lowercase()))
            && !negative
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && title.contains(&k))
    }
}

/// Matcher in canonical form, comparable and hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NormalizedMatcher {
    Keywords {
        positive: BTreeSet<String>,
        negative: BTreeSet<String>,
    },
    Url(String),
    Variant(String),
    Special {
        name: String,
        value: String,
    },
}

/// Identity of a monitor: tasks with equal keys share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey {
    pub platform: Platform,
    /// Lowercased store base URL.
    pub store: String,
    pub matcher: NormalizedMatcher,
}

impl MonitorKey {
    pub fn of(config: &TaskConfig) -> Self {
        Self {
            platform: config.platform,
            store: config.store.key(),
            matcher: config.product.normalized(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.matcher {
            NormalizedMatcher::Keywords { positive, negative } => {
                let mut parts: Vec<String> = positive.iter().map(|k| format!("+{k}")).collect();
                parts.extend(negative.iter().map(|k| format!("-{k}")));
                parts.join(",")
            }
            NormalizedMatcher::Url(url) => url.clone(),
            NormalizedMatcher::Variant(id) => format!("variant:{id}"),
            NormalizedMatcher::Special { name, value } => format!("{name}:{value}"),
        };
        write!(f, "{}|{}|{}", self.platform.as_str(), self.store, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn test_matcher_json_shape() {
        let m: ProductMatcher =
            serde_json::from_str(r#"{"type":"keywords","positive":["boost"]}"#).unwrap();
        assert_eq!(
            m,
            ProductMatcher::Keywords {
                positive: vec!["boost".into()],
                negative: vec![],
            }
        );
        let m: ProductMatcher = serde_json::from_str(r#"{"type":"variant","id":"123"}"#).unwrap();
        assert_eq!(m.kind(), "variant");
    }

    #[test]
    fn test_url_normalization() {
        let a = ProductMatcher::Url {
            url: "https://Shop.example.com/products/tee/?variant=1".into(),
        };
        let b = ProductMatcher::Url {
            url: "https://shop.example.com/products/tee".into(),
        };
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_title_matching() {
        let m = fixtures::task("t").product;
        assert!(m.matches_title("Yeezy BOOST 350 V2"));
        assert!(!m.matches_title("Yeezy Boost 350 V2 Kids"));
        assert!(!m.matches_title("Yeezy Boost 700"));
    }

    #[test]
    fn test_monitor_key_ignores_store_case() {
        let a = fixtures::task("a");
        let mut b = fixtures::task("b");
        b.store.url = "https://SHOP.example.com/".into();
        assert_eq!(MonitorKey::of(&a), MonitorKey::of(&b));

        b.platform = Platform::Shopify;
        b.product = ProductMatcher::Variant { id: "1".into() };
        assert_ne!(MonitorKey::of(&a), MonitorKey::of(&b));
        assert_eq!(
            MonitorKey::of(&b).to_string(),
            "shopify|https://shop.example.com|variant:1"
        );
    }
}
