//! Shipping rates found by rate fetchers, shared with checkout tasks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{ShippingRate, TaskConfig};

/// Cache keyed by (profile id, store key).
#[derive(Debug, Clone, Default)]
pub struct RateCache {
    inner: Arc<RwLock<HashMap<(String, String), ShippingRate>>>,
}

impl RateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(config: &TaskConfig) -> (String, String) {
        (config.profile.id.clone(), config.store.key())
    }

    pub async fn get(&self, config: &TaskConfig) -> Option<ShippingRate> {
        self.inner.read().await.get(&Self::key(config)).cloned()
    }

    /// Stores `rate` unless a cheaper one is already cached.
    pub async fn insert(&self, config: &TaskConfig, rate: ShippingRate) {
        let mut map = self.inner.write().await;
        let slot = map.entry(Self::key(config)).or_insert_with(|| rate.clone());
        if rate.price_value() < slot.price_value() {
            *slot = rate;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    fn rate(id: &str, price: &str) -> ShippingRate {
        ShippingRate {
            id: id.into(),
            name: id.into(),
            price: price.into(),
        }
    }

    #[tokio::test]
    async fn test_keeps_cheapest_per_profile_and_store() {
        let cache = RateCache::new();
        let task = fixtures::task("t");
        cache.insert(&task, rate("ground", "5.00")).await;
        cache.insert(&task, rate("express", "25.00")).await;
        assert_eq!(cache.get(&task).await.unwrap().id, "ground");

        let mut other = fixtures::task("u");
        other.store.url = "https://other.example.com".into();
        assert!(cache.get(&other).await.is_none());
        assert_eq!(cache.len().await, 1);
    }
}
