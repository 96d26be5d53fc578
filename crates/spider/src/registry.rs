//! Concurrent selection and accounting of upstream proxies.
//!
//! `acquire` is serialized process-wide: the select-and-mark sequence
//! runs under one mutex, so no two sessions can ever observe the same
//! row as available. Counter updates are per-row atomic in the store
//! and need no serialization here.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::store::{DataStore, Proxy, Result};

pub struct ProxyRegistry {
    store: Arc<dyn DataStore>,
    select_lock: tokio::sync::Mutex<()>,
    strict_delay_filter: bool,
}

impl ProxyRegistry {
    pub fn new(store: Arc<dyn DataStore>, strict_delay_filter: bool) -> Self {
        Self {
            store,
            select_lock: tokio::sync::Mutex::new(()),
            strict_delay_filter,
        }
    }

    /// Select the best free proxy and mark it in use.
    ///
    /// Candidates are free rows — under the strict filter, only rows
    /// the prober has measured (`avg_delay > 0`) — ordered by
    /// `(fail_count asc, avg_delay asc)`. Returns `None` when nothing
    /// qualifies.
    pub async fn acquire(&self) -> Result<Option<Proxy>> {
        let _guard = self.select_lock.lock().await;

        let proxies = self.store.list_proxies().await?;
        let mut candidates: Vec<&Proxy> = proxies
            .iter()
            .filter(|p| !p.is_using && (!self.strict_delay_filter || p.avg_delay > 0.0))
            .collect();
        candidates.sort_by(|a, b| {
            a.fail_count.cmp(&b.fail_count).then(
                a.avg_delay
                    .partial_cmp(&b.avg_delay)
                    .unwrap_or(Ordering::Equal),
            )
        });

        let Some(best) = candidates.first() else {
            return Ok(None);
        };

        self.store.set_proxy_in_use(best.id, true).await?;
        debug!(id = best.id, port = best.current_port, "acquired proxy");

        let mut chosen = (*best).clone();
        chosen.is_using = true;
        Ok(Some(chosen))
    }

    pub async fn release(&self, id: i64, in_use: bool) -> Result<()> {
        debug!(id, in_use, "releasing proxy");
        self.store.set_proxy_in_use(id, in_use).await
    }

    pub async fn record_success(&self, id: i64) -> Result<()> {
        self.store.record_proxy_success(id).await
    }

    /// Charge `count` failures against one proxy.
    pub async fn record_failure(&self, id: i64, count: u32) -> Result<()> {
        for _ in 0..count {
            self.store.record_proxy_failure(id).await?;
        }
        Ok(())
    }

    pub async fn record_latency(&self, id: i64, delay_ms: f64) -> Result<()> {
        self.store.update_proxy_latency(id, delay_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, test_proxy};

    fn registry_with(proxies: Vec<Proxy>, strict: bool) -> (Arc<MemoryStore>, ProxyRegistry) {
        let store = Arc::new(MemoryStore::new());
        for proxy in proxies {
            store.add_proxy(proxy);
        }
        let registry = ProxyRegistry::new(Arc::clone(&store) as Arc<dyn DataStore>, strict);
        (store, registry)
    }

    #[tokio::test]
    async fn acquire_marks_in_use() {
        let (store, registry) = registry_with(vec![test_proxy(1, 1080)], true);
        let proxy = registry.acquire().await.unwrap().unwrap();
        assert_eq!(proxy.id, 1);
        assert!(proxy.is_using);
        assert!(store.proxy(1).unwrap().is_using);
    }

    #[tokio::test]
    async fn acquire_returns_none_when_exhausted() {
        let (_store, registry) = registry_with(vec![test_proxy(1, 1080)], true);
        assert!(registry.acquire().await.unwrap().is_some());
        assert!(registry.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acquire_orders_by_fail_count_then_delay() {
        let mut slow_clean = test_proxy(1, 1081);
        slow_clean.avg_delay = 900.0;
        let mut fast_clean = test_proxy(2, 1082);
        fast_clean.avg_delay = 50.0;
        let mut fast_failing = test_proxy(3, 1083);
        fast_failing.avg_delay = 10.0;
        fast_failing.fail_count = 4;

        let (_store, registry) = registry_with(vec![slow_clean, fast_clean, fast_failing], true);
        let first = registry.acquire().await.unwrap().unwrap();
        assert_eq!(first.id, 2);
        let second = registry.acquire().await.unwrap().unwrap();
        assert_eq!(second.id, 1);
        let third = registry.acquire().await.unwrap().unwrap();
        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn strict_filter_excludes_unprobed() {
        let mut unprobed = test_proxy(1, 1081);
        unprobed.avg_delay = 0.0;
        let (_store, registry) = registry_with(vec![unprobed], true);
        assert!(registry.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relaxed_filter_allows_unprobed() {
        let mut unprobed = test_proxy(1, 1081);
        unprobed.avg_delay = 0.0;
        let (_store, registry) = registry_with(vec![unprobed], false);
        assert_eq!(registry.acquire().await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn release_returns_proxy_to_rotation() {
        let (_store, registry) = registry_with(vec![test_proxy(1, 1080)], true);
        let proxy = registry.acquire().await.unwrap().unwrap();
        registry.release(proxy.id, false).await.unwrap();
        assert_eq!(registry.acquire().await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_proxy() {
        let (_store, registry) = registry_with(
            vec![test_proxy(1, 1081), test_proxy(2, 1082), test_proxy(3, 1083)],
            true,
        );
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(
                async move { registry.acquire().await.unwrap() },
            ));
        }

        let mut ids = Vec::new();
        for handle in handles {
            if let Some(proxy) = handle.await.unwrap() {
                ids.push(proxy.id);
            }
        }
        let unique: std::collections::HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 3, "only three proxies exist");
        assert_eq!(unique.len(), ids.len(), "a proxy was handed out twice");
    }

    #[tokio::test]
    async fn failure_accounting_supports_double_penalty() {
        let (store, registry) = registry_with(vec![test_proxy(1, 1080)], true);
        registry.record_failure(1, 2).await.unwrap();
        registry.record_success(1).await.unwrap();
        let proxy = store.proxy(1).unwrap();
        assert_eq!(proxy.fail_count, 2);
        assert_eq!(proxy.success_count, 1);
        assert_eq!(proxy.success_count + proxy.fail_count, 3);
    }

    #[tokio::test]
    async fn latency_recording_feeds_rolling_average() {
        let mut proxy = test_proxy(1, 1080);
        proxy.avg_delay = 0.0;
        proxy.delay_count = 0;
        let (store, registry) = registry_with(vec![proxy], false);
        registry.record_latency(1, 80.0).await.unwrap();
        registry.record_latency(1, 120.0).await.unwrap();
        let proxy = store.proxy(1).unwrap();
        assert!((proxy.avg_delay - 100.0).abs() < f64::EPSILON);
        assert_eq!(proxy.delay_count, 2);
    }
}
