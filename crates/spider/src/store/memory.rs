//! In-memory [`DataStore`] used by tests.
//!
//! Mirrors the MySQL implementation's observable behavior (upsert
//! semantics, comment handling, counter arithmetic) over plain maps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::payload::{self, SqlValue};

use super::{
    AccountRow, COMMENT_SUCCESS, DataStore, ProbeUrl, Proxy, Result, StoreError, SubscriptionUrl,
};

#[derive(Debug, Clone, Default)]
pub struct StoredAccount {
    pub tiktok_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub columns: Vec<(&'static str, SqlValue)>,
}

#[derive(Default)]
struct Inner {
    /// (account handle, status) pairs from the relationship table.
    relationships: Vec<(String, bool)>,
    accounts: HashMap<String, StoredAccount>,
    /// Details rows keyed on platform id; the handle is a column.
    user_details: HashMap<String, StoredAccount>,
    videos: HashMap<String, Vec<(&'static str, SqlValue)>>,
    proxies: BTreeMap<i64, Proxy>,
    probe_urls: Vec<ProbeUrl>,
    /// url id → (success_count, fail_count)
    probe_counters: HashMap<i64, (i64, i64)>,
    subscription_urls: Vec<SubscriptionUrl>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -- seeding helpers --

    pub fn add_relationship(&self, account_name: &str, status: bool) {
        self.lock()
            .relationships
            .push((account_name.to_string(), status));
    }

    pub fn seed_account(
        &self,
        account_name: &str,
        tiktok_id: Option<&str>,
        updated_at: Option<DateTime<Utc>>,
        comments: Option<&str>,
    ) {
        self.lock().accounts.insert(
            account_name.to_string(),
            StoredAccount {
                tiktok_id: tiktok_id.map(String::from),
                updated_at,
                comments: comments.map(String::from),
                columns: Vec::new(),
            },
        );
    }

    pub fn add_proxy(&self, proxy: Proxy) {
        self.lock().proxies.insert(proxy.id, proxy);
    }

    pub fn add_probe_url(&self, id: i64, url: &str) {
        self.lock().probe_urls.push(ProbeUrl {
            id,
            url: url.to_string(),
        });
    }

    pub fn add_subscription_url(&self, id: i64, url: &str) {
        self.lock().subscription_urls.push(SubscriptionUrl {
            id,
            url: url.to_string(),
        });
    }

    // -- inspection helpers --

    pub fn account(&self, account_name: &str) -> Option<StoredAccount> {
        self.lock().accounts.get(account_name).cloned()
    }

    pub fn user_details(&self, tiktok_id: &str) -> Option<StoredAccount> {
        self.lock().user_details.get(tiktok_id).cloned()
    }

    pub fn proxy(&self, id: i64) -> Option<Proxy> {
        self.lock().proxies.get(&id).cloned()
    }

    pub fn video_count(&self) -> usize {
        self.lock().videos.len()
    }

    pub fn has_video(&self, video_id: &str) -> bool {
        self.lock().videos.contains_key(video_id)
    }

    pub fn probe_counters(&self, url_id: i64) -> (i64, i64) {
        self.lock()
            .probe_counters
            .get(&url_id)
            .copied()
            .unwrap_or((0, 0))
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn fetch_active_accounts(&self) -> Result<Vec<AccountRow>> {
        let inner = self.lock();
        Ok(inner
            .relationships
            .iter()
            .filter(|(_, status)| *status)
            .map(|(name, _)| {
                let account = inner.accounts.get(name);
                AccountRow {
                    account_name: name.clone(),
                    tiktok_id: account.and_then(|a| a.tiktok_id.clone()),
                    updated_at: account.and_then(|a| a.updated_at),
                    comments: account.and_then(|a| a.comments.clone()),
                }
            })
            .collect())
    }

    async fn upsert_account(&self, account_name: &str, data: &serde_json::Value) -> Result<()> {
        let record = payload::account_record(data).ok_or_else(|| {
            StoreError::Malformed(format!("user payload for {account_name} has no platform id"))
        })?;

        let stored = StoredAccount {
            tiktok_id: Some(record.tiktok_id.clone()),
            updated_at: Some(Utc::now()),
            comments: Some(COMMENT_SUCCESS.to_string()),
            columns: record.columns.clone(),
        };

        let mut inner = self.lock();
        inner
            .accounts
            .insert(account_name.to_string(), stored.clone());
        inner.user_details.insert(record.tiktok_id, stored);
        Ok(())
    }

    async fn upsert_videos(&self, payloads: &[serde_json::Value]) -> Result<()> {
        let mut inner = self.lock();
        for entry in payloads {
            let Some(record) = payload::video_record(entry) else {
                continue;
            };
            inner.videos.insert(record.video_id, record.columns);
        }
        Ok(())
    }

    async fn set_account_comment(&self, account_name: &str, comment: &str) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.accounts.entry(account_name.to_string()).or_default();
        entry.comments = Some(comment.to_string());
        entry.updated_at = Some(Utc::now());

        let tiktok_id = entry.tiktok_id.clone();
        if let Some(id) = tiktok_id
            && let Some(details) = inner.user_details.get_mut(&id)
        {
            details.comments = Some(comment.to_string());
            details.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        Ok(self.lock().proxies.values().cloned().collect())
    }

    async fn set_proxy_in_use(&self, id: i64, in_use: bool) -> Result<()> {
        if let Some(proxy) = self.lock().proxies.get_mut(&id) {
            proxy.is_using = in_use;
        }
        Ok(())
    }

    async fn record_proxy_success(&self, id: i64) -> Result<()> {
        if let Some(proxy) = self.lock().proxies.get_mut(&id) {
            proxy.success_count += 1;
        }
        Ok(())
    }

    async fn record_proxy_failure(&self, id: i64) -> Result<()> {
        if let Some(proxy) = self.lock().proxies.get_mut(&id) {
            proxy.fail_count += 1;
        }
        Ok(())
    }

    async fn update_proxy_latency(&self, id: i64, delay_ms: f64) -> Result<()> {
        if let Some(proxy) = self.lock().proxies.get_mut(&id) {
            let count = proxy.delay_count as f64;
            proxy.avg_delay = (proxy.avg_delay * count + delay_ms) / (count + 1.0);
            proxy.delay_count += 1;
        }
        Ok(())
    }

    async fn clear_proxy_usage_flags(&self) -> Result<()> {
        for proxy in self.lock().proxies.values_mut() {
            proxy.is_using = false;
        }
        Ok(())
    }

    async fn list_probe_urls(&self) -> Result<Vec<ProbeUrl>> {
        Ok(self.lock().probe_urls.clone())
    }

    async fn record_probe_result(&self, url_id: i64, ok: bool) -> Result<()> {
        let mut inner = self.lock();
        let counters = inner.probe_counters.entry(url_id).or_default();
        if ok {
            counters.0 += 1;
        } else {
            counters.1 += 1;
        }
        Ok(())
    }

    async fn list_subscription_urls(&self) -> Result<Vec<SubscriptionUrl>> {
        Ok(self.lock().subscription_urls.clone())
    }
}

/// A proxy with sensible defaults for tests.
pub fn test_proxy(id: i64, port: u16) -> Proxy {
    Proxy {
        id,
        current_port: port,
        avg_delay: 100.0,
        delay_count: 1,
        success_count: 0,
        fail_count: 0,
        is_using: false,
    }
}
