//! Narrow asynchronous facade over the account/video/proxy tables.
//!
//! The rest of the system only sees [`DataStore`]; the production
//! implementation is [`MySqlStore`], and [`MemoryStore`] backs tests.

mod memory;
mod mysql;

pub use memory::{MemoryStore, StoredAccount, test_proxy};
pub use mysql::MySqlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Comment written after a successful scrape.
pub const COMMENT_SUCCESS: &str = "获取成功";
/// Comment marking a transient fetch failure.
pub const COMMENT_FETCH_FAILED: &str = "获取失败";
/// Comment marking an account the platform does not know.
pub const COMMENT_MISSING: &str = "账号不存在";

/// One row of the active-relationship ⟕ account join.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub account_name: String,
    pub tiktok_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

/// One upstream proxy as accounted in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    pub id: i64,
    /// Loopback port the external forwarder exposes for this upstream.
    pub current_port: u16,
    /// Rolling average round-trip time in ms; 0 means never probed.
    pub avg_delay: f64,
    pub delay_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub is_using: bool,
}

/// One URL the latency prober measures against.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeUrl {
    pub id: i64,
    pub url: String,
}

/// One subscription feed; the external tunnel configurator turns
/// these into proxy rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUrl {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload carries no usable primary key; nothing was written.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Left-join of active relationships with the account table.
    async fn fetch_active_accounts(&self) -> Result<Vec<AccountRow>>;

    /// Upsert the account row (keyed on handle) and the user-details
    /// row (keyed on platform id) from one `get_user_info` payload, in
    /// a single transaction. Sets the success comment and touches
    /// `updated_at`.
    async fn upsert_account(&self, account_name: &str, payload: &serde_json::Value) -> Result<()>;

    /// Upsert video rows keyed on platform video id. Entries without
    /// an id are skipped.
    async fn upsert_videos(&self, payloads: &[serde_json::Value]) -> Result<()>;

    /// Set the account's status comment (creating the row if absent)
    /// and mirror it onto the user-details row when one exists.
    async fn set_account_comment(&self, account_name: &str, comment: &str) -> Result<()>;

    async fn list_proxies(&self) -> Result<Vec<Proxy>>;
    async fn set_proxy_in_use(&self, id: i64, in_use: bool) -> Result<()>;
    async fn record_proxy_success(&self, id: i64) -> Result<()>;
    async fn record_proxy_failure(&self, id: i64) -> Result<()>;

    /// Store the latest measurement and fold it into the rolling
    /// average: `avg = (avg * count + ms) / (count + 1)`.
    async fn update_proxy_latency(&self, id: i64, delay_ms: f64) -> Result<()>;

    /// Startup recovery: no session holds a proxy across restarts.
    async fn clear_proxy_usage_flags(&self) -> Result<()>;

    async fn list_probe_urls(&self) -> Result<Vec<ProbeUrl>>;
    async fn record_probe_result(&self, url_id: i64, ok: bool) -> Result<()>;

    /// Subscription feeds for the external tunnel configurator.
    async fn list_subscription_urls(&self) -> Result<Vec<SubscriptionUrl>>;
}
