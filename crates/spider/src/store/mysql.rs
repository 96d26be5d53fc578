//! MySQL-backed [`DataStore`] implementation.
//!
//! Upserts are built dynamically from the payload column mapping
//! (`INSERT … ON DUPLICATE KEY UPDATE`), so the SQL only ever names
//! columns the mapping produced. Account + user-details writes share
//! one transaction; dropping the transaction on error rolls back.

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions};
use sqlx::query::Query;
use sqlx::{FromRow, MySql};
use tracing::warn;

use crate::payload::{self, SqlValue};

use super::{
    AccountRow, COMMENT_SUCCESS, DataStore, ProbeUrl, Proxy, Result, StoreError, SubscriptionUrl,
};

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Connect with a small pool; sessions are acquired per operation.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ActiveAccountRow {
    account_name: String,
    tiktok_id: Option<String>,
    updated_at: Option<chrono::NaiveDateTime>,
    comments: Option<String>,
}

// The proxy table's accounting columns are nullable with defaults;
// rows inserted by the external tunnel configurator may carry NULLs.
#[derive(FromRow)]
struct ProxyRow {
    id: i64,
    current_port: i32,
    avg_delay: Option<f64>,
    delay_count: Option<i64>,
    success_count: Option<i64>,
    fail_count: Option<i64>,
    is_using: Option<bool>,
}

/// Render `INSERT … ON DUPLICATE KEY UPDATE` for one keyed row.
///
/// The key column binds first, then every mapped column in order;
/// `updated_at` is set to `NOW()` on both paths.
fn upsert_sql(table: &str, key_column: &str, columns: &[(&'static str, SqlValue)]) -> String {
    let mut insert_cols = vec![format!("`{key_column}`")];
    insert_cols.extend(columns.iter().map(|(name, _)| format!("`{name}`")));
    insert_cols.push("`updated_at`".to_string());

    let mut placeholders = vec!["?"; columns.len() + 1];
    placeholders.push("NOW()");

    let updates: Vec<String> = columns
        .iter()
        .map(|(name, _)| format!("`{name}` = VALUES(`{name}`)"))
        .chain(std::iter::once("`updated_at` = NOW()".to_string()))
        .collect();

    format!(
        "INSERT INTO `{table}` ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        insert_cols.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Null => query.bind(Option::<String>::None),
    }
}

#[async_trait]
impl DataStore for MySqlStore {
    async fn fetch_active_accounts(&self) -> Result<Vec<AccountRow>> {
        let rows: Vec<ActiveAccountRow> = sqlx::query_as(
            "SELECT r.tiktok_account AS account_name, \
                    a.tiktok_id, a.updated_at, a.comments \
             FROM tiktok_relationship r \
             LEFT JOIN tiktok_account a ON a.tiktok_account = r.tiktok_account \
             WHERE r.status = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AccountRow {
                account_name: row.account_name,
                tiktok_id: row.tiktok_id,
                updated_at: row.updated_at.map(|t| t.and_utc()),
                comments: row.comments,
            })
            .collect())
    }

    async fn upsert_account(&self, account_name: &str, data: &serde_json::Value) -> Result<()> {
        let record = payload::account_record(data).ok_or_else(|| {
            StoreError::Malformed(format!("user payload for {account_name} has no platform id"))
        })?;

        let mut columns = record.columns;
        columns.push(("comments", SqlValue::Text(COMMENT_SUCCESS.to_string())));

        let mut tx = self.pool.begin().await?;

        let account_sql = upsert_sql("tiktok_account", "tiktok_account", &columns);
        let mut query = sqlx::query(&account_sql).bind(account_name);
        for (_, value) in &columns {
            query = bind_value(query, value);
        }
        query.execute(&mut *tx).await?;

        // The details row keys on the platform id; the handle becomes a
        // plain column there.
        let mut detail_columns = vec![("tiktok_account", SqlValue::Text(account_name.to_string()))];
        detail_columns.extend(columns.iter().filter(|(name, _)| *name != "tiktok_id").cloned());

        let details_sql = upsert_sql("tiktok_user_details", "tiktok_id", &detail_columns);
        let mut query = sqlx::query(&details_sql).bind(record.tiktok_id.as_str());
        for (_, value) in &detail_columns {
            query = bind_value(query, value);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_videos(&self, payloads: &[serde_json::Value]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entry in payloads {
            let Some(record) = payload::video_record(entry) else {
                warn!("video payload without id, skipping");
                continue;
            };
            let sql = upsert_sql("tiktok_video_details", "tiktok_video_id", &record.columns);
            let mut query = sqlx::query(&sql).bind(record.video_id.as_str());
            for (_, value) in &record.columns {
                query = bind_value(query, value);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_account_comment(&self, account_name: &str, comment: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tiktok_account (tiktok_account, comments, updated_at) \
             VALUES (?, ?, NOW()) \
             ON DUPLICATE KEY UPDATE comments = VALUES(comments), updated_at = NOW()",
        )
        .bind(account_name)
        .bind(comment)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tiktok_user_details SET comments = ?, updated_at = NOW() \
             WHERE tiktok_account = ?",
        )
        .bind(comment)
        .bind(account_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        // `* 1.0` widens FLOAT to DOUBLE so the row decodes as f64.
        let rows: Vec<ProxyRow> = sqlx::query_as(
            "SELECT id, current_port, avg_delay * 1.0 AS avg_delay, \
                    delay_count, success_count, fail_count, is_using \
             FROM proxy_url",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Proxy {
                id: row.id,
                current_port: u16::try_from(row.current_port).unwrap_or(0),
                avg_delay: row.avg_delay.unwrap_or(0.0),
                delay_count: row.delay_count.unwrap_or(0),
                success_count: row.success_count.unwrap_or(0),
                fail_count: row.fail_count.unwrap_or(0),
                is_using: row.is_using.unwrap_or(false),
            })
            .collect())
    }

    async fn set_proxy_in_use(&self, id: i64, in_use: bool) -> Result<()> {
        sqlx::query("UPDATE proxy_url SET is_using = ? WHERE id = ?")
            .bind(in_use)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_proxy_success(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE proxy_url SET success_count = success_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_proxy_failure(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE proxy_url SET fail_count = fail_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_proxy_latency(&self, id: i64, delay_ms: f64) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_url \
             SET current_delay = ?, \
                 avg_delay = (COALESCE(avg_delay, 0) * COALESCE(delay_count, 0) + ?) \
                     / (COALESCE(delay_count, 0) + 1), \
                 delay_count = COALESCE(delay_count, 0) + 1, \
                 updated_at = NOW() \
             WHERE id = ?",
        )
        .bind(delay_ms.round() as i64)
        .bind(delay_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_proxy_usage_flags(&self) -> Result<()> {
        sqlx::query("UPDATE proxy_url SET is_using = FALSE WHERE is_using = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_probe_urls(&self) -> Result<Vec<ProbeUrl>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM test_speed_url")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, url)| ProbeUrl { id, url })
            .collect())
    }

    async fn record_probe_result(&self, url_id: i64, ok: bool) -> Result<()> {
        let sql = if ok {
            "UPDATE test_speed_url SET success_count = success_count + 1 WHERE id = ?"
        } else {
            "UPDATE test_speed_url SET fail_count = fail_count + 1 WHERE id = ?"
        };
        sqlx::query(sql).bind(url_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_subscription_urls(&self) -> Result<Vec<SubscriptionUrl>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, url FROM subscribe_url")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, url)| SubscriptionUrl { id, url })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_sql_shape() {
        let columns = vec![
            ("nickname", SqlValue::Text("Alice".into())),
            ("verified", SqlValue::Bool(true)),
        ];
        let sql = upsert_sql("tiktok_account", "tiktok_account", &columns);
        assert_eq!(
            sql,
            "INSERT INTO `tiktok_account` (`tiktok_account`, `nickname`, `verified`, `updated_at`) \
             VALUES (?, ?, ?, NOW()) \
             ON DUPLICATE KEY UPDATE `nickname` = VALUES(`nickname`), \
             `verified` = VALUES(`verified`), `updated_at` = NOW()"
        );
    }

    #[test]
    fn upsert_sql_placeholder_count_matches_columns() {
        let columns = vec![
            ("a", SqlValue::Int(1)),
            ("b", SqlValue::Null),
            ("c", SqlValue::Float(1.5)),
        ];
        let sql = upsert_sql("t", "k", &columns);
        // key + three columns
        assert_eq!(sql.matches('?').count(), 4);
        assert_eq!(sql.matches("VALUES(`").count(), 3);
    }
}
