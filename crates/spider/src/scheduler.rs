//! Converts the eligible account set into completed scrapes.
//!
//! Each sweep loads the active-relationship join, computes per-account
//! priority times, drops accounts whose priority time is still in the
//! future, and drains the remainder through the session pool under a
//! semaphore sized to the pool. Child responses are classified into a
//! small decision table that drives persistence, proxy accounting, and
//! session rebuilds.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use browser_proto::{ScrapeRequest, ScrapeResponse};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::SpiderConfig;
use crate::manager::SessionManager;
use crate::registry::ProxyRegistry;
use crate::session::Session;
use crate::store::{AccountRow, COMMENT_FETCH_FAILED, COMMENT_MISSING, DataStore};

/// Retry backoff after a failed fetch.
const RETRY_AFTER_FAILURE_SECS: i64 = 1800;
/// Retry backoff for accounts the platform does not know.
const RETRY_AFTER_MISSING_SECS: i64 = 21600;
/// Refresh interval after a successful fetch.
const RETRY_AFTER_SUCCESS_SECS: i64 = 600;

/// One unit of scraping work.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountTask {
    pub account_name: String,
    pub tiktok_id: Option<String>,
    pub unique_id: String,
    /// Earliest epoch second at which this task became eligible.
    pub priority_time: i64,
}

/// Seconds-epoch instant at which an account becomes due again.
///
/// Never-fetched accounts (no `updated_at`) are maximally urgent.
pub fn priority_time(updated_at: Option<&DateTime<Utc>>, comments: Option<&str>) -> i64 {
    match updated_at {
        None => 0,
        Some(ts) => {
            let base = ts.timestamp();
            match comments {
                Some(COMMENT_FETCH_FAILED) => base + RETRY_AFTER_FAILURE_SECS,
                Some(COMMENT_MISSING) => base + RETRY_AFTER_MISSING_SECS,
                _ => base + RETRY_AFTER_SUCCESS_SECS,
            }
        }
    }
}

/// The platform handle: everything after the last `@`, whitespace
/// stripped; the whole handle when there is no `@`.
pub fn derive_unique_id(account_name: &str) -> String {
    let tail = match account_name.rfind('@') {
        Some(index) => &account_name[index + 1..],
        None => account_name,
    };
    tail.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Filter and order the sweep's raw rows: drop rows whose priority
/// time is in the future, sort ascending, stable on ties.
pub fn eligible_tasks(rows: Vec<AccountRow>, now: i64) -> Vec<AccountTask> {
    let mut tasks: Vec<AccountTask> = rows
        .into_iter()
        .filter_map(|row| {
            let priority = priority_time(row.updated_at.as_ref(), row.comments.as_deref());
            if priority > now {
                return None;
            }
            Some(AccountTask {
                unique_id: derive_unique_id(&row.account_name),
                account_name: row.account_name,
                tiktok_id: row.tiktok_id,
                priority_time: priority,
            })
        })
        .collect();
    tasks.sort_by_key(|task| task.priority_time);
    tasks
}

/// What one child response means for the task.
#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
    Success(serde_json::Value),
    /// Message is literally `'user'` or `'id'`: the platform does not
    /// know this account. Terminal for this cycle, no proxy penalty.
    AccountMissing,
    /// The child lost its browser; rebuild, no proxy penalty.
    ChildUnresponsive,
    /// The platform returned an empty document through this proxy;
    /// charged double against it.
    EmptyResponse,
    /// Anything else: one proxy penalty and a rebuild.
    Failed(String),
}

pub(crate) fn classify(response: ScrapeResponse) -> Outcome {
    match response {
        ScrapeResponse::Success { data } => Outcome::Success(data),
        ScrapeResponse::Error { message } => {
            if message == "'user'" || message == "'id'" {
                Outcome::AccountMissing
            } else if message.contains("No response from child process") {
                Outcome::ChildUnresponsive
            } else if message.contains("TikTok returned an empty response") {
                Outcome::EmptyResponse
            } else {
                Outcome::Failed(message)
            }
        }
    }
}

/// Whether the session must be rebuilt after a task.
struct TaskFlow {
    rebuild: bool,
}

pub struct Scheduler {
    store: Arc<dyn DataStore>,
    registry: Arc<ProxyRegistry>,
    manager: Arc<SessionManager>,
    cooldown: Duration,
    idle_sleep: Duration,
    empty_response_penalty: u32,
    inflight: Mutex<HashSet<String>>,
    queue: Mutex<VecDeque<AccountTask>>,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DataStore>,
        registry: Arc<ProxyRegistry>,
        manager: Arc<SessionManager>,
        config: &SpiderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            manager,
            cooldown: config.cooldown(),
            idle_sleep: config.idle_sleep(),
            empty_response_penalty: config.proxies.empty_response_penalty,
            inflight: Mutex::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(config.sessions.max_sessions)),
        })
    }

    /// Sweep forever. Fetch errors and empty sweeps both back off for
    /// the idle interval.
    pub async fn run(self: Arc<Self>) {
        info!("scheduler started");
        loop {
            let rows = match self.store.fetch_active_accounts().await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "failed to fetch active accounts");
                    tokio::time::sleep(self.idle_sleep).await;
                    continue;
                }
            };

            let tasks = eligible_tasks(rows, Utc::now().timestamp());
            let queued = self.enqueue(tasks);
            if queued == 0 {
                debug!("no eligible accounts, sleeping");
                tokio::time::sleep(self.idle_sleep).await;
                continue;
            }

            info!(queued, "sweep starting");
            Self::drain_queue(&self).await;
        }
    }

    /// Append tasks not already queued or in flight. Returns how many
    /// were added.
    fn enqueue(&self, tasks: Vec<AccountTask>) -> usize {
        let mut inflight = lock(&self.inflight);
        let mut queue = lock(&self.queue);
        let mut added = 0;
        for task in tasks {
            if inflight.insert(task.account_name.clone()) {
                queue.push_back(task);
                added += 1;
            }
        }
        added
    }

    /// Drain the FIFO through the pool; returns when the sweep's tasks
    /// have all completed.
    async fn drain_queue(this: &Arc<Self>) {
        let mut workers = JoinSet::new();
        loop {
            let task = lock(&this.queue).pop_front();
            let Some(task) = task else { break };
            let scheduler = Arc::clone(this);
            workers.spawn(async move { scheduler.run_task(task).await });
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "scrape task panicked");
            }
        }
    }

    async fn run_task(self: Arc<Self>, task: AccountTask) {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };

        let slot = self.manager.checkout().await;
        let flow = {
            let mut session = slot.lock().await;
            self.process_account(&mut session, &task).await
        };
        if flow.rebuild {
            self.manager.rebuild(&slot).await;
        }

        tokio::time::sleep(self.cooldown).await;
        self.manager.checkin(&slot).await;
        lock(&self.inflight).remove(&task.account_name);
    }

    /// Run the two-command protocol for one account on a checked-out
    /// session. The caller performs the rebuild after the session lock
    /// is dropped.
    async fn process_account(&self, session: &mut Session, task: &AccountTask) -> TaskFlow {
        info!(
            session = %session.label(),
            namespace = session.namespace().unwrap_or("-"),
            proxy = session.proxy_id().unwrap_or(-1),
            account = %task.unique_id,
            "processing account"
        );
        let proxy_id = session.proxy_id();

        let request = ScrapeRequest::user_info(task.unique_id.clone(), task.tiktok_id.clone());
        let response = match session.send_command(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(account = %task.unique_id, error = %e, "user info request failed");
                self.penalize(proxy_id, 1).await;
                return TaskFlow { rebuild: true };
            }
        };

        match classify(response) {
            Outcome::AccountMissing => {
                if let Err(e) = self
                    .store
                    .set_account_comment(&task.account_name, COMMENT_MISSING)
                    .await
                {
                    error!(account = %task.account_name, error = %e, "failed to mark missing account");
                }
                TaskFlow { rebuild: false }
            }
            Outcome::ChildUnresponsive => TaskFlow { rebuild: true },
            Outcome::EmptyResponse => {
                self.penalize(proxy_id, self.empty_response_penalty).await;
                TaskFlow { rebuild: true }
            }
            Outcome::Failed(message) => {
                error!(account = %task.unique_id, %message, "unknown error getting user info");
                self.penalize(proxy_id, 1).await;
                TaskFlow { rebuild: true }
            }
            Outcome::Success(data) => self.finish_account(session, task, proxy_id, data).await,
        }
    }

    /// Persist the profile, fetch the videos, and credit the proxy.
    async fn finish_account(
        &self,
        session: &mut Session,
        task: &AccountTask,
        proxy_id: Option<i64>,
        data: serde_json::Value,
    ) -> TaskFlow {
        if let Err(e) = self.store.upsert_account(&task.account_name, &data).await {
            // Persistence failure: the write rolled back; neither a
            // proxy credit nor a penalty applies.
            error!(account = %task.account_name, error = %e, "failed to persist account");
            return TaskFlow { rebuild: false };
        }

        let request = ScrapeRequest::user_videos(task.unique_id.clone());
        let response = match session.send_command(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(account = %task.unique_id, error = %e, "user videos request failed");
                self.penalize(proxy_id, 1).await;
                return TaskFlow { rebuild: true };
            }
        };

        match classify(response) {
            Outcome::Success(videos) => {
                if let serde_json::Value::Array(list) = videos
                    && !list.is_empty()
                {
                    if let Err(e) = self.store.upsert_videos(&list).await {
                        error!(account = %task.account_name, error = %e, "failed to persist videos");
                        return TaskFlow { rebuild: false };
                    }
                }
                if let Some(id) = proxy_id
                    && let Err(e) = self.registry.record_success(id).await
                {
                    error!(proxy = id, error = %e, "failed to record proxy success");
                }
                TaskFlow { rebuild: false }
            }
            other => {
                error!(account = %task.unique_id, ?other, "user videos fetch failed");
                self.penalize(proxy_id, 1).await;
                TaskFlow { rebuild: true }
            }
        }
    }

    async fn penalize(&self, proxy_id: Option<i64>, count: u32) {
        if count == 0 {
            return;
        }
        if let Some(id) = proxy_id
            && let Err(e) = self.registry.record_failure(id, count).await
        {
            error!(proxy = id, error = %e, "failed to record proxy failure");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
