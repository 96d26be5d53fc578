//! Session pool: checkout, supervision, health checks, rebuilds.
//!
//! The pool holds up to `max_sessions` sessions. Checkout is a fair
//! linear scan for the first Ready session; empty scans poll on a
//! short interval until a session frees. A supervisor tick refills the
//! pool after failed creates or rebuilds, and a health-check tick
//! rebuilds sessions that have gone quiet.
//!
//! Rebuilds are serialized by a process-wide lock, and a per-session
//! `rebuilding` flag rejects re-entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SpiderError};
use crate::session::{Session, SessionContext, SessionState};

/// Poll interval while waiting for a free session.
const CHECKOUT_POLL: Duration = Duration::from_millis(100);

type Slot = Arc<tokio::sync::Mutex<Session>>;

pub struct SessionManager {
    context: Arc<SessionContext>,
    sessions: tokio::sync::Mutex<Vec<Slot>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    max_sessions: usize,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(context: Arc<SessionContext>, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            context,
            sessions: tokio::sync::Mutex::new(Vec::with_capacity(max_sessions)),
            rebuild_lock: tokio::sync::Mutex::new(()),
            max_sessions,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create the initial pool. An empty namespace pool is a hard
    /// error; individual session failures are not — the supervisor
    /// retries them later.
    pub async fn initialize(&self) -> Result<()> {
        if self.context.netns.size() == 0 {
            return Err(SpiderError::Setup(
                "namespace pool is empty, cannot run any session".into(),
            ));
        }

        for _ in 0..self.max_sessions {
            if let Err(e) = self.spawn_session().await {
                error!(error = %e, "failed to create session");
            }
        }

        let count = self.sessions.lock().await.len();
        info!(sessions = count, target = self.max_sessions, "session pool initialized");
        Ok(())
    }

    async fn spawn_session(&self) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(id, Arc::clone(&self.context));
        session.create().await?;
        debug!(label = %session.label(), "session added to pool");
        self.sessions
            .lock()
            .await
            .push(Arc::new(tokio::sync::Mutex::new(session)));
        Ok(())
    }

    /// Check out the first available session, marking it Busy.
    ///
    /// A session currently locked by another task is simply skipped;
    /// when the whole pool is taken, polls until one frees.
    pub async fn checkout(&self) -> Slot {
        loop {
            {
                let pool = self.sessions.lock().await;
                for slot in pool.iter() {
                    if let Ok(mut session) = slot.try_lock()
                        && session.is_available()
                    {
                        session.set_state(SessionState::Busy);
                        return Arc::clone(slot);
                    }
                }
            }
            tokio::time::sleep(CHECKOUT_POLL).await;
        }
    }

    /// Return a checked-out session to the pool.
    pub async fn checkin(&self, slot: &Slot) {
        let mut session = slot.lock().await;
        if session.state() == SessionState::Busy {
            session.set_state(SessionState::Ready);
        }
    }

    /// Close and re-create one session, bounded by the session
    /// timeout. On failure the slot is emptied; the supervisor refills
    /// it on its next tick.
    pub async fn rebuild(&self, slot: &Slot) {
        let _guard = self.rebuild_lock.lock().await;

        let mut session = slot.lock().await;
        if session.is_rebuilding() {
            debug!(label = %session.label(), "rebuild already in progress");
            return;
        }
        session.set_rebuilding(true);
        session.set_state(SessionState::Rebuilding);
        info!(label = %session.label(), "rebuilding session");

        session.close().await;

        let rebuilt =
            match tokio::time::timeout(self.context.session_timeout, session.create()).await {
                Ok(Ok(())) => {
                    info!(label = %session.label(), "session rebuilt");
                    true
                }
                Ok(Err(e)) => {
                    error!(label = %session.label(), error = %e, "session rebuild failed");
                    session.force_cleanup().await;
                    false
                }
                Err(_) => {
                    error!(label = %session.label(), "session rebuild timed out, forcing cleanup");
                    session.force_cleanup().await;
                    false
                }
            };

        session.set_rebuilding(false);
        drop(session);

        if !rebuilt {
            self.remove_slot(slot).await;
        }
    }

    async fn remove_slot(&self, slot: &Slot) {
        self.sessions
            .lock()
            .await
            .retain(|s| !Arc::ptr_eq(s, slot));
    }

    pub async fn pool_len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Periodically top the pool back up to `max_sessions`.
    pub fn spawn_supervisor(manager: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let current = manager.pool_len().await;
                if current >= manager.max_sessions {
                    continue;
                }
                debug!(
                    current,
                    target = manager.max_sessions,
                    "session pool below target, refilling"
                );
                for _ in current..manager.max_sessions {
                    if let Err(e) = manager.spawn_session().await {
                        warn!(error = %e, "supervisor failed to create session");
                        break;
                    }
                }
            }
        })
    }

    /// Periodically rebuild Ready sessions whose last activity
    /// predates the session timeout. Busy sessions are left to their
    /// own request timeouts.
    pub fn spawn_health_check(manager: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let stale: Vec<Slot> = {
                    let pool = manager.sessions.lock().await;
                    pool.iter()
                        .filter(|slot| {
                            slot.try_lock().is_ok_and(|session| {
                                session.state() == SessionState::Ready
                                    && !session.is_rebuilding()
                                    && session.idle_for() > manager.context.session_timeout
                            })
                        })
                        .cloned()
                        .collect()
                };
                for slot in stale {
                    {
                        let session = slot.lock().await;
                        warn!(label = %session.label(), "session is unresponsive, rebuilding");
                    }
                    manager.rebuild(&slot).await;
                }
            }
        })
    }

    /// Close every session. Called once at shutdown after workers have
    /// drained.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.sessions.lock().await.drain(..).collect();
        for slot in slots {
            slot.lock().await.close().await;
        }
        info!("all sessions closed");
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, session: Session) -> Slot {
        let slot = Arc::new(tokio::sync::Mutex::new(session));
        self.sessions.lock().await.push(Arc::clone(&slot));
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProxyRegistry;
    use crate::store::{DataStore, MemoryStore, test_proxy};
    use browser_host::ChildHost;
    use netns_pool::NetnsPool;

    fn test_context(store: &Arc<MemoryStore>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            netns: Arc::new(NetnsPool::with_names([])),
            registry: Arc::new(ProxyRegistry::new(
                Arc::clone(store) as Arc<dyn DataStore>,
                false,
            )),
            child_command: "true".into(),
            session_timeout: Duration::from_secs(1),
        })
    }

    fn idle_host() -> ChildHost {
        let (host_end, _child_end) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(host_end);
        ChildHost::new("test", write, read)
    }

    async fn ready_session(
        id: u64,
        context: &Arc<SessionContext>,
        store: &Arc<MemoryStore>,
        proxy_id: i64,
    ) -> Session {
        let mut proxy = test_proxy(proxy_id, 1080);
        proxy.is_using = true;
        store.add_proxy(proxy.clone());
        Session::for_test(id, Arc::clone(context), idle_host(), proxy)
    }

    #[tokio::test]
    async fn initialize_fails_without_namespaces() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(test_context(&store), 2);
        let err = manager.initialize().await.unwrap_err();
        assert!(err.to_string().contains("namespace pool is empty"), "got: {err}");
    }

    #[tokio::test]
    async fn checkout_marks_busy_and_scans_fairly() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 2);
        let first = manager
            .insert_for_test(ready_session(1, &context, &store, 1).await)
            .await;
        let _second = manager
            .insert_for_test(ready_session(2, &context, &store, 2).await)
            .await;

        let a = manager.checkout().await;
        assert!(Arc::ptr_eq(&a, &first));
        assert_eq!(a.lock().await.state(), SessionState::Busy);

        let b = manager.checkout().await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn checkout_waits_for_checkin() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 1);
        manager
            .insert_for_test(ready_session(1, &context, &store, 1).await)
            .await;

        let slot = manager.checkout().await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.checkout().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        manager.checkin(&slot).await;
        let again = waiter.await.unwrap();
        assert!(Arc::ptr_eq(&again, &slot));
    }

    #[tokio::test]
    async fn checkin_only_downgrades_busy() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 1);
        let slot = manager
            .insert_for_test(ready_session(1, &context, &store, 1).await)
            .await;

        slot.lock().await.set_state(SessionState::Closed);
        manager.checkin(&slot).await;
        assert_eq!(slot.lock().await.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn failed_rebuild_empties_the_slot_and_releases_the_proxy() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 1);
        let slot = manager
            .insert_for_test(ready_session(1, &context, &store, 7).await)
            .await;
        assert_eq!(manager.pool_len().await, 1);

        // The test context has no namespaces, so re-create fails and
        // the manager must clean up and drop the slot.
        manager.rebuild(&slot).await;

        assert_eq!(manager.pool_len().await, 0);
        assert!(!store.proxy(7).unwrap().is_using, "proxy still marked in use");
        assert_eq!(slot.lock().await.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn rebuild_rejects_reentry() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 1);
        let slot = manager
            .insert_for_test(ready_session(1, &context, &store, 1).await)
            .await;

        slot.lock().await.set_rebuilding(true);
        manager.rebuild(&slot).await;

        // Untouched: still in pool, still flagged.
        assert_eq!(manager.pool_len().await, 1);
        assert!(slot.lock().await.is_rebuilding());
    }

    #[tokio::test]
    async fn shutdown_closes_and_drains_the_pool() {
        let store = Arc::new(MemoryStore::new());
        let context = test_context(&store);
        let manager = SessionManager::new(Arc::clone(&context), 2);
        manager
            .insert_for_test(ready_session(1, &context, &store, 1).await)
            .await;
        manager
            .insert_for_test(ready_session(2, &context, &store, 2).await)
            .await;

        manager.shutdown().await;
        assert_eq!(manager.pool_len().await, 0);
        assert!(!store.proxy(1).unwrap().is_using);
        assert!(!store.proxy(2).unwrap().is_using);
    }
}
