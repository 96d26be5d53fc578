//! One scraping session: a namespace, a proxy, and a browser child
//! bound together.
//!
//! The session owns all three for its lifetime. Closing releases the
//! proxy (`is_using = false`), terminates the child (SIGTERM, then
//! SIGKILL after a grace period), and returns the namespace to the
//! pool. A rebuild is close-then-create, coordinated by the manager.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use browser_host::{ChildHost, ChildIoError, spawn_stderr_drain};
use browser_proto::{ScrapeRequest, ScrapeResponse};
use netns_pool::NetnsPool;
use netns_pool::command::{host_privilege, netns_shell_command};
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SpiderError};
use crate::registry::ProxyRegistry;
use crate::store::Proxy;

/// How long a terminated child may linger before SIGKILL.
const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Bound on namespace acquisition during create; exhaustion within
/// this window is retryable, not fatal.
const RESOURCE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dependencies shared by every session, built once at startup.
pub struct SessionContext {
    pub netns: Arc<NetnsPool>,
    pub registry: Arc<ProxyRegistry>,
    /// Command line that starts the browser child.
    pub child_command: String,
    /// Bound on child responses and on a full rebuild.
    pub session_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Ready,
    Busy,
    Rebuilding,
    Closed,
}

pub struct Session {
    label: String,
    context: Arc<SessionContext>,
    state: SessionState,
    namespace: Option<String>,
    proxy: Option<Proxy>,
    child: Option<Child>,
    host: Option<ChildHost>,
    last_active: Instant,
    rebuilding: bool,
}

impl Session {
    pub fn new(id: u64, context: Arc<SessionContext>) -> Self {
        Self {
            label: format!("session-{id}"),
            context,
            state: SessionState::Creating,
            namespace: None,
            proxy: None,
            child: None,
            host: None,
            last_active: Instant::now(),
            rebuilding: false,
        }
    }

    /// Acquire a namespace and a proxy, then launch the child inside
    /// the namespace with the proxy environment exported.
    pub async fn create(&mut self) -> Result<()> {
        self.state = SessionState::Creating;
        debug!(label = %self.label, "creating session");

        let namespace = self
            .context
            .netns
            .acquire_timeout(RESOURCE_ACQUIRE_TIMEOUT)
            .await
            .map_err(|e| SpiderError::ResourceExhausted(format!("no namespace free: {e}")))?;
        self.namespace = Some(namespace);

        match self.context.registry.acquire().await {
            Ok(Some(proxy)) => self.proxy = Some(proxy),
            Ok(None) => {
                self.release_resources().await;
                return Err(SpiderError::ResourceExhausted("no proxy free".into()));
            }
            Err(e) => {
                self.release_resources().await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.spawn_child().await {
            self.release_resources().await;
            return Err(e);
        }

        self.last_active = Instant::now();
        self.state = SessionState::Ready;
        Ok(())
    }

    async fn spawn_child(&mut self) -> Result<()> {
        // namespace and proxy were just stored by create()
        let Some(namespace) = self.namespace.clone() else {
            return Err(SpiderError::Setup("session has no namespace".into()));
        };
        let Some(port) = self.proxy.as_ref().map(|p| p.current_port) else {
            return Err(SpiderError::Setup("session has no proxy".into()));
        };

        let local_ip = local_ipv4()
            .map_err(|e| SpiderError::Setup(format!("failed to resolve host IP: {e}")))?;
        let proxy_url = format!("http://{local_ip}:{port}");
        let script = format!(
            "export http_proxy={proxy_url}; export https_proxy={proxy_url}; exec {}",
            self.context.child_command
        );

        let mut command = netns_shell_command(&namespace, &script, host_privilege());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SpiderError::Setup(format!("spawn child: {e}")))?;

        let host = match ChildHost::from_child(&self.label, &mut child) {
            Ok(host) => host,
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(SpiderError::Setup(format!("attach child channel: {e}")));
            }
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(self.label.clone(), stderr);
        }

        info!(
            label = %self.label,
            namespace = %namespace,
            proxy_url = %proxy_url,
            "child started"
        );
        self.child = Some(child);
        self.host = Some(host);
        Ok(())
    }

    /// One request/response exchange with the child.
    ///
    /// Requests on a session are strictly sequential; the caller holds
    /// the session exclusively while this runs.
    pub async fn send_command(&mut self, request: &ScrapeRequest) -> Result<ScrapeResponse> {
        if let Some(child) = self.child.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            warn!(label = %self.label, %status, "child has exited");
            return Err(ChildIoError::ChildDead.into());
        }

        let Some(host) = self.host.as_mut() else {
            return Err(ChildIoError::ChildDead.into());
        };
        let response = host.send(request, self.context.session_timeout).await?;
        self.last_active = Instant::now();
        Ok(response)
    }

    /// Release everything: proxy first, then the child (graceful),
    /// then the namespace.
    pub async fn close(&mut self) {
        debug!(label = %self.label, "closing session");

        self.release_proxy().await;

        // Dropping the host closes stdin; a well-behaved child exits on
        // EOF before the SIGTERM even lands.
        self.host = None;
        if let Some(mut child) = self.child.take() {
            terminate_child(&self.label, &mut child, CHILD_SHUTDOWN_GRACE).await;
        }

        self.release_namespace();
        self.state = SessionState::Closed;
    }

    /// Kill the child outright and release resources. Used when a
    /// rebuild ran out of time.
    pub async fn force_cleanup(&mut self) {
        debug!(label = %self.label, "force cleaning up session");
        self.host = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.release_proxy().await;
        self.release_namespace();
        self.state = SessionState::Closed;
    }

    async fn release_resources(&mut self) {
        self.release_proxy().await;
        self.release_namespace();
    }

    async fn release_proxy(&mut self) {
        if let Some(proxy) = self.proxy.take()
            && let Err(e) = self.context.registry.release(proxy.id, false).await
        {
            warn!(label = %self.label, proxy = proxy.id, error = %e, "failed to release proxy");
        }
    }

    fn release_namespace(&mut self) {
        if let Some(namespace) = self.namespace.take() {
            self.context.netns.release(namespace);
        }
    }

    // -- state accessors used by the manager and scheduler --

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_available(&self) -> bool {
        self.state == SessionState::Ready && !self.rebuilding
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding
    }

    pub fn set_rebuilding(&mut self, rebuilding: bool) {
        self.rebuilding = rebuilding;
    }

    pub fn proxy_id(&self) -> Option<i64> {
        self.proxy.as_ref().map(|p| p.id)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Session wired to an in-memory channel instead of a real child.
    #[cfg(test)]
    pub(crate) fn for_test(
        id: u64,
        context: Arc<SessionContext>,
        host: ChildHost,
        proxy: Proxy,
    ) -> Self {
        Self {
            label: format!("session-{id}"),
            context,
            state: SessionState::Ready,
            namespace: None,
            proxy: Some(proxy),
            child: None,
            host: Some(host),
            last_active: Instant::now(),
            rebuilding: false,
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL and reap.
async fn terminate_child(label: &str, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(label = %label, "child terminated gracefully"),
        Err(_) => {
            warn!(label = %label, "child termination timed out, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// The host's primary IPv4 address: bind a UDP socket toward a public
/// address and read the chosen source IP. No packet is sent.
fn local_ipv4() -> std::io::Result<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_child_gracefully() {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg("sleep 30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();

        let started = Instant::now();
        terminate_child("test", &mut child, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_child_falls_back_to_kill() {
        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();

        // Give bash a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate_child("test", &mut child, Duration::from_millis(300)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn local_ipv4_yields_ipv4_when_routable() {
        // Hosts without a default route cannot resolve a source IP;
        // only assert the shape when the call succeeds.
        if let Ok(ip) = local_ipv4() {
            assert!(ip.is_ipv4());
        }
    }
}
