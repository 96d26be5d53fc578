//! Leased pool of Linux network namespaces.
//!
//! Each namespace `ns{i}` is wired to the host through a veth pair:
//!
//! ```text
//! ┌─────────────────────────┐        ┌─────────────────────────┐
//! │          ns0            │        │          ns1            │
//! │  veth_ns_0_ns           │        │  veth_ns_1_ns           │
//! │  10.200.0.2/24          │        │  10.200.1.2/24          │
//! │  default via 10.200.0.1 │        │  default via 10.200.1.1 │
//! └───────────┬─────────────┘        └───────────┬─────────────┘
//!             │ veth_ns_0_host                   │ veth_ns_1_host
//!         10.200.0.1                         10.200.1.1
//!             └────────────────┬────────────────┘
//!                         host (forwarding)
//! ```
//!
//! Design:
//! - [`NetnsPool::initialize`] wipes every pre-existing namespace and
//!   stale `veth_ns_*` interface, then creates `n` fresh namespaces.
//!   A namespace whose setup fails is rolled back and skipped; the
//!   pool exposes whatever subset succeeded.
//! - [`NetnsPool::acquire`] waits on a FIFO queue until a name frees.
//! - [`NetnsPool::release`] returns the name to the back of the queue.
//! - Processes are launched inside a namespace with
//!   [`command::netns_shell_command`].

pub mod command;

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use command::{Privilege, exec, exec_ignore_errors, host_privilege};

/// Namespace name prefix.
pub const NS_PREFIX: &str = "ns";
/// Prefix shared by every veth device the provisioner creates.
pub const VETH_PREFIX: &str = "veth_ns_";
/// First two octets of every veth address.
const IP_PREFIX: &str = "10.200";

/// Highest usable namespace index; the index is the third IP octet.
const MAX_NAMESPACES: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum NetnsError {
    #[error(transparent)]
    Command(#[from] command::CommandError),

    #[error("requested {requested} namespaces, host addressing supports at most {max}")]
    TooManyNamespaces { requested: usize, max: usize },

    #[error("no namespace available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("namespace queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, NetnsError>;

// ---------------------------------------------------------------------------
// Naming & address helpers (pure functions)
// ---------------------------------------------------------------------------

fn ns_name(index: usize) -> String {
    format!("{NS_PREFIX}{index}")
}

fn host_veth(index: usize) -> String {
    format!("{VETH_PREFIX}{index}_host")
}

fn ns_veth(index: usize) -> String {
    format!("{VETH_PREFIX}{index}_ns")
}

/// Host-side address, without prefix length.
fn host_ip(index: usize) -> String {
    format!("{IP_PREFIX}.{index}.1")
}

/// Namespace-side address, without prefix length.
fn peer_ip(index: usize) -> String {
    format!("{IP_PREFIX}.{index}.2")
}

/// Parse namespace names out of `ip netns list` output.
///
/// Lines look like `ns0` or `ns0 (id: 3)`; the name is the first token.
fn parse_netns_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Parse interface names out of `ip -o link show` output.
///
/// Lines look like `3: veth_ns_0_host@if2: <BROADCAST,...>`; the name
/// sits between the index and the first `@` or `:`.
fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once(": ")?;
            let name = rest.split([':', '@']).next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Host operations
// ---------------------------------------------------------------------------

/// Delete every network namespace on the host.
async fn delete_all_namespaces(privilege: Privilege) {
    let output = match exec("ip", &["netns", "list"], privilege).await {
        Ok(output) => output,
        Err(e) => {
            error!(error = %e, "failed to list namespaces for cleanup");
            return;
        }
    };
    for name in parse_netns_names(&output) {
        debug!(name = %name, "deleting stale namespace");
        exec_ignore_errors("ip", &["netns", "delete", &name], privilege).await;
    }
}

/// Delete every host interface created by a previous run.
async fn delete_stale_veths(privilege: Privilege) {
    let output = match exec("ip", &["-o", "link", "show"], privilege).await {
        Ok(output) => output,
        Err(e) => {
            error!(error = %e, "failed to list interfaces for cleanup");
            return;
        }
    };
    for name in parse_link_names(&output) {
        if name.starts_with(VETH_PREFIX) {
            debug!(name = %name, "deleting stale veth");
            exec_ignore_errors("ip", &["link", "delete", &name], privilege).await;
        }
    }
}

/// Remove one namespace's resources (best effort).
async fn delete_namespace_resources(index: usize, privilege: Privilege) {
    exec_ignore_errors("ip", &["link", "delete", &host_veth(index)], privilege).await;
    exec_ignore_errors("ip", &["netns", "delete", &ns_name(index)], privilege).await;
}

/// Create namespace `ns{index}` with veth pair, addresses, loopback,
/// and a default route via the host side.
async fn create_namespace(index: usize, privilege: Privilege) -> Result<String> {
    let ns = ns_name(index);
    let host_dev = host_veth(index);
    let ns_dev = ns_veth(index);
    let host_addr = format!("{}/24", host_ip(index));
    let ns_addr = format!("{}/24", peer_ip(index));
    let gateway = host_ip(index);

    exec("ip", &["netns", "add", &ns], privilege).await?;

    let setup = async {
        exec(
            "ip",
            &["link", "add", &host_dev, "type", "veth", "peer", "name", &ns_dev],
            privilege,
        )
        .await?;
        exec("ip", &["link", "set", &ns_dev, "netns", &ns], privilege).await?;
        exec("ip", &["addr", "add", &host_addr, "dev", &host_dev], privilege).await?;
        exec("ip", &["link", "set", &host_dev, "up"], privilege).await?;
        exec(
            "ip",
            &["netns", "exec", &ns, "ip", "addr", "add", &ns_addr, "dev", &ns_dev],
            privilege,
        )
        .await?;
        exec(
            "ip",
            &["netns", "exec", &ns, "ip", "link", "set", &ns_dev, "up"],
            privilege,
        )
        .await?;
        exec(
            "ip",
            &["netns", "exec", &ns, "ip", "link", "set", "lo", "up"],
            privilege,
        )
        .await?;
        exec(
            "ip",
            &["netns", "exec", &ns, "ip", "route", "add", "default", "via", &gateway],
            privilege,
        )
        .await?;
        Ok::<(), NetnsError>(())
    };

    match setup.await {
        Ok(()) => {
            info!(name = %ns, "namespace created");
            Ok(ns)
        }
        Err(e) => {
            error!(name = %ns, error = %e, "namespace setup failed, rolling back");
            delete_namespace_resources(index, privilege).await;
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// NetnsPool
// ---------------------------------------------------------------------------

/// FIFO pool of leased namespace names.
pub struct NetnsPool {
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    size: usize,
    privilege: Privilege,
}

impl NetnsPool {
    /// Idempotent host setup: wipe stale namespaces and veths, enable
    /// IPv4 forwarding, create `n` namespaces, queue the survivors.
    ///
    /// A namespace that fails mid-setup is rolled back and skipped;
    /// the pool still comes up with the remainder. Callers decide
    /// whether an under-filled (or empty) pool is fatal.
    pub async fn initialize(n: usize) -> Result<Self> {
        if n > MAX_NAMESPACES {
            return Err(NetnsError::TooManyNamespaces {
                requested: n,
                max: MAX_NAMESPACES,
            });
        }

        let privilege = host_privilege();
        info!(requested = n, "initializing namespace pool");

        delete_all_namespaces(privilege).await;
        delete_stale_veths(privilege).await;
        exec("sysctl", &["-w", "net.ipv4.ip_forward=1"], privilege).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut created = 0usize;
        for index in 0..n {
            match create_namespace(index, privilege).await {
                Ok(ns) => {
                    // Send cannot fail: rx lives in the pool we return.
                    let _ = tx.send(ns);
                    created += 1;
                }
                Err(e) => {
                    error!(index, error = %e, "skipping namespace");
                }
            }
        }

        if created < n {
            warn!(requested = n, created, "namespace pool initialized with fewer namespaces than requested");
        }
        info!(available = created, "namespace pool initialized");

        Ok(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            size: created,
            privilege,
        })
    }

    /// Build an empty in-process pool and seed it with `names`.
    ///
    /// No host commands run; tests exercise the FIFO discipline with
    /// this.
    pub fn with_names(names: impl IntoIterator<Item = String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut size = 0;
        for name in names {
            let _ = tx.send(name);
            size += 1;
        }
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            size,
            privilege: Privilege::User,
        }
    }

    /// Number of namespaces the pool came up with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait until a namespace frees, FIFO order.
    pub async fn acquire(&self) -> Result<String> {
        let name = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetnsError::Closed)?;
        debug!(name = %name, "acquired namespace");
        Ok(name)
    }

    /// Like [`acquire`](Self::acquire), bounded by `timeout`.
    ///
    /// Exhaustion inside the window is a retryable
    /// [`NetnsError::AcquireTimeout`], not a fatal error.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<String> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| NetnsError::AcquireTimeout(timeout))?
    }

    /// Return a namespace to the back of the queue.
    pub fn release(&self, name: String) {
        debug!(name = %name, "released namespace");
        let _ = self.tx.send(name);
    }

    /// Delete every namespace and stale veth on the host.
    pub async fn teardown(&self) {
        info!("tearing down namespace pool");
        delete_all_namespaces(self.privilege).await;
        delete_stale_veths(self.privilege).await;
    }
}

/// One-shot host cleanup without constructing a pool (CLI use).
pub async fn cleanup_host() {
    let privilege = host_privilege();
    delete_all_namespaces(privilege).await;
    delete_stale_veths(privilege).await;
}
