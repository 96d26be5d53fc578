//! Periodic per-proxy latency measurement.
//!
//! Each sweep pairs every proxy with every probe URL and issues an
//! HTTP GET through `127.0.0.1:{current_port}` under a fixed
//! parallelism cap. A 2xx answer records the elapsed milliseconds on
//! the proxy and a success on the URL; anything else records a
//! failure on the URL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::registry::ProxyRegistry;
use crate::store::{DataStore, ProbeUrl, Proxy};

pub struct LatencyProbe {
    store: Arc<dyn DataStore>,
    registry: Arc<ProxyRegistry>,
    initial_delay: Duration,
    interval: Duration,
    parallelism: usize,
    request_timeout: Duration,
}

impl LatencyProbe {
    pub fn new(store: Arc<dyn DataStore>, registry: Arc<ProxyRegistry>, config: &ProbeConfig) -> Self {
        Self {
            store,
            registry,
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.interval_secs),
            parallelism: config.parallelism,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Singleton background loop: initial delay, then one sweep per
    /// interval, forever.
    pub async fn run(self: Arc<Self>) {
        tokio::time::sleep(self.initial_delay).await;
        loop {
            self.sweep().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Measure every (proxy, url) pair once.
    pub async fn sweep(&self) {
        let proxies = match self.store.list_proxies().await {
            Ok(proxies) => proxies,
            Err(e) => {
                error!(error = %e, "failed to list proxies for probing");
                return;
            }
        };
        let urls = match self.store.list_probe_urls().await {
            Ok(urls) => urls,
            Err(e) => {
                error!(error = %e, "failed to list probe urls");
                return;
            }
        };

        if proxies.is_empty() || urls.is_empty() {
            debug!(
                proxies = proxies.len(),
                urls = urls.len(),
                "nothing to probe"
            );
            return;
        }

        info!(
            proxies = proxies.len(),
            urls = urls.len(),
            "starting latency sweep"
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut set = JoinSet::new();
        for proxy in &proxies {
            for url in &urls {
                set.spawn(probe_pair(
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    proxy.clone(),
                    url.clone(),
                    Arc::clone(&semaphore),
                    self.request_timeout,
                ));
            }
        }
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "probe task panicked");
            }
        }

        info!("latency sweep complete");
    }
}

/// Measure one (proxy, url) pair; free function so it can be spawned
/// on a `JoinSet`.
async fn probe_pair(
    store: Arc<dyn DataStore>,
    registry: Arc<ProxyRegistry>,
    proxy: Proxy,
    url: ProbeUrl,
    semaphore: Arc<Semaphore>,
    request_timeout: Duration,
) {
    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    let started = Instant::now();
    let outcome = fetch_via_proxy(&url.url, proxy.current_port, request_timeout).await;
    match outcome {
        Ok(()) => {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            debug!(proxy = proxy.id, url = %url.url, elapsed_ms, "probe succeeded");
            if let Err(e) = registry.record_latency(proxy.id, elapsed_ms).await {
                error!(proxy = proxy.id, error = %e, "failed to record latency");
            }
            if let Err(e) = store.record_probe_result(url.id, true).await {
                error!(url = url.id, error = %e, "failed to record probe success");
            }
        }
        Err(e) => {
            warn!(proxy = proxy.id, url = %url.url, error = %e, "probe failed");
            if let Err(e) = store.record_probe_result(url.id, false).await {
                error!(url = url.id, error = %e, "failed to record probe failure");
            }
        }
    }
}

/// GET `url` through the loopback forwarder port; any non-2xx status
/// or transport error counts as failure. The timeout is the total
/// budget including body download.
async fn fetch_via_proxy(url: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let proxy = reqwest::Proxy::all(format!("http://127.0.0.1:{port}"))
        .map_err(|e| format!("proxy config: {e}"))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| format!("client build: {e}"))?;

    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("status {status}"));
    }
    response.bytes().await.map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::store::{MemoryStore, test_proxy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_probe(store: Arc<MemoryStore>, timeout_secs: u64) -> LatencyProbe {
        let registry = Arc::new(ProxyRegistry::new(
            Arc::clone(&store) as Arc<dyn DataStore>,
            false,
        ));
        LatencyProbe::new(
            store as Arc<dyn DataStore>,
            registry,
            &ProbeConfig {
                initial_delay_secs: 0,
                interval_secs: 3600,
                parallelism: 4,
                request_timeout_secs: timeout_secs,
            },
        )
    }

    /// Minimal HTTP proxy: answers every absolute-form GET with 200.
    async fn spawn_mock_proxy(connections: usize) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for _ in 0..connections {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut seen = Vec::new();
                    loop {
                        let Ok(n) = socket.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        seen.extend_from_slice(&buf[..n]);
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn sweep_records_latency_and_success() {
        let port = spawn_mock_proxy(1).await;

        let store = Arc::new(MemoryStore::new());
        let mut proxy = test_proxy(1, port);
        proxy.avg_delay = 0.0;
        proxy.delay_count = 0;
        store.add_proxy(proxy);
        store.add_probe_url(10, "http://probe.example/");

        let probe = make_probe(Arc::clone(&store), 5);
        probe.sweep().await;

        let proxy = store.proxy(1).unwrap();
        assert_eq!(proxy.delay_count, 1);
        assert!(proxy.avg_delay > 0.0);
        assert_eq!(store.probe_counters(10), (1, 0));
    }

    #[tokio::test]
    async fn sweep_records_failure_on_dead_proxy() {
        // Bind and immediately drop to find a port with no listener.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let store = Arc::new(MemoryStore::new());
        let mut proxy = test_proxy(1, port);
        proxy.avg_delay = 0.0;
        proxy.delay_count = 0;
        store.add_proxy(proxy);
        store.add_probe_url(10, "http://probe.example/");

        let probe = make_probe(Arc::clone(&store), 1);
        probe.sweep().await;

        let proxy = store.proxy(1).unwrap();
        assert_eq!(proxy.delay_count, 0, "no latency recorded on failure");
        assert_eq!(store.probe_counters(10), (0, 1));
    }

    #[tokio::test]
    async fn sweep_covers_all_pairs() {
        let port = spawn_mock_proxy(4).await;

        let store = Arc::new(MemoryStore::new());
        store.add_proxy(test_proxy(1, port));
        store.add_proxy(test_proxy(2, port));
        store.add_probe_url(10, "http://a.example/");
        store.add_probe_url(11, "http://b.example/");

        let probe = make_probe(Arc::clone(&store), 5);
        probe.sweep().await;

        assert_eq!(store.probe_counters(10), (2, 0));
        assert_eq!(store.probe_counters(11), (2, 0));
        assert_eq!(store.proxy(1).unwrap().delay_count, 3);
        assert_eq!(store.proxy(2).unwrap().delay_count, 3);
    }

    #[tokio::test]
    async fn sweep_with_nothing_to_probe_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let probe = make_probe(Arc::clone(&store), 1);
        probe.sweep().await;
        assert_eq!(store.probe_counters(1), (0, 0));
    }
}
