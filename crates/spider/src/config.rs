use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpiderError};

pub(crate) const DEFAULT_MAX_SESSIONS: usize = 5;
pub(crate) const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;
pub(crate) const DEFAULT_SUPERVISOR_INTERVAL_SECS: u64 = 10;
pub(crate) const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 3600;
pub(crate) const DEFAULT_COOLDOWN_SECS: u64 = 3;
pub(crate) const DEFAULT_IDLE_SLEEP_SECS: u64 = 5;
pub(crate) const DEFAULT_EMPTY_RESPONSE_PENALTY: u32 = 2;
pub(crate) const DEFAULT_PROBE_INITIAL_DELAY_SECS: u64 = 10;
pub(crate) const DEFAULT_PROBE_INTERVAL_SECS: u64 = 3600;
pub(crate) const DEFAULT_PROBE_PARALLELISM: usize = 10;
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// MySQL connection URL.
    pub database_url: String,
    /// Command line that starts one browser child (run under
    /// `ip netns exec` with the proxy environment exported).
    pub child_command: String,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub proxies: ProxiesConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Pool size; also the number of namespaces provisioned.
    pub max_sessions: usize,
    /// Bound on child responses and on a full session rebuild.
    pub session_timeout_secs: u64,
    /// How often the supervisor refills the pool.
    pub supervisor_interval_secs: u64,
    /// How often stale sessions are checked for rebuild.
    pub health_check_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            supervisor_interval_secs: DEFAULT_SUPERVISOR_INTERVAL_SECS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pause before a session returns to the pool after a task.
    pub cooldown_secs: u64,
    /// Sleep between sweeps when no account is eligible.
    pub idle_sleep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            idle_sleep_secs: DEFAULT_IDLE_SLEEP_SECS,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
    /// Exclude proxies that have never been probed (`avg_delay == 0`)
    /// from selection.
    pub strict_delay_filter: bool,
    /// fail_count increments charged for an upstream empty response.
    pub empty_response_penalty: u32,
}

impl Default for ProxiesConfig {
    fn default() -> Self {
        Self {
            strict_delay_filter: true,
            empty_response_penalty: DEFAULT_EMPTY_RESPONSE_PENALTY,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    /// Concurrent (proxy, url) measurements.
    pub parallelism: usize,
    /// Total budget per probe request.
    pub request_timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: DEFAULT_PROBE_INITIAL_DELAY_SECS,
            interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            parallelism: DEFAULT_PROBE_PARALLELISM,
            request_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl SpiderConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.session_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.scheduler.cooldown_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.scheduler.idle_sleep_secs)
    }
}

/// Load and validate a spider config from a YAML file.
pub async fn load(path: &Path) -> Result<SpiderConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SpiderError::Config(format!("read {}: {e}", path.display())))?;
    let config: SpiderConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| SpiderError::Config(format!("parse {}: {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SpiderConfig) -> Result<()> {
    if config.database_url.is_empty() {
        return Err(SpiderError::Config("database_url must not be empty".into()));
    }
    if config.child_command.trim().is_empty() {
        return Err(SpiderError::Config("child_command must not be empty".into()));
    }
    if config.sessions.max_sessions == 0 {
        return Err(SpiderError::Config("max_sessions must be at least 1".into()));
    }
    if config.probe.parallelism == 0 {
        return Err(SpiderError::Config("probe.parallelism must be at least 1".into()));
    }
    Ok(())
}
