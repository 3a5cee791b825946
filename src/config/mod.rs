//! Agent configuration
//!
//! Configuration is read from a TOML file. Every field has a default so a
//! partial file (or none at all) yields a usable configuration; `validate`
//! is run before any collaborator is wired.

use crate::constants::{
    CONFIG_ENV, DEFAULT_CALL_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_LEASES,
    DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL, DEFAULT_PROVISION_TIMEOUT,
    DEFAULT_RESUBSCRIBE_INTERVAL, METHOD_EXPIRE_CONTAINER, METHOD_HEALTH_CHECK,
    METHOD_LISTEN_REQUEST, METHOD_REGISTER_CLUSTER, METHOD_REQUEST_RESPONSE,
    METHOD_UNLISTEN_REQUEST, SECRET_KEY_ENV,
};
use crate::error::{AgentError, AgentResult};
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static CLUSTER_NAME_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9-]*$").expect("cluster name pattern is a valid regex")
});

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub lease: LeaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub rpc: RpcConfig,
    pub dispatcher: DispatcherConfig,
    pub tracker: TrackerConfig,
    pub logging: LoggingConfig,
}

/// Identity of this cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Cluster name, used for routing requests and for resource domains
    pub cluster_name: String,
    /// Free-form description sent on registration
    pub description: String,
    /// Hex-encoded ed25519 secret key; falls back to `LEASE_AGENT_SECRET_KEY`
    pub secret_key: Option<String>,
    /// Advertised price per hour of lease time
    pub price_per_hour: f64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            cluster_name: "local-cluster".to_string(),
            description: String::new(),
            secret_key: None,
            price_per_hour: 0.0,
        }
    }
}

/// Lifecycle manager limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Ceiling on simultaneously registered leases
    pub max_leases: usize,
    /// Bound on a single provisioning call, in milliseconds
    pub provision_timeout_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_leases: DEFAULT_MAX_LEASES,
            provision_timeout_ms: DEFAULT_PROVISION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl LeaseConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }
}

/// Settings for the kubectl-backed orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// kubectl executable
    pub kubectl: String,
    /// Manifest template applied for every resource
    pub template_path: PathBuf,
    /// Container image
    pub image: String,
    /// Domain pattern; `*` is replaced by the resource id
    pub domain: Option<String>,
    /// Per-lease CPU limit in millicores
    pub cpu_limit_m: u64,
    /// Per-lease memory limit in MiB
    pub memory_limit_mi: u64,
    /// Per-lease GPU count, if GPUs are leased
    pub gpu_limit: Option<u32>,
    /// Per-lease storage in GiB
    pub storage_limit_gi: u64,
    /// Interval between pod phase polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Polls before provisioning gives up
    pub max_poll_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            template_path: PathBuf::from("kube_yaml/template.yaml"),
            image: String::new(),
            domain: None,
            cpu_limit_m: 1000,
            memory_limit_mi: 1024,
            gpu_limit: None,
            storage_limit_gi: 10,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// RPC endpoints. The socket transport is preferred when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// `host:port` of the persistent socket endpoint
    pub socket_address: Option<String>,
    /// URL of the request/response endpoint
    pub http_endpoint: Option<String>,
    /// Default reply timeout in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_address: None,
            http_endpoint: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Event dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds between forced re-subscriptions to the request queue
    pub resubscribe_interval_secs: u64,
    pub listen_method: String,
    pub unlisten_method: String,
    pub response_method: String,
    pub expiry_method: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            resubscribe_interval_secs: DEFAULT_RESUBSCRIBE_INTERVAL.as_secs(),
            listen_method: METHOD_LISTEN_REQUEST.to_string(),
            unlisten_method: METHOD_UNLISTEN_REQUEST.to_string(),
            response_method: METHOD_REQUEST_RESPONSE.to_string(),
            expiry_method: METHOD_EXPIRE_CONTAINER.to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_secs(self.resubscribe_interval_secs)
    }
}

/// Tracker registration and heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    /// Separate request/response endpoint for the tracker; the main RPC
    /// client is reused when unset
    pub endpoint: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub register_method: String,
    pub health_method: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            register_method: METHOD_REGISTER_CLUSTER.to_string(),
            health_method: METHOD_HEALTH_CHECK.to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (`error`, `warn`, `info`, `debug`, `trace`)
    pub level: String,
    /// Prefix lines with a timestamp
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> AgentResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: AgentConfig = toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.apply_env();
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the explicit path, then `LEASE_AGENT_CONFIG`, then the
    /// user config directory. Falls back to defaults when no file exists.
    pub fn resolve(explicit: Option<&Path>) -> AgentResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        if let Some(path) = default_config_path().filter(|p| p.exists()) {
            return Self::load(&path);
        }
        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if self.agent.secret_key.is_none() {
            if let Ok(key) = std::env::var(SECRET_KEY_ENV) {
                self.agent.secret_key = Some(key);
            }
        }
    }

    /// Domain pattern for provisioned resources
    pub fn domain(&self) -> String {
        self.orchestrator
            .domain
            .clone()
            .unwrap_or_else(|| format!("*.{}.local", self.agent.cluster_name))
    }

    /// Check the configuration is usable before wiring collaborators.
    pub fn validate(&self) -> AgentResult<()> {
        let name = &self.agent.cluster_name;
        if !CLUSTER_NAME_RULE.is_match(name) || name.len() < 3 || name.len() > 62 {
            return Err(AgentError::Config(format!(
                "cluster_name '{}' must be 3-62 characters of [a-zA-Z0-9-]",
                name
            )));
        }
        if self.lease.max_leases == 0 {
            return Err(AgentError::Config("max_leases must be greater than 0".into()));
        }
        if self.lease.provision_timeout_ms == 0 || self.rpc.call_timeout_ms == 0 {
            return Err(AgentError::Config("timeouts must be greater than 0".into()));
        }
        if self.dispatcher.resubscribe_interval_secs == 0 {
            return Err(AgentError::Config(
                "resubscribe_interval_secs must be greater than 0".into(),
            ));
        }
        if self.tracker.enabled && self.tracker.heartbeat_interval_ms == 0 {
            return Err(AgentError::Config(
                "heartbeat_interval_ms must be greater than 0".into(),
            ));
        }
        if self.rpc.socket_address.is_none() && self.rpc.http_endpoint.is_none() {
            return Err(AgentError::Config(
                "one of rpc.socket_address or rpc.http_endpoint is required".into(),
            ));
        }
        if self.orchestrator.image.is_empty() {
            return Err(AgentError::Config("orchestrator.image is required".into()));
        }
        if self.agent.price_per_hour.is_nan() || self.agent.price_per_hour < 0.0 {
            return Err(AgentError::Config("price_per_hour must be non-negative".into()));
        }
        Ok(())
    }
}

/// `<config dir>/lease_agent/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lease_agent").join("config.toml"))
}
