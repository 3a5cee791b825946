//! Cluster registration and health heartbeat
//!
//! On start the agent registers itself with the tracker, advertising its
//! resource limits and price. A background loop then reports readiness on
//! a fixed interval until the returned handle is stopped.

use crate::config::AgentConfig;
use crate::constants::VERSION;
use crate::error::{AgentError, AgentResult};
use crate::lease::LeaseManager;
use crate::rpc::RpcClient;
use crate::signing::MessageSigner;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Resource limits advertised on registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSpec {
    pub cpu: u64,
    pub gpu: u32,
    pub memory: u64,
    pub storage: u64,
    pub image: String,
}

/// Identity advertised on registration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub address: String,
    pub cluster_name: String,
    pub description: String,
    pub price_per_hour: f64,
}

pub struct Tracker {
    client: Arc<RpcClient>,
    signer: Arc<dyn MessageSigner>,
    manager: Arc<LeaseManager>,
    spec: ClusterSpec,
    info: ClusterInfo,
    register_method: String,
    health_method: String,
    heartbeat_interval: Duration,
}

impl Tracker {
    pub fn new(
        client: Arc<RpcClient>,
        signer: Arc<dyn MessageSigner>,
        manager: Arc<LeaseManager>,
        config: &AgentConfig,
    ) -> Self {
        let spec = ClusterSpec {
            cpu: config.orchestrator.cpu_limit_m,
            gpu: config.orchestrator.gpu_limit.unwrap_or(0),
            memory: config.orchestrator.memory_limit_mi,
            storage: config.orchestrator.storage_limit_gi,
            image: config.orchestrator.image.clone(),
        };
        let info = ClusterInfo {
            address: signer.address(),
            cluster_name: config.agent.cluster_name.clone(),
            description: config.agent.description.clone(),
            price_per_hour: config.agent.price_per_hour,
        };
        Self {
            client,
            signer,
            manager,
            spec,
            info,
            register_method: config.tracker.register_method.clone(),
            health_method: config.tracker.health_method.clone(),
            heartbeat_interval: config.tracker.heartbeat_interval(),
        }
    }

    /// Register this cluster. The tracker must answer with result `0`.
    pub async fn register(&self) -> AgentResult<()> {
        let spec = serde_json::to_string(&self.spec)?;
        let info = serde_json::to_string(&self.info)?;
        let envelope = self.signer.sign(json!({
            "clusterKey": self.info.address,
            "version": VERSION,
            "clusterSpec": spec,
            "clusterInfo": info,
        }))?;
        let result = self
            .client
            .call(&self.register_method, serde_json::to_value(envelope)?, None)
            .await?;

        if result != json!(0) {
            return Err(AgentError::CallError {
                code: result.as_i64().unwrap_or(-1),
                message: format!("registration rejected: {}", result),
            });
        }
        info!("[+] registered cluster <name: {}>", self.info.cluster_name);
        Ok(())
    }

    /// Send one signed health report
    pub async fn heartbeat(&self) -> AgentResult<Value> {
        let ready = self.manager.is_ready().await;
        let envelope = self.signer.sign(json!({
            "clusterKey": self.info.address,
            "ready": ready,
        }))?;
        self.client
            .call(&self.health_method, serde_json::to_value(envelope)?, None)
            .await
    }

    /// Register, then report health every heartbeat interval
    pub async fn start(self: Arc<Self>) -> AgentResult<TrackerHandle> {
        self.register().await?;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.heartbeat().await {
                    Ok(_) => debug!("[+] health check sent"),
                    Err(e) => warn!("[-] health check failed - {}", e),
                }
            }
        });
        Ok(TrackerHandle { task })
    }
}

/// Handle to a running heartbeat loop
pub struct TrackerHandle {
    task: JoinHandle<()>,
}

impl TrackerHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}
