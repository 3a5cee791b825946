//! kubectl-backed orchestrator
//!
//! Resources are realised by applying a manifest template with `kubectl`
//! and polling the pod phase until it reports `Running`.

use super::OrchestratorAdapter;
use crate::config::OrchestratorConfig;
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Free capacity of one cluster node, derived from `kubectl top node`
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUsage {
    pub name: String,
    /// Free CPU in millicores
    pub free_cpu_m: f64,
    /// Free memory in MiB
    pub free_memory_mi: f64,
    /// Allocatable GPUs
    pub gpu: u32,
}

/// Orchestrator that shells out to `kubectl`
pub struct KubectlOrchestrator {
    config: OrchestratorConfig,
    domain: String,
}

impl KubectlOrchestrator {
    /// Create a new kubectl orchestrator.
    ///
    /// `domain` is the resource domain pattern; its `*` is replaced by the
    /// resource id when rendering the manifest.
    pub fn new(config: OrchestratorConfig, domain: String) -> Self {
        Self { config, domain }
    }

    async fn run(&self, args: &[&str]) -> AgentResult<String> {
        let output = Command::new(&self.config.kubectl)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(AgentError::Unexpected(format!(
                "kubectl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn apply(&self, manifest: &str) -> AgentResult<()> {
        let mut child = Command::new(&self.config.kubectl)
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(manifest.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(AgentError::Unexpected(format!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn is_running(&self, resource_id: &str) -> bool {
        let selector = format!("app={}", resource_id);
        match self
            .run(&[
                "get",
                "pod",
                "-l",
                &selector,
                "-o",
                "jsonpath={.items[0].status.phase}",
            ])
            .await
        {
            Ok(phase) => phase.trim() == "Running",
            Err(e) => {
                debug!("[-] failed to get pod's status <resourceId: {}> - {}", resource_id, e);
                false
            }
        }
    }

    async fn available_nodes(&self) -> AgentResult<Vec<NodeUsage>> {
        let top = self.run(&["top", "node"]).await?;
        let mut nodes = parse_top_nodes(&top);

        if self.config.gpu_limit.is_some() {
            let gpus = self
                .run(&[
                    "get",
                    "nodes",
                    "-o=custom-columns=NAME:.metadata.name,GPU:.status.allocatable.nvidia\\.com/gpu",
                ])
                .await?;
            let allocatable = parse_gpu_allocatable(&gpus);
            for node in nodes.iter_mut() {
                node.gpu = allocatable.get(&node.name).copied().unwrap_or(0);
            }
        }
        Ok(nodes)
    }

    fn fits(&self, node: &NodeUsage) -> bool {
        node.free_cpu_m > self.config.cpu_limit_m as f64
            && node.free_memory_mi > self.config.memory_limit_mi as f64
            && self.config.gpu_limit.map_or(true, |limit| node.gpu >= limit)
    }
}

#[async_trait]
impl OrchestratorAdapter for KubectlOrchestrator {
    async fn provision(&self, resource_id: &str, owner_address: &str) -> AgentResult<bool> {
        let template = tokio::fs::read_to_string(&self.config.template_path)
            .await
            .map_err(|e| {
                AgentError::Config(format!(
                    "Failed to read manifest template {}: {}",
                    self.config.template_path.display(),
                    e
                ))
            })?;
        let manifest = render_manifest(&template, resource_id, &self.config, &self.domain);

        if let Err(e) = self.apply(&manifest).await {
            error!("[-] failed to create pod <resourceId: {}> - {}", resource_id, e);
            return Ok(false);
        }
        info!("[+] applied manifest <resourceId: {}, owner: {}>", resource_id, owner_address);

        for attempt in 0..self.config.max_poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;
            if self.is_running(resource_id).await {
                debug!("[+] pod running after {} polls <resourceId: {}>", attempt + 1, resource_id);
                return Ok(true);
            }
        }
        warn!(
            "[-] pod not running after {} polls <resourceId: {}>",
            self.config.max_poll_attempts, resource_id
        );
        Ok(false)
    }

    async fn deprovision(&self, resource_id: &str) -> AgentResult<()> {
        let selector = format!("app={}", resource_id);
        self.run(&[
            "delete",
            "svc,pod,deploy,VirtualService,PersistentVolumeClaim",
            "-l",
            &selector,
        ])
        .await?;
        Ok(())
    }

    async fn has_capacity(&self) -> bool {
        match self.available_nodes().await {
            Ok(nodes) => nodes.iter().any(|node| self.fits(node)),
            Err(e) => {
                error!("[-] failed to get ready for create {}", e);
                false
            }
        }
    }
}

/// Substitute the resource placeholders in a manifest template.
pub fn render_manifest(
    template: &str,
    resource_id: &str,
    config: &OrchestratorConfig,
    domain: &str,
) -> String {
    template
        .replace("{{CONTAINER_ID}}", resource_id)
        .replace("{{IMAGE}}", &config.image)
        .replace("{{DOMAIN}}", &domain.replacen('*', resource_id, 1))
        .replace("{{CPU_LIMIT}}", &format!("{}m", config.cpu_limit_m))
        .replace("{{MEMORY_LIMIT}}", &format!("{}Mi", config.memory_limit_mi))
        .replace("{{GPU_LIMIT}}", &config.gpu_limit.unwrap_or(0).to_string())
        .replace("{{STORAGE_LIMIT}}", &format!("{}Gi", config.storage_limit_gi))
}

/// Leading integer of a kubectl quantity such as `250m`, `2048Mi` or `12%`
fn leading_number(field: &str) -> Option<f64> {
    let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<f64>().ok()
}

/// Parse `kubectl top node` output into per-node free capacity.
///
/// Free capacity is extrapolated from usage and usage percentage. Nodes
/// reporting 0% usage cannot be extrapolated and are skipped.
pub fn parse_top_nodes(output: &str) -> Vec<NodeUsage> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            let cpu_used = leading_number(cols[1])?;
            let cpu_pct = leading_number(cols[2])?;
            let mem_used = leading_number(cols[3])?;
            let mem_pct = leading_number(cols[4])?;
            if cpu_pct == 0.0 || mem_pct == 0.0 {
                return None;
            }
            Some(NodeUsage {
                name: cols[0].to_string(),
                free_cpu_m: (100.0 - cpu_pct) * (cpu_used / cpu_pct),
                free_memory_mi: (100.0 - mem_pct) * (mem_used / mem_pct),
                gpu: 0,
            })
        })
        .collect()
}

/// Parse `NAME GPU` custom-columns output; `<none>` counts as zero.
pub fn parse_gpu_allocatable(output: &str) -> HashMap<String, u32> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let gpu = cols.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            Some((name.to_string(), gpu))
        })
        .collect()
}
