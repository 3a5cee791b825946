//! Orchestrator adapters
//!
//! The lifecycle manager never touches the cluster directly. It goes through
//! an [`OrchestratorAdapter`], which realises or removes the physical
//! resource for a resource id and reports whether another lease would fit.

pub mod kubectl;

use crate::error::AgentResult;
use async_trait::async_trait;

pub use kubectl::{KubectlOrchestrator, NodeUsage};

/// Trait for orchestrator backends
#[async_trait]
pub trait OrchestratorAdapter: Send + Sync {
    /// Create the backing resource and wait until it is ready.
    ///
    /// Returns `Ok(false)` when the resource never became ready within the
    /// backend's own attempt budget.
    async fn provision(&self, resource_id: &str, owner_address: &str) -> AgentResult<bool>;

    /// Delete the backing resource
    async fn deprovision(&self, resource_id: &str) -> AgentResult<()>;

    /// Whether the cluster can host one more lease
    async fn has_capacity(&self) -> bool;
}
