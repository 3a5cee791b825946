//! # Lease Agent
//!
//! Cluster-side agent that leases billed compute resources to remote
//! clients. Control requests arrive from a remote queue, are checked against
//! capacity and lease-time limits, are realised through an orchestrator, and
//! their signed outcomes are reported back over JSON-RPC.
//!
//! ## Core Components
//!
//! * `lease` - lease registry, expiry timers and admission control
//! * `dispatcher` - deduplicating request dispatch and outcome reporting
//! * `rpc` - JSON-RPC client over a framed TCP socket or HTTP
//! * `orchestrator` - backends that create and delete the physical resource
//! * `tracker` - cluster registration and health heartbeat
//! * `signing` - ed25519 signed envelopes
//! * `config` - TOML configuration
//! * `error` - error types and reportable codes

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod lease;
pub mod logging;
pub mod orchestrator;
pub mod rpc;
pub mod signing;
pub mod testing;
pub mod tracker;

pub use config::AgentConfig;
pub use dispatcher::{EventDispatcher, RpcRequestQueue, RpcResponseSink};
pub use error::{AgentError, AgentResult, ErrorKind};
pub use lease::{LeaseManager, LeaseState};
pub use orchestrator::{KubectlOrchestrator, OrchestratorAdapter};
pub use rpc::RpcClient;
pub use signing::{Ed25519Signer, MessageSigner, SignedEnvelope};
pub use tracker::Tracker;
