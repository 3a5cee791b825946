use crate::error::AgentResult;
use crate::rpc::RpcClient;
use crate::signing::SignedEnvelope;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Destination for signed reports.
///
/// Delivery is fire-and-forget from the dispatcher's side: an `Err` is
/// logged by the caller and never retried.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Report the outcome of one control request
    async fn send_outcome(&self, envelope: SignedEnvelope) -> AgentResult<()>;

    /// Report that a lease was terminated by its expiry timer
    async fn send_expiry(&self, envelope: SignedEnvelope) -> AgentResult<()>;
}

/// Response sink that forwards envelopes over the RPC client.
///
/// On a socket the envelope goes out as a notification; over a
/// request/response channel it is posted as a call and the reply ignored.
pub struct RpcResponseSink {
    client: Arc<RpcClient>,
    response_method: String,
    expiry_method: String,
}

impl RpcResponseSink {
    pub fn new(
        client: Arc<RpcClient>,
        response_method: impl Into<String>,
        expiry_method: impl Into<String>,
    ) -> Self {
        Self {
            client,
            response_method: response_method.into(),
            expiry_method: expiry_method.into(),
        }
    }

    async fn deliver(&self, method: &str, envelope: SignedEnvelope) -> AgentResult<()> {
        let params: Value = serde_json::to_value(envelope)?;
        if self.client.supports_push() {
            self.client.notify(method, params).await
        } else {
            self.client.call(method, params, None).await.map(|_| ())
        }
    }
}

#[async_trait]
impl ResponseSink for RpcResponseSink {
    async fn send_outcome(&self, envelope: SignedEnvelope) -> AgentResult<()> {
        self.deliver(&self.response_method, envelope).await
    }

    async fn send_expiry(&self, envelope: SignedEnvelope) -> AgentResult<()> {
        self.deliver(&self.expiry_method, envelope).await
    }
}
