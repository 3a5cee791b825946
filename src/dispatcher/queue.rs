use super::request::ControlRequest;
use crate::error::{AgentError, AgentResult};
use crate::rpc::{handler, RpcClient};
use async_trait::async_trait;
use futures::Stream;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Stream of requests produced by one subscription
pub type RequestStream = Pin<Box<dyn Stream<Item = AgentResult<ControlRequest>> + Send>>;

/// Source of control requests.
///
/// Delivery is at least once: a request may be redelivered after the
/// subscription is re-established.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Open a fresh subscription, replacing any previous one
    async fn subscribe(&self) -> AgentResult<RequestStream>;

    /// Tear down the current subscription
    async fn close(&self) {}
}

/// Request queue backed by an RPC subscription
pub struct RpcRequestQueue {
    client: Arc<RpcClient>,
    cluster_key: String,
    listen_method: String,
    unlisten_method: String,
    current: Mutex<Option<String>>,
}

impl RpcRequestQueue {
    pub fn new(
        client: Arc<RpcClient>,
        cluster_key: impl Into<String>,
        listen_method: impl Into<String>,
        unlisten_method: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cluster_key: cluster_key.into(),
            listen_method: listen_method.into(),
            unlisten_method: unlisten_method.into(),
            current: Mutex::new(None),
        }
    }

    async fn release(&self, subscription_id: &str) {
        if let Err(e) = self
            .client
            .unsubscribe(&self.unlisten_method, subscription_id, None)
            .await
        {
            warn!("[-] failed to release subscription {} - {}", subscription_id, e);
        }
    }
}

#[async_trait]
impl RequestQueue for RpcRequestQueue {
    async fn subscribe(&self) -> AgentResult<RequestStream> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.release(&previous).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let on_push = handler(move |result: Value| {
            let tx = tx.clone();
            async move {
                let request = serde_json::from_value::<ControlRequest>(result).map_err(|e| {
                    AgentError::InvalidParams(format!("malformed control request: {}", e))
                });
                tx.send(request)
                    .map_err(|_| AgentError::Unexpected("request stream dropped".into()))
            }
        });

        let subscription_id = self
            .client
            .subscribe(
                &self.listen_method,
                on_push,
                json!({ "clusterKey": self.cluster_key }),
                None,
            )
            .await?;
        info!("[+] listening for requests <subscription: {}>", subscription_id);
        *current = Some(subscription_id);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) {
        if let Some(previous) = self.current.lock().await.take() {
            debug!("[-] closing request subscription {}", previous);
            self.release(&previous).await;
        }
    }
}
