use super::message::{Inbound, InboundMessage, RpcErrorObject, RpcRequest};
use super::transport::{FrameSender, HttpChannel, RequestChannel, TcpSocketTransport};
use crate::config::RpcConfig;
use crate::constants::RPC_ID_BOUND;
use crate::error::{AgentError, AgentResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Callback invoked with the `result` of every push for a subscription.
///
/// Pushes for one subscription are handled in order on a task of their own,
/// so a handler may itself await calls on the same client.
pub type SubscriptionHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, AgentResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`SubscriptionHandler`]
pub fn handler<F, Fut>(f: F) -> SubscriptionHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AgentResult<()>> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

/// Reply slot of an outstanding call. A subscribe call also carries the
/// handler, attached by the reader before the reply is released.
struct PendingCall {
    reply: oneshot::Sender<AgentResult<Value>>,
    on_push: Option<SubscriptionHandler>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the client and its reader task
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, PendingCall>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
    last_id: Mutex<u64>,
}

impl Shared {
    /// Allocate the next id and register its reply slot. Ids wrap at
    /// [`RPC_ID_BOUND`] and skip any id still awaiting a reply.
    fn register(&self, call: PendingCall) -> u64 {
        let mut pending = lock(&self.pending);
        let mut last_id = lock(&self.last_id);
        let mut id = (*last_id + 1) % RPC_ID_BOUND;
        while pending.contains_key(&id) {
            id = (id + 1) % RPC_ID_BOUND;
        }
        *last_id = id;
        pending.insert(id, call);
        id
    }

    fn evict(&self, id: u64) -> Option<PendingCall> {
        lock(&self.pending).remove(&id)
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, call)| call).collect();
        if !drained.is_empty() {
            warn!("[-] failing {} pending calls: {}", drained.len(), reason);
        }
        for call in drained {
            let _ = call.reply.send(Err(AgentError::Transport(reason.to_string())));
        }
    }

    /// Start the worker that feeds pushes for `subscription_id` to `handler`
    fn attach(&self, subscription_id: String, handler: SubscriptionHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let worker_id = subscription_id.clone();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                run_handler(&worker_id, Arc::clone(&handler), result).await;
            }
        });
        lock(&self.subscriptions).insert(subscription_id, tx);
    }

    fn route(&self, frame: Value) {
        let message = match serde_json::from_value::<InboundMessage>(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("[-] ignoring unparseable message: {}", e);
                return;
            }
        };

        match message.classify() {
            Inbound::Response { id, outcome } => match self.evict(id) {
                Some(call) => {
                    if let (Ok(result), Some(handler)) = (&outcome, call.on_push) {
                        if let Some(subscription_id) = subscription_id_of(result) {
                            self.attach(subscription_id, handler);
                        }
                    }
                    let _ = call.reply.send(outcome.map_err(call_error));
                }
                None => debug!("dropping reply for unknown or expired id {}", id),
            },
            Inbound::Push {
                subscription_id,
                result,
            } => {
                let delivered = lock(&self.subscriptions)
                    .get(&subscription_id)
                    .map(|worker| worker.send(result).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!("dropping push for unknown subscription {}", subscription_id);
                }
            }
            Inbound::Other => debug!("ignoring unsolicited message"),
        }
    }
}

/// Subscription id from a subscribe result: the result itself when it is a
/// string or number, otherwise its `subscriptionId` field.
fn subscription_id_of(result: &Value) -> Option<String> {
    match result {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => match other.get("subscriptionId") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
    }
}

async fn run_handler(subscription_id: &str, handler: SubscriptionHandler, result: Value) {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(result))) {
        Ok(future) => future,
        Err(_) => {
            error!("[-] subscription handler panicked <subscription: {}>", subscription_id);
            return;
        }
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("[-] subscription handler failed <subscription: {}> - {}", subscription_id, e),
        Err(_) => error!("[-] subscription handler panicked <subscription: {}>", subscription_id),
    }
}

fn call_error(error: RpcErrorObject) -> AgentError {
    AgentError::CallError {
        code: error.code,
        message: error.message,
    }
}

enum Transport {
    Socket {
        sender: Arc<dyn FrameSender>,
        reader: Mutex<Option<JoinHandle<()>>>,
    },
    Request(Arc<dyn RequestChannel>),
}

/// JSON-RPC 2.0 client with id correlation and subscriptions.
///
/// Over a socket every operation is available and pushes are routed to
/// subscription handlers. Over a request/response channel only `call` works.
pub struct RpcClient {
    shared: Arc<Shared>,
    transport: Transport,
    default_timeout: Duration,
}

impl RpcClient {
    /// Client over a persistent socket. `inbound` carries every frame the
    /// peer sends; it is consumed by a reader task until it closes.
    pub fn with_socket(
        sender: Arc<dyn FrameSender>,
        mut inbound: mpsc::UnboundedReceiver<Value>,
        default_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                reader_shared.route(frame);
            }
            reader_shared.fail_all("connection closed");
            info!("[-] rpc reader stopped");
        });

        Self {
            shared,
            transport: Transport::Socket {
                sender,
                reader: Mutex::new(Some(reader)),
            },
            default_timeout,
        }
    }

    /// Call-only client over a request/response channel
    pub fn with_channel(channel: Arc<dyn RequestChannel>, default_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            transport: Transport::Request(channel),
            default_timeout,
        }
    }

    /// Build a client from configuration, preferring the socket endpoint
    pub async fn connect(config: &RpcConfig) -> AgentResult<Self> {
        if let Some(addr) = &config.socket_address {
            let (sender, inbound) = TcpSocketTransport::connect(addr).await?;
            return Ok(Self::with_socket(sender, inbound, config.call_timeout()));
        }
        if let Some(endpoint) = &config.http_endpoint {
            info!("[+] using request/response endpoint {}", endpoint);
            return Ok(Self::with_channel(
                Arc::new(HttpChannel::new(endpoint.clone())),
                config.call_timeout(),
            ));
        }
        Err(AgentError::Config("no RPC endpoint configured".into()))
    }

    /// Whether pushes (and therefore subscriptions) are available
    pub fn supports_push(&self) -> bool {
        matches!(self.transport, Transport::Socket { .. })
    }

    /// Number of calls awaiting a reply
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Number of locally registered subscriptions
    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Invoke a remote method and wait for its result.
    ///
    /// `timeout` of `None` uses the client's default. A reply that arrives
    /// after the timeout is dropped.
    pub async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> AgentResult<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match &self.transport {
            Transport::Socket { sender, .. } => {
                self.call_socket(sender.as_ref(), method, params, timeout, None)
                    .await
            }
            Transport::Request(channel) => call_channel(channel.as_ref(), method, params, timeout).await,
        }
    }

    async fn call_socket(
        &self,
        sender: &dyn FrameSender,
        method: &str,
        params: Value,
        timeout: Duration,
        on_push: Option<SubscriptionHandler>,
    ) -> AgentResult<Value> {
        let (reply, rx) = oneshot::channel();
        let id = self.shared.register(PendingCall { reply, on_push });
        let frame = match serde_json::to_value(RpcRequest::call(id, method, params)) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.evict(id);
                return Err(e.into());
            }
        };
        if let Err(e) = sender.send_frame(&frame).await {
            self.shared.evict(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AgentError::Transport(format!(
                "connection closed before reply to {}",
                method
            ))),
            Err(_) => {
                self.shared.evict(id);
                Err(AgentError::Timeout(format!(
                    "no reply to {} (id {}) within {:?}",
                    method, id, timeout
                )))
            }
        }
    }

    /// Send a notification. Resolves once the frame is written.
    pub async fn notify(&self, method: &str, params: Value) -> AgentResult<()> {
        let sender = self.socket_sender()?;
        let frame = serde_json::to_value(RpcRequest::notification(method, params))?;
        sender.send_frame(&frame).await
    }

    /// Subscribe and route pushes for the returned subscription id to `handler`.
    ///
    /// The handler is attached as soon as the reply is read, so pushes sent
    /// right behind the reply are delivered.
    pub async fn subscribe(
        &self,
        method: &str,
        handler: SubscriptionHandler,
        params: Value,
        timeout: Option<Duration>,
    ) -> AgentResult<String> {
        let sender = self.socket_sender()?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = self
            .call_socket(sender, method, params, timeout, Some(handler))
            .await?;
        let subscription_id = subscription_id_of(&result).ok_or_else(|| {
            AgentError::Unexpected(format!(
                "{} returned no subscription id: {}",
                method, result
            ))
        })?;
        debug!("[+] subscribed <method: {}, subscription: {}>", method, subscription_id);
        Ok(subscription_id)
    }

    /// Drop the local handler for `subscription_id` and cancel it remotely
    pub async fn unsubscribe(
        &self,
        method: &str,
        subscription_id: &str,
        timeout: Option<Duration>,
    ) -> AgentResult<()> {
        if lock(&self.shared.subscriptions).remove(subscription_id).is_none() {
            return Err(AgentError::NotExists(format!(
                "subscription {}",
                subscription_id
            )));
        }
        self.call(method, json!({ "subscriptionId": subscription_id }), timeout)
            .await?;
        debug!("[-] unsubscribed <subscription: {}>", subscription_id);
        Ok(())
    }

    /// Close the transport. Every pending call fails.
    pub async fn close(&self) {
        if let Transport::Socket { sender, reader } = &self.transport {
            sender.close().await;
            if let Some(reader) = lock(reader).take() {
                reader.abort();
            }
        }
        lock(&self.shared.subscriptions).clear();
        self.shared.fail_all("client closed");
    }

    fn socket_sender(&self) -> AgentResult<&dyn FrameSender> {
        match &self.transport {
            Transport::Socket { sender, .. } => Ok(sender.as_ref()),
            Transport::Request(_) => Err(AgentError::Transport(
                "operation needs a persistent socket".into(),
            )),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Transport::Socket { reader, .. } = &self.transport {
            if let Some(reader) = lock(reader).take() {
                reader.abort();
            }
        }
    }
}

async fn call_channel(
    channel: &dyn RequestChannel,
    method: &str,
    params: Value,
    timeout: Duration,
) -> AgentResult<Value> {
    let body = serde_json::to_value(RpcRequest::call(1, method, params))?;
    let reply = tokio::time::timeout(timeout, channel.post(&body, timeout))
        .await
        .map_err(|_| AgentError::Timeout(format!("no reply to {} within {:?}", method, timeout)))??;

    let message: InboundMessage = serde_json::from_value(reply)?;
    match message.classify() {
        Inbound::Response { outcome, .. } => outcome.map_err(call_error),
        _ => Err(AgentError::Transport(format!(
            "malformed reply to {}",
            method
        ))),
    }
}
