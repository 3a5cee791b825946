//! Fakes for exercising the agent without a cluster or a remote server.

use crate::dispatcher::{ControlRequest, RequestQueue, RequestStream, ResponseSink};
use crate::error::{AgentError, AgentResult};
use crate::orchestrator::OrchestratorAdapter;
use crate::rpc::{FrameSender, RequestChannel, RpcClient};
use crate::signing::SignedEnvelope;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// How [`MockOrchestrator::provision`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionBehavior {
    Ready,
    NeverReady,
    Fail,
}

/// In-memory orchestrator recording every call
pub struct MockOrchestrator {
    provision_delay: Mutex<Duration>,
    behavior: Mutex<ProvisionBehavior>,
    fail_deprovision: AtomicBool,
    capacity: AtomicBool,
    provisioned: Mutex<Vec<String>>,
    deprovisioned: Mutex<HashMap<String, usize>>,
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self {
            provision_delay: Mutex::new(Duration::ZERO),
            behavior: Mutex::new(ProvisionBehavior::Ready),
            fail_deprovision: AtomicBool::new(false),
            capacity: AtomicBool::new(true),
            provisioned: Mutex::new(Vec::new()),
            deprovisioned: Mutex::new(HashMap::new()),
        }
    }
}

impl MockOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_provision_delay(&self, delay: Duration) {
        *self.provision_delay.lock().unwrap() = delay;
    }

    pub fn set_behavior(&self, behavior: ProvisionBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_capacity(&self, available: bool) {
        self.capacity.store(available, Ordering::SeqCst);
    }

    pub fn fail_deprovision(&self, fail: bool) {
        self.fail_deprovision.store(fail, Ordering::SeqCst);
    }

    pub fn provision_calls(&self) -> usize {
        self.provisioned.lock().unwrap().len()
    }

    /// Deprovision calls for one resource id
    pub fn deprovision_count(&self, resource_id: &str) -> usize {
        self.deprovisioned
            .lock()
            .unwrap()
            .get(resource_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_deprovisions(&self) -> usize {
        self.deprovisioned.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl OrchestratorAdapter for MockOrchestrator {
    async fn provision(&self, resource_id: &str, _owner_address: &str) -> AgentResult<bool> {
        self.provisioned.lock().unwrap().push(resource_id.to_string());
        let delay = *self.provision_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            ProvisionBehavior::Ready => Ok(true),
            ProvisionBehavior::NeverReady => Ok(false),
            ProvisionBehavior::Fail => Err(AgentError::Unexpected("provision failed".into())),
        }
    }

    async fn deprovision(&self, resource_id: &str) -> AgentResult<()> {
        *self
            .deprovisioned
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_insert(0) += 1;
        if self.fail_deprovision.load(Ordering::SeqCst) {
            return Err(AgentError::Unexpected("deprovision failed".into()));
        }
        Ok(())
    }

    async fn has_capacity(&self) -> bool {
        self.capacity.load(Ordering::SeqCst)
    }
}

/// Response sink that keeps every envelope it receives
#[derive(Default)]
pub struct RecordingSink {
    outcomes: Mutex<Vec<SignedEnvelope>>,
    expiries: Mutex<Vec<SignedEnvelope>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every delivery fail after recording it
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn outcomes(&self) -> Vec<SignedEnvelope> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn expiries(&self) -> Vec<SignedEnvelope> {
        self.expiries.lock().unwrap().clone()
    }

    fn result(&self) -> AgentResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(AgentError::Transport("sink unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn send_outcome(&self, envelope: SignedEnvelope) -> AgentResult<()> {
        self.outcomes.lock().unwrap().push(envelope);
        self.result()
    }

    async fn send_expiry(&self, envelope: SignedEnvelope) -> AgentResult<()> {
        self.expiries.lock().unwrap().push(envelope);
        self.result()
    }
}

/// Request queue fed by the test. Each `subscribe` replaces the stream, and
/// [`push`](Self::push) delivers to the newest one.
#[derive(Default)]
pub struct ChannelRequestQueue {
    current: Mutex<Option<mpsc::UnboundedSender<AgentResult<ControlRequest>>>>,
    subscriptions: AtomicUsize,
    fail_subscribe: AtomicBool,
    closed: AtomicBool,
}

impl ChannelRequestQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a request; false if nobody is subscribed
    pub fn push(&self, request: ControlRequest) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.send(Ok(request)).is_ok())
            .unwrap_or(false)
    }

    /// End the current stream as if the connection dropped
    pub fn disconnect(&self) {
        self.current.lock().unwrap().take();
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestQueue for ChannelRequestQueue {
    async fn subscribe(&self) -> AgentResult<RequestStream> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("queue unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.current.lock().unwrap().take();
    }
}

/// Build a control request with the usual fields
pub fn control_request(
    request_id: &str,
    request_type: &str,
    resource_id: &str,
    price: Option<f64>,
    reserve_amount: Option<f64>,
) -> ControlRequest {
    ControlRequest {
        request_id: request_id.to_string(),
        request_type: request_type.to_string(),
        resource_id: resource_id.to_string(),
        owner_address: "0xabc".to_string(),
        price,
        reserve_amount,
    }
}

/// Outbound half of an in-memory socket
pub struct ChannelSocket {
    outbound: mpsc::UnboundedSender<Value>,
    closed: AtomicBool,
}

#[async_trait]
impl FrameSender for ChannelSocket {
    async fn send_frame(&self, frame: &Value) -> AgentResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("socket is closed".into()));
        }
        self.outbound
            .send(frame.clone())
            .map_err(|_| AgentError::Transport("peer gone".into()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Remote end of an in-memory socket, driven by the test
pub struct MockPeer {
    received: mpsc::UnboundedReceiver<Value>,
    inbound: Option<mpsc::UnboundedSender<Value>>,
}

impl MockPeer {
    /// Next frame the client sent
    pub async fn next_frame(&mut self) -> Value {
        self.received.recv().await.expect("client side dropped")
    }

    /// Next frame, if one is already queued
    pub fn try_next_frame(&mut self) -> Option<Value> {
        self.received.try_recv().ok()
    }

    pub fn send(&self, frame: Value) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(frame);
        }
    }

    pub fn reply(&self, id: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    pub fn reply_error(&self, id: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }));
    }

    pub fn push(&self, subscription: &str, result: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": crate::constants::SUBSCRIPTION_METHOD,
            "params": { "subscription": subscription, "result": result }
        }));
    }

    /// Drop the inbound side, as if the connection closed
    pub fn hang_up(&mut self) {
        self.inbound.take();
    }

    /// Answer every call with `respond(method, params)` until the client
    /// goes away. Notifications are recorded but not answered.
    pub fn serve<F>(mut self, respond: F) -> Arc<Mutex<Vec<Value>>>
    where
        F: Fn(&str, &Value) -> Value + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(frame) = self.received.recv().await {
                record.lock().unwrap().push(frame.clone());
                if let Some(id) = frame.get("id") {
                    let method = frame["method"].as_str().unwrap_or_default();
                    self.reply(id, respond(method, &frame["params"]));
                }
            }
        });
        seen
    }
}

/// RPC client wired to an in-memory peer
pub fn socket_client(default_timeout: Duration) -> (RpcClient, MockPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let socket = Arc::new(ChannelSocket {
        outbound: out_tx,
        closed: AtomicBool::new(false),
    });
    let client = RpcClient::with_socket(socket, in_rx, default_timeout);
    let peer = MockPeer {
        received: out_rx,
        inbound: Some(in_tx),
    };
    (client, peer)
}

/// Request channel answering from a queue of canned replies
#[derive(Default)]
pub struct ScriptedChannel {
    replies: Mutex<VecDeque<AgentResult<Value>>>,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, reply: AgentResult<Value>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestChannel for ScriptedChannel {
    async fn post(&self, body: &Value, _timeout: Duration) -> AgentResult<Value> {
        self.requests.lock().unwrap().push(body.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(reply) => reply,
            None => std::future::pending().await,
        }
    }
}
