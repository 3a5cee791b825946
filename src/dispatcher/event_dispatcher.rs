use super::queue::{RequestQueue, RequestStream};
use super::request::{ControlRequest, RequestOutcome, RequestType};
use super::sink::ResponseSink;
use crate::error::AgentResult;
use crate::lease::{LeaseExpired, LeaseManager};
use crate::signing::MessageSigner;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// What happened to one delivered request
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Same request id already in flight; nothing was done
    Discarded,
    /// Request was executed and its outcome reported
    Completed(RequestOutcome),
}

type InFlight = Arc<Mutex<HashSet<String>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request id from the in-flight set when dropped, so the id is
/// released even if request handling panics.
struct InFlightGuard {
    set: InFlight,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.request_id);
    }
}

/// Feeds control requests into the lease manager and reports outcomes.
pub struct EventDispatcher {
    manager: Arc<LeaseManager>,
    sink: Arc<dyn ResponseSink>,
    signer: Arc<dyn MessageSigner>,
    owner_key: String,
    in_flight: InFlight,
    resubscribe_interval: Duration,
}

impl EventDispatcher {
    pub fn new(
        manager: Arc<LeaseManager>,
        sink: Arc<dyn ResponseSink>,
        signer: Arc<dyn MessageSigner>,
        resubscribe_interval: Duration,
    ) -> Self {
        let owner_key = signer.address();
        Self {
            manager,
            sink,
            signer,
            owner_key,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            resubscribe_interval,
        }
    }

    /// Number of requests currently being handled
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn try_begin(&self, request_id: &str) -> Option<InFlightGuard> {
        if !lock(&self.in_flight).insert(request_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            request_id: request_id.to_string(),
        })
    }

    /// Handle one delivered request.
    ///
    /// A request whose id is already in flight is discarded. Otherwise it is
    /// executed, its outcome is signed and reported once, and the id is
    /// released whether or not delivery succeeded.
    pub async fn dispatch(&self, request: ControlRequest) -> DispatchOutcome {
        let _guard = match self.try_begin(&request.request_id) {
            Some(guard) => guard,
            None => {
                debug!("[-] duplicate request discarded <requestId: {}>", request.request_id);
                return DispatchOutcome::Discarded;
            }
        };
        debug!(
            "[+] requested <type: {}, requestId: {}, owner: {}>",
            request.request_type, request.request_id, request.owner_address
        );

        let result = self.execute(&request).await;
        match &result {
            Ok(()) => info!(
                "[+] succeeded to {} <resourceId: {}>",
                request.request_type, request.resource_id
            ),
            Err(e) => warn!(
                "[-] failed to {} <resourceId: {}> - {}",
                request.request_type, request.resource_id, e
            ),
        }

        let outcome = RequestOutcome::from_result(&self.owner_key, &request.request_id, &result);
        self.report_outcome(&outcome).await;
        DispatchOutcome::Completed(outcome)
    }

    async fn execute(&self, request: &ControlRequest) -> AgentResult<()> {
        let kind = request.kind()?;
        let resource_id = request.require_resource()?;
        match kind {
            RequestType::Create => {
                let (price, reserve) = request.require_payment()?;
                self.manager
                    .create(resource_id, &request.owner_address, price, reserve)
                    .await
            }
            RequestType::Extend => {
                let (price, reserve) = request.require_payment()?;
                self.manager.extend(resource_id, price, reserve).await
            }
            RequestType::Terminate => self.manager.terminate(resource_id).await,
        }
    }

    async fn report_outcome(&self, outcome: &RequestOutcome) {
        let payload = match serde_json::to_value(outcome) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[-] failed to encode outcome <requestId: {}> - {}", outcome.request_id(), e);
                return;
            }
        };
        let envelope = match self.signer.sign(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("[-] failed to sign outcome <requestId: {}> - {}", outcome.request_id(), e);
                return;
            }
        };
        if let Err(e) = self.sink.send_outcome(envelope).await {
            error!("[-] failed to report outcome <requestId: {}> - {}", outcome.request_id(), e);
        }
    }

    /// Sign and report a timer-driven termination
    pub async fn report_expiry(&self, expired: &LeaseExpired) {
        let payload = json!({
            "address": expired.owner_address,
            "containerId": expired.resource_id,
        });
        let envelope = match self.signer.sign(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("[-] failed to sign expiry <resourceId: {}> - {}", expired.resource_id, e);
                return;
            }
        };
        if let Err(e) = self.sink.send_expiry(envelope).await {
            error!("[-] failed to report expiry <resourceId: {}> - {}", expired.resource_id, e);
        }
    }

    /// Subscribe to `queue` and process requests until stopped.
    ///
    /// Failure to establish the first subscription is returned to the
    /// caller. Afterwards the subscription is re-established on every
    /// resubscribe tick, and a failed attempt keeps the previous stream.
    pub async fn start(self: Arc<Self>, queue: Arc<dyn RequestQueue>) -> AgentResult<DispatcherHandle> {
        let stream = queue.subscribe().await?;
        let expiries = self.manager.subscribe_expiries();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("[+] dispatcher started");
        let task = tokio::spawn(self.run(Arc::clone(&queue), stream, expiries, shutdown_rx));
        Ok(DispatcherHandle {
            shutdown: Some(shutdown_tx),
            task,
            queue,
        })
    }

    async fn run(
        self: Arc<Self>,
        queue: Arc<dyn RequestQueue>,
        mut stream: RequestStream,
        mut expiries: broadcast::Receiver<LeaseExpired>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut resubscribe = interval_at(
            Instant::now() + self.resubscribe_interval,
            self.resubscribe_interval,
        );
        resubscribe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiries_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                item = stream.next() => match item {
                    Some(Ok(request)) => {
                        let dispatcher = Arc::clone(&self);
                        tokio::spawn(async move {
                            dispatcher.dispatch(request).await;
                        });
                    }
                    Some(Err(e)) => warn!("[-] skipping undeliverable request - {}", e),
                    None => {
                        warn!("[-] request stream ended, waiting for resubscribe");
                        stream = Box::pin(futures::stream::pending::<AgentResult<ControlRequest>>());
                    }
                },
                _ = resubscribe.tick() => match queue.subscribe().await {
                    Ok(fresh) => {
                        debug!("[+] request subscription refreshed");
                        stream = fresh;
                    }
                    Err(e) => error!("[-] failed to refresh request subscription - {}", e),
                },
                expired = expiries.recv(), if expiries_open => match expired {
                    Ok(expired) => {
                        let dispatcher = Arc::clone(&self);
                        tokio::spawn(async move {
                            dispatcher.report_expiry(&expired).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[-] missed {} expiry notifications", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => expiries_open = false,
                },
            }
        }
        info!("[-] dispatcher stopped");
    }
}

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    queue: Arc<dyn RequestQueue>,
}

impl DispatcherHandle {
    /// Stop consuming requests and release the queue subscription.
    /// Requests already being handled run to completion.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("[-] dispatcher task failed - {}", e);
        }
        self.queue.close().await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
