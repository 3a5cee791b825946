use super::{lease_duration, ExpiryTimer, LeaseExpired, LeaseSnapshot, LeaseState, ResourceLease};
use crate::config::LeaseConfig;
use crate::error::{AgentError, AgentResult};
use crate::orchestrator::OrchestratorAdapter;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Upper bound for a timer deadline; longer leases are capped here.
const MAX_TIMER_SPAN: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

type LeaseMap = Arc<Mutex<HashMap<String, ResourceLease>>>;

/// Manages the in-memory registry of active leases.
///
/// The registry lock is held only across the check-and-mutate step of each
/// operation. Provisioning and termination run after the lock is released so
/// slow provisioning of one resource never blocks operations on another.
/// The capacity probe and the deletion of an orphan left by a lease
/// terminated mid-provisioning run under the lock.
pub struct LeaseManager {
    leases: LeaseMap,
    orchestrator: Arc<dyn OrchestratorAdapter>,
    max_leases: usize,
    provision_timeout: Duration,
    expiry_tx: broadcast::Sender<LeaseExpired>,
    next_timer_id: Arc<AtomicU64>,
    next_generation: AtomicU64,
}

impl LeaseManager {
    /// Create a new lease manager
    pub fn new(orchestrator: Arc<dyn OrchestratorAdapter>, config: &LeaseConfig) -> Self {
        let (expiry_tx, _) = broadcast::channel(256);
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            orchestrator,
            max_leases: config.max_leases,
            provision_timeout: config.provision_timeout(),
            expiry_tx,
            next_timer_id: Arc::new(AtomicU64::new(1)),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Receive a [`LeaseExpired`] event for every timer-driven termination
    pub fn subscribe_expiries(&self) -> broadcast::Receiver<LeaseExpired> {
        self.expiry_tx.subscribe()
    }

    /// Lease a new resource.
    ///
    /// A placeholder lease is registered before provisioning starts so a
    /// concurrent create for the same id fails with `AlreadyExists`. Any
    /// provisioning failure removes the placeholder and the possibly
    /// half-created backing resource.
    pub async fn create(
        &self,
        resource_id: &str,
        owner_address: &str,
        price: f64,
        reserve_amount: f64,
    ) -> AgentResult<()> {
        let reserved = lease_duration(price, reserve_amount)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut leases = self.leases.lock().await;
            if leases.contains_key(resource_id) {
                return Err(AgentError::AlreadyExists(resource_id.to_string()));
            }
            if !self.admits(leases.len()).await {
                return Err(AgentError::NotReady(format!(
                    "no capacity for {} ({} of {} leases in use)",
                    resource_id,
                    leases.len(),
                    self.max_leases
                )));
            }
            leases.insert(
                resource_id.to_string(),
                ResourceLease::pending(resource_id, owner_address, reserved, generation),
            );
        }
        debug!("[+] registered pending lease <resourceId: {}>", resource_id);

        let provisioned = match tokio::time::timeout(
            self.provision_timeout,
            self.orchestrator.provision(resource_id, owner_address),
        )
        .await
        {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(AgentError::Unexpected(format!(
                "backing resource for {} did not become ready",
                resource_id
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Timeout(format!(
                "provisioning {} exceeded {:?}",
                resource_id, self.provision_timeout
            ))),
        };

        if let Err(e) = provisioned {
            warn!("[-] failed to provision <resourceId: {}> - {}", resource_id, e);
            self.rollback(resource_id, generation).await;
            return Err(e);
        }

        self.activate(resource_id, generation).await
    }

    /// Terminate a lease and delete its backing resource.
    pub async fn terminate(&self, resource_id: &str) -> AgentResult<()> {
        let lease = {
            let mut leases = self.leases.lock().await;
            leases
                .remove(resource_id)
                .ok_or_else(|| AgentError::NotExists(resource_id.to_string()))?
        };
        if let Some(timer) = lease.timer {
            timer.cancel();
        }

        self.orchestrator
            .deprovision(resource_id)
            .await
            .map_err(|e| {
                AgentError::Unexpected(format!("failed to terminate {}: {}", resource_id, e))
            })?;
        info!("[+] terminated <resourceId: {}>", resource_id);
        Ok(())
    }

    /// Add `reserve_amount / price` seconds to a lease and rearm its timer.
    pub async fn extend(&self, resource_id: &str, price: f64, reserve_amount: f64) -> AgentResult<()> {
        let added = lease_duration(price, reserve_amount)?;

        let mut leases = self.leases.lock().await;
        let lease = leases
            .get_mut(resource_id)
            .ok_or_else(|| AgentError::NotExists(resource_id.to_string()))?;

        match lease.state {
            LeaseState::Pending => {
                lease.reserved = lease.reserved.saturating_add(added);
            }
            LeaseState::Active => {
                let deadline = lease
                    .deadline
                    .map(|d| capped_deadline(d, added))
                    .unwrap_or_else(|| capped_deadline(Instant::now(), added));
                lease.deadline = Some(deadline);
                lease.expires_at = Some(wall_clock_after(lease.expires_at.unwrap_or_else(Utc::now), added));
                if let Some(old) = lease.timer.take() {
                    old.cancel();
                }
                lease.timer = Some(self.arm_timer(resource_id, deadline));
            }
        }
        debug!("[+] extended <resourceId: {}> by {:?}", resource_id, added);
        Ok(())
    }

    /// Terminate every registered lease concurrently.
    pub async fn cleanup(&self) -> AgentResult<()> {
        let ids = self.resource_ids().await;
        let results = join_all(ids.iter().map(|id| self.terminate(id))).await;

        let failures: Vec<String> = ids
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(()) | Err(AgentError::NotExists(_)) => None,
                Err(e) => Some(format!("{}: {}", id, e)),
            })
            .collect();

        if failures.is_empty() {
            info!("[+] cleaned up {} leases", ids.len());
            Ok(())
        } else {
            Err(AgentError::Unexpected(format!(
                "cleanup failed for {} leases: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Whether a new lease would be admitted right now
    pub async fn is_ready(&self) -> bool {
        let count = self.leases.lock().await.len();
        self.admits(count).await
    }

    pub async fn lease_count(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn resource_ids(&self) -> Vec<String> {
        self.leases.lock().await.keys().cloned().collect()
    }

    pub async fn lease(&self, resource_id: &str) -> Option<LeaseSnapshot> {
        self.leases
            .lock()
            .await
            .get(resource_id)
            .map(ResourceLease::snapshot)
    }

    async fn admits(&self, count: usize) -> bool {
        count < self.max_leases && self.orchestrator.has_capacity().await
    }

    /// Promote the placeholder registered by the create holding
    /// `generation`. If that placeholder was terminated, the backing resource
    /// is deleted unless a newer lease already holds the id.
    async fn activate(&self, resource_id: &str, generation: u64) -> AgentResult<()> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(resource_id) {
            Some(lease) if lease.generation == generation && lease.state == LeaseState::Pending => {
                let deadline = capped_deadline(Instant::now(), lease.reserved);
                lease.deadline = Some(deadline);
                lease.expires_at = Some(wall_clock_after(Utc::now(), lease.reserved));
                lease.state = LeaseState::Active;
                lease.timer = Some(self.arm_timer(resource_id, deadline));
                info!(
                    "[+] lease active <resourceId: {}, owner: {}, duration: {:?}>",
                    resource_id, lease.owner_address, lease.reserved
                );
                return Ok(());
            }
            Some(_) => {
                warn!(
                    "[-] lease re-registered while provisioning <resourceId: {}>",
                    resource_id
                );
            }
            None => {
                warn!("[-] lease removed while provisioning <resourceId: {}>", resource_id);
                if let Err(e) = self.orchestrator.deprovision(resource_id).await {
                    error!("[-] failed to delete orphaned resource {} - {}", resource_id, e);
                }
            }
        }
        Err(AgentError::Unexpected(format!(
            "{} was terminated while provisioning",
            resource_id
        )))
    }

    /// Undo a failed create. Leaves the entry and its resource alone when
    /// the id now belongs to a newer lease.
    async fn rollback(&self, resource_id: &str, generation: u64) {
        let mut leases = self.leases.lock().await;
        let own = leases.get(resource_id).map(|lease| lease.generation == generation);
        match own {
            Some(true) => {
                leases.remove(resource_id);
                drop(leases);
            }
            Some(false) => {
                debug!("[-] rollback skipped, id re-registered <resourceId: {}>", resource_id);
                return;
            }
            None => {}
        }
        if let Err(e) = self.orchestrator.deprovision(resource_id).await {
            error!("[-] rollback failed to delete {} - {}", resource_id, e);
        }
    }

    /// Spawn the expiry timer for a lease. Must be called with the registry
    /// lock held so the timer cannot observe the lease before it is stored.
    fn arm_timer(&self, resource_id: &str, deadline: Instant) -> ExpiryTimer {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let leases = Arc::clone(&self.leases);
        let orchestrator = Arc::clone(&self.orchestrator);
        let expiry_tx = self.expiry_tx.clone();
        let resource_id = resource_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            expire(leases, orchestrator, expiry_tx, resource_id, id).await;
        });
        ExpiryTimer { id, handle }
    }
}

/// Timer-driven termination. Only acts if timer `timer_id` is still the one
/// armed on the lease.
async fn expire(
    leases: LeaseMap,
    orchestrator: Arc<dyn OrchestratorAdapter>,
    expiry_tx: broadcast::Sender<LeaseExpired>,
    resource_id: String,
    timer_id: u64,
) {
    let owner_address = {
        let mut leases = leases.lock().await;
        let current = leases
            .get(&resource_id)
            .and_then(|lease| lease.timer.as_ref())
            .map(|timer| timer.id);
        if current != Some(timer_id) {
            debug!("[-] stale expiry timer ignored <resourceId: {}>", resource_id);
            return;
        }
        match leases.remove(&resource_id) {
            Some(lease) => lease.owner_address,
            None => return,
        }
    };

    info!("[+] lease expired, terminate <resourceId: {}>", resource_id);
    if let Err(e) = orchestrator.deprovision(&resource_id).await {
        error!("[-] failed to delete expired resource {} - {}", resource_id, e);
    }

    let event = LeaseExpired {
        resource_id,
        owner_address,
        expired_at: Utc::now(),
    };
    if expiry_tx.send(event).is_err() {
        debug!("no expiry subscribers");
    }
}

fn capped_deadline(from: Instant, span: Duration) -> Instant {
    from + span.min(MAX_TIMER_SPAN)
}

fn wall_clock_after(from: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
