//! Resource lease lifecycle
//!
//! * `ResourceLease` - registry entry for one leased resource
//! * `LeaseManager` - owns the registry, the expiry timers and admission

pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use manager::LeaseManager;

use crate::error::{AgentError, AgentResult};

/// Lifecycle state of a registered lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    /// Registered, backing resource still being provisioned
    Pending,
    /// Backing resource confirmed and expiry timer armed
    Active,
}

/// Armed expiry timer. `id` distinguishes a replaced timer from its
/// successor so a stale firing never removes a rearmed lease.
#[derive(Debug)]
pub(crate) struct ExpiryTimer {
    pub(crate) id: u64,
    pub(crate) handle: JoinHandle<()>,
}

impl ExpiryTimer {
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// Registry entry for one leased resource
#[derive(Debug)]
pub struct ResourceLease {
    pub resource_id: String,
    pub owner_address: String,
    pub state: LeaseState,
    /// Distinguishes this registration from a later one under the same id
    pub(crate) generation: u64,
    /// Lease time bought but not yet started; only meaningful while pending
    pub(crate) reserved: Duration,
    /// Monotonic deadline driving the timer
    pub(crate) deadline: Option<Instant>,
    /// Wall-clock expiry reported to callers
    pub expires_at: Option<DateTime<Utc>>,
    pub(crate) timer: Option<ExpiryTimer>,
}

impl ResourceLease {
    pub(crate) fn pending(
        resource_id: &str,
        owner_address: &str,
        reserved: Duration,
        generation: u64,
    ) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            owner_address: owner_address.to_string(),
            state: LeaseState::Pending,
            generation,
            reserved,
            deadline: None,
            expires_at: None,
            timer: None,
        }
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            resource_id: self.resource_id.clone(),
            owner_address: self.owner_address.clone(),
            state: self.state,
            expires_at: self.expires_at,
            remaining: self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
        }
    }
}

/// Read-only view of a lease
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseSnapshot {
    pub resource_id: String,
    pub owner_address: String,
    pub state: LeaseState,
    pub expires_at: Option<DateTime<Utc>>,
    /// Time left before the expiry timer fires
    pub remaining: Option<Duration>,
}

/// Published after a lease was terminated by its expiry timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseExpired {
    pub resource_id: String,
    pub owner_address: String,
    pub expired_at: DateTime<Utc>,
}

/// Convert a prepaid amount into lease time (`reserve_amount / price` seconds).
pub fn lease_duration(price: f64, reserve_amount: f64) -> AgentResult<Duration> {
    if !price.is_finite() || price <= 0.0 {
        return Err(AgentError::InvalidParams(format!(
            "price must be a positive number, got {}",
            price
        )));
    }
    if !reserve_amount.is_finite() || reserve_amount < 0.0 {
        return Err(AgentError::InvalidParams(format!(
            "reserveAmount must be a non-negative number, got {}",
            reserve_amount
        )));
    }
    Duration::try_from_secs_f64(reserve_amount / price)
        .map_err(|e| AgentError::InvalidParams(format!("lease duration out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_reserve_over_price() {
        assert_eq!(lease_duration(1.0, 3600.0).unwrap(), Duration::from_secs(3600));
        assert_eq!(lease_duration(2.0, 3600.0).unwrap(), Duration::from_secs(1800));
        assert_eq!(lease_duration(4.0, 2.0).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(matches!(lease_duration(0.0, 10.0), Err(AgentError::InvalidParams(_))));
        assert!(matches!(lease_duration(-1.0, 10.0), Err(AgentError::InvalidParams(_))));
        assert!(matches!(lease_duration(f64::NAN, 10.0), Err(AgentError::InvalidParams(_))));
    }

    #[test]
    fn rejects_negative_reserve() {
        assert!(lease_duration(1.0, -5.0).is_err());
    }
}
