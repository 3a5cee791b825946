//! Event dispatcher
//!
//! Consumes control requests from a [`RequestQueue`], deduplicates them by
//! request id, drives the [`LeaseManager`](crate::lease::LeaseManager) and
//! reports signed outcomes to a [`ResponseSink`].

pub mod event_dispatcher;
pub mod queue;
pub mod request;
pub mod sink;

pub use event_dispatcher::{DispatchOutcome, DispatcherHandle, EventDispatcher};
pub use queue::{RequestQueue, RequestStream, RpcRequestQueue};
pub use request::{ControlRequest, RequestOutcome, RequestType};
pub use sink::{ResponseSink, RpcResponseSink};
