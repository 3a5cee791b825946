//! JSON-RPC 2.0 client
//!
//! * `message` - wire types and inbound classification
//! * `transport` - length-prefixed TCP socket and HTTP channel
//! * `client` - `RpcClient` with id correlation, notifications and subscriptions

pub mod client;
pub mod message;
pub mod transport;

pub use client::{handler, RpcClient, SubscriptionHandler};
pub use message::{Inbound, InboundMessage, RpcErrorObject, RpcRequest, SubscriptionParams};
pub use transport::{FrameSender, HttpChannel, RequestChannel, TcpSocketTransport};
