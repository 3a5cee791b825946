//! Default limits, intervals and RPC method names used across the agent.

use std::time::Duration;

/// Version reported when registering with the tracker
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default ceiling on simultaneously active leases
pub const DEFAULT_MAX_LEASES: usize = 5;

/// Default bound on a single provisioning attempt
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between pod phase polls while provisioning
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Number of pod phase polls before provisioning is abandoned
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 55;

/// Default RPC reply timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC ids wrap modulo this bound
pub const RPC_ID_BOUND: u64 = 2_000_000_000;

/// Maximum allowed frame size on the socket transport
pub const MAX_FRAME_SIZE: usize = 10_000_000;

/// Interval at which the dispatcher re-establishes its request subscription
pub const DEFAULT_RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(600);

/// Interval between tracker health checks
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Method name carried by subscription push messages
pub const SUBSCRIPTION_METHOD: &str = "tx_subscription";

pub const METHOD_LISTEN_REQUEST: &str = "worker_listenRequest";
pub const METHOD_UNLISTEN_REQUEST: &str = "worker_unlistenRequest";
pub const METHOD_REQUEST_RESPONSE: &str = "requestServiceResponse";
pub const METHOD_EXPIRE_CONTAINER: &str = "expireContainer";
pub const METHOD_REGISTER_CLUSTER: &str = "ain_registerCluster";
pub const METHOD_HEALTH_CHECK: &str = "ain_healthCheck";

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "LEASE_AGENT_CONFIG";

/// Environment variable carrying the hex signing key
pub const SECRET_KEY_ENV: &str = "LEASE_AGENT_SECRET_KEY";
