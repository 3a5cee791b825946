use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};

/// Operation requested by a remote client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Extend,
    Terminate,
}

impl RequestType {
    /// Parse the wire name. `ADD` is accepted as an alias for create.
    pub fn parse(name: &str) -> AgentResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ADD" | "CREATE" => Ok(Self::Create),
            "EXTEND" => Ok(Self::Extend),
            "TERMINATE" => Ok(Self::Terminate),
            other => Err(AgentError::InvalidParams(format!(
                "unknown request type: {}",
                other
            ))),
        }
    }
}

/// A resource-control request as delivered by the request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    /// Assigned by the queue; may repeat across redelivery
    pub request_id: String,
    /// Raw type name, validated at dispatch time
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default, alias = "serviceId", alias = "containerId")]
    pub resource_id: String,
    #[serde(default, alias = "publicKey")]
    pub owner_address: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reserve_amount: Option<f64>,
}

impl ControlRequest {
    pub fn kind(&self) -> AgentResult<RequestType> {
        RequestType::parse(&self.request_type)
    }

    /// The resource id, which every request type needs
    pub fn require_resource(&self) -> AgentResult<&str> {
        if self.resource_id.trim().is_empty() {
            return Err(AgentError::InvalidParams("missing resourceId".into()));
        }
        Ok(&self.resource_id)
    }

    /// Price and reserve amount, needed by create and extend
    pub fn require_payment(&self) -> AgentResult<(f64, f64)> {
        match (self.price, self.reserve_amount) {
            (Some(price), Some(reserve)) => Ok((price, reserve)),
            _ => Err(AgentError::InvalidParams(
                "price and reserveAmount are required".into(),
            )),
        }
    }
}

/// Result of one request as reported to the response sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestOutcome {
    #[serde(rename_all = "camelCase")]
    Success {
        owner_key: String,
        request_id: String,
        success: u16,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        owner_key: String,
        request_id: String,
        err_code: u16,
        err_message: String,
    },
}

impl RequestOutcome {
    pub fn from_result(owner_key: &str, request_id: &str, result: &AgentResult<()>) -> Self {
        match result {
            Ok(()) => Self::Success {
                owner_key: owner_key.to_string(),
                request_id: request_id.to_string(),
                success: 0,
            },
            Err(e) => Self::Failure {
                owner_key: owner_key.to_string(),
                request_id: request_id.to_string(),
                err_code: e.code(),
                err_message: e.kind().message().to_string(),
            },
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Failure { request_id, .. } => request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Error code, `0` for success
    pub fn code(&self) -> u16 {
        match self {
            Self::Success { .. } => 0,
            Self::Failure { err_code, .. } => *err_code,
        }
    }
}
