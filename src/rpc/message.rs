use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound JSON-RPC request. A missing `id` marks a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: None,
        }
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Params of a subscription push message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: Value,
    #[serde(default)]
    pub result: Value,
}

/// Any message received from the remote side
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Push for a subscription
    Push {
        subscription_id: String,
        result: Value,
    },
    /// Reply to a pending call
    Response {
        id: u64,
        outcome: Result<Value, RpcErrorObject>,
    },
    /// Anything else
    Other,
}

impl InboundMessage {
    pub fn classify(self) -> Inbound {
        if self.method.is_some() {
            let push = self
                .params
                .and_then(|p| serde_json::from_value::<SubscriptionParams>(p).ok());
            return match push {
                Some(params) => Inbound::Push {
                    subscription_id: subscription_key(&params.subscription),
                    result: params.result,
                },
                None => Inbound::Other,
            };
        }

        let id = match self.id.as_ref().and_then(response_id) {
            Some(id) => id,
            None => return Inbound::Other,
        };
        let outcome = match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        };
        Inbound::Response { id, outcome }
    }
}

/// Normalise a subscription id that may arrive as a string or number
pub fn subscription_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn response_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Inbound {
        serde_json::from_value::<InboundMessage>(value).unwrap().classify()
    }

    #[test]
    fn notification_omits_id() {
        let text = serde_json::to_string(&RpcRequest::notification("ping", json!({}))).unwrap();
        assert!(!text.contains("\"id\""));
        let text = serde_json::to_string(&RpcRequest::call(7, "ping", json!({}))).unwrap();
        assert!(text.contains("\"id\":7"));
    }

    #[test]
    fn classifies_push_and_responses() {
        assert_eq!(
            parse(json!({"method": "tx_subscription", "params": {"subscription": "s1", "result": {"a": 1}}})),
            Inbound::Push { subscription_id: "s1".into(), result: json!({"a": 1}) }
        );
        assert_eq!(
            parse(json!({"id": 3, "result": "ok"})),
            Inbound::Response { id: 3, outcome: Ok(json!("ok")) }
        );
        assert_eq!(
            parse(json!({"id": 4, "error": {"code": -32000, "message": "boom"}})),
            Inbound::Response {
                id: 4,
                outcome: Err(RpcErrorObject { code: -32000, message: "boom".into() })
            }
        );
        assert_eq!(parse(json!({"method": "hello", "params": [1]})), Inbound::Other);
    }

    #[test]
    fn numeric_subscription_ids_are_normalised() {
        assert_eq!(
            parse(json!({"method": "tx_subscription", "params": {"subscription": 12, "result": null}})),
            Inbound::Push { subscription_id: "12".into(), result: Value::Null }
        );
    }
}
