//! RPC envelope and notification vocabulary shared by the server and every
//! transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Notification names pushed to clients.
pub mod events {
    pub const FEEDING_STARTED: &str = "event/device/scheduledfeedingstarted";
    pub const FEEDING_COMPLETE: &str = "event/device/feedingcomplete";
    pub const MOTOR_STUCK: &str = "event/device/warningmotorstuck";
    pub const NO_FOOD: &str = "event/device/warningnofood";
    pub const CLOCK_SYNCHRONIZED: &str = "event/device/clocksynchronized";
    pub const VIDEO_STREAM: &str = "event/camera/videostream";
    pub const PICTURE: &str = "event/camera/picture";
    pub const CAMERA_ERROR: &str = "event/camera/error";
    pub const CONTROL_GRANTED: &str = "event/server/controlgranted";
}

/// An RPC call as received from a client: `{id, method, args}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    /// `"<resource>/<method>"`
    pub method: String,
    pub args: Vec<Value>,
}

impl RpcRequest {
    /// Validate a raw envelope.
    ///
    /// `args` may be omitted (no arguments) or be a single non-array value,
    /// which is wrapped into a one-element sequence.
    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        let Value::Object(mut obj) = value else {
            return Err(RpcError::InvalidRequest(
                "request must be a JSON object".into(),
            ));
        };

        let id = obj
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::InvalidRequest("missing or non-numeric 'id'".into()))?;

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.is_empty() => m,
            _ => {
                return Err(RpcError::InvalidRequest(
                    "missing or non-string 'method'".into(),
                ))
            }
        };

        let args = match obj.remove("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
        };

        Ok(Self { id, method, args })
    }

    /// Best-effort id extraction from an envelope that failed validation, so
    /// the error can still be correlated by the client.
    pub fn id_hint(value: &Value) -> u64 {
        value.get("id").and_then(Value::as_u64).unwrap_or(0)
    }

    /// Split `method` into `(resource, method)`.
    pub fn resource_path(&self) -> Option<(&str, &str)> {
        self.method.split_once('/')
    }
}

/// Reply to an [`RpcRequest`]: `{id, data}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Failure { id: u64, error: String },
    Success { id: u64, data: Value },
}

impl RpcResponse {
    pub fn from_result(id: u64, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(data) => Self::Success { id, data },
            Err(e) => Self::Failure {
                id,
                error: e.to_string(),
            },
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } => *id,
        }
    }
}

/// Body of a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No data; also used as the end-of-transmission marker for byte streams.
    Empty,
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    /// Binary payloads are media chunks and are kept out of the logs.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::Json(v) => v.clone(),
            Self::Binary(b) => Value::from(b.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_parses_envelope() {
        let req = RpcRequest::from_value(json!({
            "id": 7,
            "method": "device/feedManually",
            "args": [2]
        }))
        .unwrap();

        assert_eq!(req.id, 7);
        assert_eq!(req.resource_path(), Some(("device", "feedManually")));
        assert_eq!(req.args, vec![json!(2)]);
    }

    #[test]
    fn test_request_normalizes_scalar_args() {
        let req = RpcRequest::from_value(json!({
            "id": 1,
            "method": "device/feedManually",
            "args": 3
        }))
        .unwrap();
        assert_eq!(req.args, vec![json!(3)]);

        let req = RpcRequest::from_value(json!({"id": 2, "method": "device/getSchedule"})).unwrap();
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_request_rejects_malformed_envelopes() {
        for bad in [
            json!("device/feedManually"),
            json!({"method": "device/feedManually"}),
            json!({"id": "x", "method": "device/feedManually"}),
            json!({"id": 1}),
            json!({"id": 1, "method": 5}),
        ] {
            let err = RpcRequest::from_value(bad).unwrap_err();
            assert!(matches!(err, RpcError::InvalidRequest(_)));
        }
    }

    #[test]
    fn test_response_shapes() {
        let ok = RpcResponse::from_result(4, Ok(json!([1, 2])));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"id": 4, "data": [1, 2]}));

        let null = RpcResponse::from_result(5, Ok(Value::Null));
        assert_eq!(serde_json::to_value(&null).unwrap(), json!({"id": 5, "data": null}));

        let err = RpcResponse::from_result(6, Err(RpcError::InvalidResource("x/y".into())));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"id": 6, "error": "Invalid RPC resource: x/y"})
        );
    }
}
