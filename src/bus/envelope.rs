//! Wire contracts: broadcast envelopes and RPC request/response bodies.
//!
//! Every body is UTF-8 JSON. Routing and correlation metadata travel in the
//! broker's message properties, never in these structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BusError, Result};

/// Broadcast message wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope<T = Value> {
    /// Publishing service.
    pub source: String,
    /// Message type name.
    pub path: String,
    pub data: T,
}

impl<T> BrokerEnvelope<T> {
    pub fn new(source: impl Into<String>, path: impl Into<String>, data: T) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
            data,
        }
    }
}

impl BrokerEnvelope {
    /// Decode `data` into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// RPC request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest<T = Value> {
    /// Calling service.
    pub source: String,
    /// Action name resolved by the responder.
    pub action: String,
    pub payload: T,
}

impl<T> RpcRequest<T> {
    pub fn new(source: impl Into<String>, action: impl Into<String>, payload: T) -> Self {
        Self {
            source: source.into(),
            action: action.into(),
            payload,
        }
    }
}

impl RpcRequest {
    /// Decode `payload` into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Structured RPC failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: u16,
    pub target: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl RpcError {
    pub fn new(code: u16, target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            code,
            target: target.into(),
            reason: reason.into(),
            msg: None,
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// No handler for the requested action.
    pub fn not_found() -> Self {
        Self::new(404, "not-found", "not-found")
    }

    /// Handler failed, or the exchange could not be understood.
    pub fn unknown() -> Self {
        Self::new(500, "unknown", "unknown")
    }

    /// No reply within the deadline.
    pub fn timeout() -> Self {
        Self::new(500, "timeout", "timeout")
    }

    /// The caller gave up before a reply arrived.
    pub fn cancelled() -> Self {
        Self::new(499, "cancelled", "cancelled")
    }

    /// The reply consumer went away before a reply arrived.
    pub fn disconnected() -> Self {
        Self::new(503, "transport", "disconnected")
    }

    pub fn is_timeout(&self) -> bool {
        self.reason == "timeout"
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.code, self.target, self.reason)?;
        if let Some(msg) = &self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

/// RPC response body. Exactly one of `data`/`err` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse<T = Value> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<RpcError>,
}

impl<T> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            err: None,
        }
    }

    pub fn error(err: RpcError) -> Self {
        Self {
            data: None,
            err: Some(err),
        }
    }

    pub fn not_found() -> Self {
        Self::error(RpcError::not_found())
    }

    pub fn unknown() -> Self {
        Self::error(RpcError::unknown())
    }

    pub fn timeout() -> Self {
        Self::error(RpcError::timeout())
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// `Ok(data)` unless the response carries an error.
    pub fn into_result(self) -> std::result::Result<Option<T>, RpcError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

impl RpcResponse {
    /// Reinterpret `data` as a concrete type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<RpcResponse<T>> {
        let data = self
            .data
            .map(T::deserialize)
            .transpose()
            .map_err(BusError::Decode)?;
        Ok(RpcResponse {
            data,
            err: self.err,
        })
    }
}

/// Serialize a body to JSON bytes.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(BusError::Encode)
}

/// Parse a JSON body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(BusError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = BrokerEnvelope::new("post", "NOTIFY_FOOD_LIKED", json!({"postId": "p1"}));
        let value: Value = serde_json::from_slice(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"source": "post", "path": "NOTIFY_FOOD_LIKED", "data": {"postId": "p1"}})
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let request = RpcRequest::new("post", "rpcGetUserById", json!({"_id": "u1"}));
        let value: Value = serde_json::from_slice(&encode(&request).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"source": "post", "action": "rpcGetUserById", "payload": {"_id": "u1"}})
        );
    }

    #[test]
    fn test_error_response_omits_data() {
        let response: RpcResponse = RpcResponse::not_found();
        let value: Value = serde_json::from_slice(&encode(&response).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"err": {"code": 404, "target": "not-found", "reason": "not-found"}})
        );
    }

    #[test]
    fn test_canonical_errors() {
        assert_eq!(RpcError::unknown(), RpcError::new(500, "unknown", "unknown"));
        assert_eq!(RpcError::timeout(), RpcError::new(500, "timeout", "timeout"));
        assert!(RpcError::timeout().is_timeout());
        assert!(!RpcError::cancelled().is_timeout());
        assert_eq!(RpcError::disconnected().code, 503);
    }

    #[test]
    fn test_decode_response_from_legacy_body() {
        let response: RpcResponse = decode(br#"{"data": {"_id": "u1", "name": "Alice"}}"#).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.data.unwrap()["name"], "Alice");
    }

    #[test]
    fn test_response_decode_typed() {
        #[derive(Deserialize)]
        struct User {
            name: String,
        }

        let response = RpcResponse::ok(json!({"name": "Alice"}));
        let typed: RpcResponse<User> = response.decode().unwrap();
        assert_eq!(typed.into_result().unwrap().unwrap().name, "Alice");
    }

    #[test]
    fn test_response_decode_type_mismatch() {
        let response = RpcResponse::ok(json!("not a number"));
        assert!(matches!(response.decode::<u32>(), Err(BusError::Decode(_))));
    }

    #[test]
    fn test_into_result_error() {
        let response: RpcResponse = RpcResponse::timeout();
        assert_eq!(response.into_result().unwrap_err(), RpcError::timeout());
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::unknown().with_msg("malformed response");
        assert_eq!(err.to_string(), "500 unknown/unknown: malformed response");
    }

    #[test]
    fn test_envelope_data_as() {
        #[derive(Deserialize)]
        struct Liked {
            #[serde(rename = "postId")]
            post_id: String,
        }

        let envelope = BrokerEnvelope::new("post", "NOTIFY_FOOD_LIKED", json!({"postId": "p1"}));
        assert_eq!(envelope.data_as::<Liked>().unwrap().post_id, "p1");
    }
}
