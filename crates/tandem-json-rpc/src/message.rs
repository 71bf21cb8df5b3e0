//! Wire message model.
//!
//! A [`Message`] is exactly one JSON-RPC 2.0 unit. Decoding never fails:
//! anything that does not have a valid JSON-RPC shape becomes
//! [`Message::Invalid`], which carries the `InvalidRequest` error that should
//! be sent back to the peer.

use serde_json::{Map, Value};

use crate::JSONRPC_VERSION;
use crate::error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject};
use crate::types::RequestId;

/// Parameters for a JSON-RPC request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestParams {
    /// Positional parameters as an array
    Array(Vec<Value>),
    /// Named parameters as an object
    Object(Map<String, Value>),
}

impl RequestParams {
    /// Get a parameter by name (for object params only)
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            RequestParams::Object(map) => map.get(key),
            RequestParams::Array(_) => None,
        }
    }

    /// Get a parameter by index (for array params only)
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            RequestParams::Array(vec) => vec.get(index),
            RequestParams::Object(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RequestParams::Object(map) => map.len(),
            RequestParams::Array(vec) => vec.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to a serde_json::Value for serialization
    pub fn to_value(&self) -> Value {
        match self {
            RequestParams::Object(map) => Value::Object(map.clone()),
            RequestParams::Array(arr) => Value::Array(arr.clone()),
        }
    }
}

impl From<Map<String, Value>> for RequestParams {
    fn from(map: Map<String, Value>) -> Self {
        RequestParams::Object(map)
    }
}

impl From<Vec<Value>> for RequestParams {
    fn from(vec: Vec<Value>) -> Self {
        RequestParams::Array(vec)
    }
}

/// Anything that can be used as the `params` of a call.
///
/// A JSON array or object maps onto the matching [`RequestParams`] shape,
/// `null` and `()` mean "no params", and any other scalar is sent as a
/// single positional argument.
pub trait IntoParams {
    fn into_params(self) -> Option<RequestParams>;
}

impl IntoParams for () {
    fn into_params(self) -> Option<RequestParams> {
        None
    }
}

impl IntoParams for RequestParams {
    fn into_params(self) -> Option<RequestParams> {
        Some(self)
    }
}

impl IntoParams for Option<RequestParams> {
    fn into_params(self) -> Option<RequestParams> {
        self
    }
}

impl IntoParams for Vec<Value> {
    fn into_params(self) -> Option<RequestParams> {
        Some(RequestParams::Array(self))
    }
}

impl IntoParams for Map<String, Value> {
    fn into_params(self) -> Option<RequestParams> {
        Some(RequestParams::Object(self))
    }
}

impl IntoParams for Value {
    fn into_params(self) -> Option<RequestParams> {
        match self {
            Value::Null => None,
            Value::Array(items) => Some(RequestParams::Array(items)),
            Value::Object(map) => Some(RequestParams::Object(map)),
            scalar => Some(RequestParams::Array(vec![scalar])),
        }
    }
}

/// A JSON-RPC request
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<RequestParams>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<RequestParams>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification (request without an id)
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<RequestParams>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<RequestParams>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC response
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self { id, result }
    }
}

/// A payload that could not be interpreted as JSON-RPC 2.0.
///
/// The raw text is kept verbatim so it can be forwarded unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    pub raw: String,
    pub error: JsonRpcError,
}

/// Discriminant of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
    Invalid,
}

/// One JSON-RPC unit
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Invalid(InvalidMessage),
}

impl Message {
    /// Create a request with the next id from the process-wide counter
    pub fn request(method: impl Into<String>, params: impl IntoParams) -> Self {
        Self::request_with_id(RequestId::next(), method, params)
    }

    pub fn request_with_id(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: impl IntoParams,
    ) -> Self {
        Message::Request(JsonRpcRequest::new(id.into(), method, params.into_params()))
    }

    pub fn notification(method: impl Into<String>, params: impl IntoParams) -> Self {
        Message::Notification(JsonRpcNotification::new(method, params.into_params()))
    }

    pub fn response(id: RequestId, result: impl Into<Value>) -> Self {
        Message::Response(JsonRpcResponse::new(id, result.into()))
    }

    pub fn error(
        id: Option<RequestId>,
        code: JsonRpcErrorCode,
        message: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Message::Error(JsonRpcError::new(
            id,
            JsonRpcErrorObject::new(code, message, data),
        ))
    }

    /// Build the success response to this request.
    ///
    /// Returns `None` when `self` is not a request.
    pub fn create_response(&self, result: impl Into<Value>) -> Option<Message> {
        match self {
            Message::Request(request) => Some(Message::response(request.id.clone(), result)),
            _ => None,
        }
    }

    /// Build an error response to this request (or to the id of an invalid payload).
    pub fn create_error_response(
        &self,
        code: JsonRpcErrorCode,
        message: Option<String>,
        data: Option<Value>,
    ) -> Option<Message> {
        match self {
            Message::Request(_) | Message::Invalid(_) => {
                Some(Message::error(self.id().cloned(), code, message, data))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Notification(_) => MessageKind::Notification,
            Message::Response(_) => MessageKind::Response,
            Message::Error(_) => MessageKind::Error,
            Message::Invalid(_) => MessageKind::Invalid,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Response(response) => Some(&response.id),
            Message::Error(error) => error.id.as_ref(),
            Message::Invalid(invalid) => invalid.error.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            _ => None,
        }
    }

    pub fn params(&self) -> Option<&RequestParams> {
        match self {
            Message::Request(request) => request.params.as_ref(),
            Message::Notification(notification) => notification.params.as_ref(),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Message::Response(response) => Some(&response.result),
            _ => None,
        }
    }

    pub fn error_object(&self) -> Option<&JsonRpcErrorObject> {
        match self {
            Message::Error(error) => Some(&error.error),
            Message::Invalid(invalid) => Some(&invalid.error.error),
            _ => None,
        }
    }

    /// Error code carried by this message; `None` means no error.
    pub fn error_code(&self) -> Option<JsonRpcErrorCode> {
        self.error_object().map(JsonRpcErrorObject::kind)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }

    /// Response or error: something that answers a request
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Response(_) | Message::Error(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Message::Invalid(_))
    }

    /// Decode one JSON document. Never fails.
    pub fn parse(bytes: &[u8]) -> Message {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from_value_with_raw(value, Some(bytes)),
            Err(err) => Message::Invalid(InvalidMessage {
                raw: String::from_utf8_lossy(bytes).into_owned(),
                error: JsonRpcError::new(
                    None,
                    JsonRpcErrorObject::invalid_request(Some(Value::String(err.to_string()))),
                ),
            }),
        }
    }

    /// Interpret an already-decoded JSON value
    pub fn from_value(value: Value) -> Message {
        Self::from_value_with_raw(value, None)
    }

    fn from_value_with_raw(value: Value, raw: Option<&[u8]>) -> Message {
        let mut object = match value {
            Value::Object(object) => object,
            other => return invalid(raw, &other, None, "message is not a JSON object"),
        };

        let id = match object.get("id") {
            None => Ok(None),
            Some(value) => RequestId::from_wire(value),
        };
        let has_id = object.contains_key("id");
        let extracted_id = id.clone().ok().flatten();

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return invalid_object(raw, object, extracted_id, "missing or unsupported \"jsonrpc\" version");
        }

        if let Some(method) = object.get("method") {
            let Some(method) = method.as_str().filter(|m| !m.is_empty()).map(str::to_string) else {
                return invalid_object(raw, object, extracted_id, "\"method\" must be a non-empty string");
            };
            if object.contains_key("result") || object.contains_key("error") {
                return invalid_object(raw, object, extracted_id, "a call cannot carry \"result\" or \"error\"");
            }
            let params = match object.remove("params") {
                None | Some(Value::Null) => None,
                Some(Value::Array(items)) => Some(RequestParams::Array(items)),
                Some(Value::Object(map)) => Some(RequestParams::Object(map)),
                Some(other) => {
                    object.insert("params".to_string(), other);
                    return invalid_object(raw, object, extracted_id, "\"params\" must be an array or an object");
                }
            };
            return match (has_id, id) {
                (false, _) => Message::Notification(JsonRpcNotification { method, params }),
                (true, Ok(Some(id))) => Message::Request(JsonRpcRequest { id, method, params }),
                (true, _) => invalid_object(raw, object, None, "request \"id\" must be a string or an integer"),
            };
        }

        match (object.contains_key("result"), object.contains_key("error")) {
            (true, false) => match id {
                Ok(Some(id)) => {
                    let result = object.remove("result").unwrap_or(Value::Null);
                    Message::Response(JsonRpcResponse { id, result })
                }
                _ => invalid_object(raw, object, None, "response \"id\" must be a string or an integer"),
            },
            (false, true) => {
                let Ok(id) = id else {
                    return invalid_object(raw, object, None, "error \"id\" must be a string, an integer or null");
                };
                let error = object
                    .get("error")
                    .cloned()
                    .and_then(|e| serde_json::from_value::<JsonRpcErrorObject>(e).ok());
                match error {
                    Some(error) => Message::Error(JsonRpcError { id, error }),
                    None => invalid_object(raw, object, id, "\"error\" must carry an integer code and a message"),
                }
            }
            _ => invalid_object(raw, object, extracted_id, "message is neither a call nor a response"),
        }
    }

    /// Encode as a JSON-RPC 2.0 object
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Request(request) => {
                object.insert("id".to_string(), request.id.to_value());
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), params.to_value());
                }
            }
            Message::Notification(notification) => {
                object.insert("method".to_string(), Value::String(notification.method.clone()));
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), params.to_value());
                }
            }
            Message::Response(response) => {
                object.insert("id".to_string(), response.id.to_value());
                object.insert("result".to_string(), response.result.clone());
            }
            Message::Error(error) => {
                object.insert("id".to_string(), id_or_null(error.id.as_ref()));
                object.insert("error".to_string(), error_to_value(&error.error));
            }
            Message::Invalid(invalid) => {
                return serde_json::from_str(&invalid.raw).unwrap_or_else(|_| {
                    object.insert("id".to_string(), id_or_null(invalid.error.id.as_ref()));
                    object.insert("error".to_string(), error_to_value(&invalid.error.error));
                    Value::Object(object)
                });
            }
        }
        Value::Object(object)
    }

    /// Encode to wire bytes. Invalid messages are written back verbatim.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Invalid(invalid) => invalid.raw.clone().into_bytes(),
            other => other.to_value().to_string().into_bytes(),
        }
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(request: JsonRpcRequest) -> Self {
        Message::Request(request)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notification: JsonRpcNotification) -> Self {
        Message::Notification(notification)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Message::Response(response)
    }
}

impl From<JsonRpcError> for Message {
    fn from(error: JsonRpcError) -> Self {
        Message::Error(error)
    }
}

impl std::str::FromStr for Message {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Message::parse(s.as_bytes()))
    }
}

fn id_or_null(id: Option<&RequestId>) -> Value {
    id.map(RequestId::to_value).unwrap_or(Value::Null)
}

fn error_to_value(error: &JsonRpcErrorObject) -> Value {
    serde_json::to_value(error).unwrap_or_default()
}

fn invalid_object(
    raw: Option<&[u8]>,
    object: Map<String, Value>,
    id: Option<RequestId>,
    reason: &str,
) -> Message {
    invalid(raw, &Value::Object(object), id, reason)
}

fn invalid(raw: Option<&[u8]>, value: &Value, id: Option<RequestId>, reason: &str) -> Message {
    Message::Invalid(InvalidMessage {
        raw: raw
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_else(|| value.to_string()),
        error: JsonRpcError::new(
            id,
            JsonRpcErrorObject::invalid_request(Some(Value::String(reason.to_string()))),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> Message {
        Message::parse(text.as_bytes())
    }

    #[test]
    fn test_parse_valid_request() {
        let message = parse(r#"{"jsonrpc": "2.0", "method": "test", "id": 1}"#);

        assert!(message.is_request());
        assert_eq!(message.method(), Some("test"));
        assert_eq!(message.id(), Some(&RequestId::Number(1)));
        assert!(message.params().is_none());
    }

    #[test]
    fn test_parse_valid_notification() {
        let message = parse(r#"{"jsonrpc": "2.0", "method": "notify", "params": {"a": 1}}"#);

        assert!(message.is_notification());
        assert_eq!(message.method(), Some("notify"));
        assert_eq!(message.id(), None);
        assert_eq!(message.params().unwrap().get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_null_id_is_not_a_notification() {
        let message = parse(r#"{"jsonrpc": "2.0", "method": "notify", "id": null}"#);
        assert_eq!(message.kind(), MessageKind::Invalid);
        assert_eq!(message.error_code(), Some(JsonRpcErrorCode::InvalidRequest));
    }

    #[test]
    fn test_missing_method_keeps_id() {
        let message = parse(r#"{"jsonrpc": "2.0", "id": 666}"#);

        assert!(message.is_invalid());
        assert_eq!(message.id(), Some(&RequestId::Number(666)));
        assert_eq!(message.error_code(), Some(JsonRpcErrorCode::InvalidRequest));
    }

    #[test]
    fn test_invalid_version() {
        let message = parse(r#"{"jsonrpc": "1.0", "method": "test", "id": "abc"}"#);

        assert!(message.is_invalid());
        assert_eq!(message.id(), Some(&RequestId::from("abc")));
    }

    #[test]
    fn test_malformed_shapes() {
        for text in [
            r#"[1, 2, 3]"#,
            r#"{"jsonrpc": "2.0", "method": 5, "id": 1}"#,
            r#"{"jsonrpc": "2.0", "method": "", "id": 1}"#,
            r#"{"jsonrpc": "2.0", "method": "m", "params": 3, "id": 1}"#,
            r#"{"jsonrpc": "2.0", "method": "m", "id": {"nested": true}}"#,
            r#"{"jsonrpc": "2.0", "result": 1, "error": {"code": 1, "message": "x"}, "id": 1}"#,
            r#"{"jsonrpc": "2.0", "error": "boom", "id": 1}"#,
            r#"{not json at all}"#,
        ] {
            let message = parse(text);
            assert!(message.is_invalid(), "expected invalid for {text}");
            assert_eq!(message.error_code(), Some(JsonRpcErrorCode::InvalidRequest));
        }
    }

    #[test]
    fn test_parse_error_with_null_id() {
        let message = parse(r#"{"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}"#);

        assert_eq!(message.kind(), MessageKind::Error);
        assert_eq!(message.id(), None);
        assert_eq!(message.error_code(), Some(JsonRpcErrorCode::ParseError));
    }

    #[test]
    fn test_response_has_no_error_code() {
        let message = parse(r#"{"jsonrpc": "2.0", "id": 3, "result": null}"#);

        assert_eq!(message.kind(), MessageKind::Response);
        assert_eq!(message.result(), Some(&Value::Null));
        assert_eq!(message.error_code(), None);
    }

    #[test]
    fn test_round_trip_preserves_params_shape() {
        let positional = Message::request_with_id(1i64, "service.sum", json!([1, 2, 3]));
        let named = Message::request_with_id(2i64, "service.sum", json!({"b": 2, "a": 1}));
        let notification = Message::notification("service.ping", ());
        let error = Message::error(
            Some(RequestId::from("x")),
            JsonRpcErrorCode::ServerError(-32001),
            Some("quota".to_string()),
            Some(json!({"left": 0})),
        );

        for message in [positional, named, notification, error] {
            assert_eq!(Message::parse(&message.encode()), message);
        }

        let named = Message::request_with_id(2i64, "service.sum", json!({"b": 2, "a": 1}));
        let encoded = String::from_utf8(named.encode()).unwrap();
        assert!(encoded.find("\"b\"").unwrap() < encoded.find("\"a\"").unwrap());
    }

    #[test]
    fn test_invalid_encodes_verbatim() {
        let raw = r#"{"jsonrpc": "2.0", "id": 666}"#;
        let message = parse(raw);
        assert_eq!(message.encode(), raw.as_bytes());
        assert_eq!(message.to_value(), json!({"jsonrpc": "2.0", "id": 666}));
    }

    #[test]
    fn test_scalar_params_are_wrapped() {
        let message = Message::request("service.singleParam", json!("single"));
        assert_eq!(
            message.params(),
            Some(&RequestParams::Array(vec![json!("single")]))
        );
    }

    #[test]
    fn test_create_response_and_error() {
        let request = Message::request_with_id(9i64, "service.noParam", ());

        let response = request.create_response(json!(true)).unwrap();
        assert_eq!(response.id(), request.id());
        assert_eq!(response.result(), Some(&json!(true)));

        let error = request
            .create_error_response(JsonRpcErrorCode::InvalidParams, None, None)
            .unwrap();
        assert_eq!(error.id(), request.id());
        assert_eq!(error.error_object().unwrap().message, "Invalid params");

        assert!(response.create_response(json!(1)).is_none());
    }

    #[test]
    fn test_notification_json_format() {
        let notification = Message::notification("ping", ());
        let json_str = String::from_utf8(notification.encode()).unwrap();

        // Should not contain an "id" field
        assert!(!json_str.contains("\"id\""));
        assert!(json_str.contains("\"jsonrpc\":\"2.0\""));
        assert!(json_str.contains("\"method\":\"ping\""));
    }
    #[test]
    fn test_error_json_format() {
        let plain = Message::error(Some(RequestId::Number(4)), JsonRpcErrorCode::MethodNotFound, None, None);
        assert_eq!(
            plain.to_value(),
            json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -32601, "message": "Method not found"}})
        );

        let detailed = Message::error(None, JsonRpcErrorCode::ServerError(-32001), Some("quota".into()), Some(json!([1])));
        assert_eq!(
            detailed.to_value(),
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32001, "message": "quota", "data": [1]}})
        );
    }
}
