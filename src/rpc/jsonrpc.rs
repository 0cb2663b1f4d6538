//! JSON-RPC 2.0 message model: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::session::ConnectionHandle;

pub const PROTOCOL_VERSION: &str = "2.0";

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Base of the implementation-reserved error range (-32000 to -32099).
pub const SERVER_ERROR: i64 = -32000;
pub const SERVER_ERROR_MAX: i64 = -32099;

/// Protocol-level failure, tagged with the JSON-RPC error code it maps to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    MethodNotFound(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    Internal(String),
    /// Reserved-range error; the code is `SERVER_ERROR - offset`, so each
    /// distinct offset yields a unique code within -32000..=-32099.
    #[error("{message}")]
    Server { offset: i64, message: String },
    /// Handler-defined error with an arbitrary code.
    #[error("{message}")]
    Custom { code: i64, message: String },
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => PARSE_ERROR,
            RpcError::InvalidRequest(_) => INVALID_REQUEST,
            RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => INVALID_PARAMS,
            RpcError::Internal(_) => INTERNAL_ERROR,
            RpcError::Server { offset, .. } => SERVER_ERROR - offset,
            RpcError::Custom { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RpcError::Parse(m)
            | RpcError::InvalidRequest(m)
            | RpcError::MethodNotFound(m)
            | RpcError::InvalidParams(m)
            | RpcError::Internal(m)
            | RpcError::Server { message: m, .. }
            | RpcError::Custom { message: m, .. } => m,
        }
    }
}

/// Validate the fields shared by every JSON-RPC document: `jsonrpc` must
/// exist, be a string, and equal "2.0"; `id`, if present, must be null, a
/// string, or an integer.
pub fn validate_envelope(doc: &Value) -> Result<(), RpcError> {
    match doc.get("jsonrpc") {
        None => return Err(RpcError::Parse("'jsonrpc' is missing".into())),
        Some(Value::String(v)) if v == PROTOCOL_VERSION => {}
        Some(Value::String(_)) => {
            return Err(RpcError::Parse(format!(
                "'jsonrpc' has the wrong value, must be '{}'",
                PROTOCOL_VERSION
            )))
        }
        Some(_) => return Err(RpcError::Parse("'jsonrpc' has wrong type".into())),
    }

    if let Some(id) = doc.get("id") {
        if !is_valid_id(id) {
            return Err(RpcError::Parse("'id' has wrong type".into()));
        }
    }

    Ok(())
}

/// Whether a value is usable as a JSON-RPC identifier: null, a string, or
/// an integer.
pub(crate) fn is_valid_id(id: &Value) -> bool {
    id.is_null() || id.is_string() || id.is_i64() || id.is_u64()
}

/// A JSON-RPC request. No id means the request is a notification and no
/// reply is ever produced for it.
#[derive(Debug, Clone, Default)]
pub struct Request {
    id: Option<Value>,
    method: String,
    params: Option<Value>,
    client: Option<ConnectionHandle>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    /// Decode and validate a wire document.
    pub fn from_value(doc: &Value) -> Result<Self, RpcError> {
        validate_envelope(doc)?;

        let method = match doc.get("method") {
            None => return Err(RpcError::Parse("'method' is missing".into())),
            Some(Value::String(m)) => m.clone(),
            Some(_) => return Err(RpcError::Parse("'method' has wrong type".into())),
        };

        let params = match doc.get("params") {
            None => None,
            Some(p) if p.is_array() || p.is_object() => Some(p.clone()),
            Some(_) => return Err(RpcError::Parse("'params' has wrong type".into())),
        };

        Ok(Self {
            id: doc.get("id").cloned(),
            method,
            params,
            client: None,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("jsonrpc".into(), PROTOCOL_VERSION.into());
        if let Some(id) = &self.id {
            doc.insert("id".into(), id.clone());
        }
        doc.insert("method".into(), self.method.clone().into());
        if let Some(params) = &self.params {
            doc.insert("params".into(), params.clone());
        }
        Value::Object(doc)
    }

    pub fn set_id(&mut self, id: Value) -> &mut Self {
        self.id = Some(id);
        self
    }

    pub fn clear_id(&mut self) -> &mut Self {
        self.id = None;
        self
    }

    pub fn set_params(&mut self, params: Value) -> &mut Self {
        self.params = Some(params);
        self
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// The connection this request arrived on, when decoded off the wire.
    pub fn client(&self) -> Option<&ConnectionHandle> {
        self.client.as_ref()
    }

    pub(crate) fn with_client(mut self, handle: ConnectionHandle) -> Self {
        self.client = Some(handle);
        self
    }
}

/// The error member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Result(Value),
    Error(ErrorObject),
}

/// A JSON-RPC response. The body is either a result or an error, never
/// both; `compile` refuses to emit a document until exactly one is set and
/// an id is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    id: Option<Value>,
    body: Option<Body>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and validate a wire document.
    pub fn from_value(doc: &Value) -> Result<Self, RpcError> {
        validate_envelope(doc)?;

        let id = doc
            .get("id")
            .cloned()
            .ok_or_else(|| RpcError::Parse("'id' is missing".into()))?;

        let body = match (doc.get("result"), doc.get("error")) {
            (Some(_), Some(_)) => {
                return Err(RpcError::Parse("'result' and 'error' can't coexist".into()))
            }
            (None, None) => {
                return Err(RpcError::Parse("'result' and 'error' are missing".into()))
            }
            (Some(result), None) => Body::Result(result.clone()),
            (None, Some(error)) => {
                let obj = error
                    .as_object()
                    .ok_or_else(|| RpcError::Parse("'error' has wrong type".into()))?;
                match obj.get("code") {
                    None => return Err(RpcError::Parse("'error.code' is missing".into())),
                    Some(c) if c.is_i64() || c.is_u64() => {}
                    Some(_) => return Err(RpcError::Parse("'error.code' has wrong type".into())),
                }
                match obj.get("message") {
                    None => return Err(RpcError::Parse("'error.message' is missing".into())),
                    Some(Value::String(_)) => {}
                    Some(_) => {
                        return Err(RpcError::Parse("'error.message' has wrong type".into()))
                    }
                }
                Body::Error(
                    serde_json::from_value(error.clone())
                        .map_err(|e| RpcError::Parse(format!("'error' has wrong type: {}", e)))?,
                )
            }
        };

        Ok(Self { id: Some(id), body: Some(body) })
    }

    pub fn set_id(&mut self, id: Value) -> &mut Self {
        self.id = Some(id);
        self
    }

    /// Inherit the request's identifier verbatim, including a null id. A
    /// notification (no id) leaves the response id untouched.
    pub fn copy_id(&mut self, request: &Request) -> &mut Self {
        if let Some(id) = request.id() {
            self.id = Some(id.clone());
        }
        self
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// Set a success result, clearing any previously set error.
    pub fn set_result(&mut self, value: Value) -> &mut Self {
        self.body = Some(Body::Result(value));
        self
    }

    /// Set an error, clearing any previously set result.
    pub fn set_error(&mut self, code: i64, message: impl Into<String>) -> &mut Self {
        self.body = Some(Body::Error(ErrorObject {
            code,
            message: message.into(),
            data: None,
        }));
        self
    }

    pub fn set_error_with_data(
        &mut self,
        code: i64,
        message: impl Into<String>,
        data: Value,
    ) -> &mut Self {
        self.body = Some(Body::Error(ErrorObject {
            code,
            message: message.into(),
            data: Some(data),
        }));
        self
    }

    pub fn set_rpc_error(&mut self, error: &RpcError) -> &mut Self {
        self.set_error(error.code(), error.message())
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.body {
            Some(Body::Result(v)) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.body {
            Some(Body::Error(e)) => Some(e),
            _ => None,
        }
    }

    /// Validate and emit the wire document.
    pub fn compile(&self) -> Result<Value, RpcError> {
        let id = self
            .id
            .as_ref()
            .ok_or_else(|| RpcError::Parse("'id' is missing".into()))?;
        if !is_valid_id(id) {
            return Err(RpcError::Parse("'id' has wrong type".into()));
        }
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| RpcError::Parse("'result' and 'error' are missing".into()))?;

        let mut doc = Map::new();
        doc.insert("jsonrpc".into(), PROTOCOL_VERSION.into());
        doc.insert("id".into(), id.clone());
        match body {
            Body::Result(v) => {
                doc.insert("result".into(), v.clone());
            }
            Body::Error(e) => {
                doc.insert(
                    "error".into(),
                    serde_json::to_value(e)
                        .map_err(|e| RpcError::Internal(e.to_string()))?,
                );
            }
        }
        Ok(Value::Object(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_accepts_exact_protocol_version() {
        assert!(validate_envelope(&json!({"jsonrpc": "2.0"})).is_ok());
    }

    #[test]
    fn envelope_rejects_missing_version() {
        let err = validate_envelope(&json!({"method": "ping"})).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
        assert!(err.message().contains("missing"));
    }

    #[test]
    fn envelope_rejects_wrong_version_value() {
        let err = validate_envelope(&json!({"jsonrpc": "1.0"})).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
    }

    #[test]
    fn envelope_rejects_non_string_version() {
        let err = validate_envelope(&json!({"jsonrpc": 2.0})).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
        assert!(err.message().contains("wrong type"));
    }

    #[test]
    fn envelope_id_may_be_null_string_or_integer() {
        for id in [json!(null), json!("abc"), json!(7), json!(-7)] {
            assert!(validate_envelope(&json!({"jsonrpc": "2.0", "id": id})).is_ok());
        }
    }

    #[test]
    fn envelope_rejects_fractional_or_structured_id() {
        for id in [json!(1.5), json!([1]), json!({"a": 1}), json!(true)] {
            let err = validate_envelope(&json!({"jsonrpc": "2.0", "id": id})).unwrap_err();
            assert_eq!(err.code(), PARSE_ERROR);
        }
    }

    #[test]
    fn request_decodes_full_document() {
        let req = Request::from_value(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "version",
            "params": {"version": "1.2.3"}
        }))
        .expect("should decode");
        assert_eq!(req.id(), Some(&json!(1)));
        assert_eq!(req.method(), "version");
        assert_eq!(req.params().unwrap()["version"], "1.2.3");
    }

    #[test]
    fn request_without_id_is_notification() {
        let req =
            Request::from_value(&json!({"jsonrpc": "2.0", "method": "ping"})).expect("decode");
        assert!(!req.has_id());
    }

    #[test]
    fn request_null_id_is_not_a_notification() {
        let req = Request::from_value(&json!({"jsonrpc": "2.0", "id": null, "method": "ping"}))
            .expect("decode");
        assert!(req.has_id());
        assert_eq!(req.id(), Some(&Value::Null));
    }

    #[test]
    fn request_rejects_missing_method() {
        let err = Request::from_value(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
        assert!(err.message().contains("method"));
    }

    #[test]
    fn request_rejects_non_string_method() {
        let err =
            Request::from_value(&json!({"jsonrpc": "2.0", "id": 1, "method": 5})).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
    }

    #[test]
    fn request_rejects_scalar_params() {
        let err = Request::from_value(
            &json!({"jsonrpc": "2.0", "id": 1, "method": "m", "params": "nope"}),
        )
        .unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
        assert!(err.message().contains("params"));
    }

    #[test]
    fn request_accepts_array_params() {
        let req = Request::from_value(
            &json!({"jsonrpc": "2.0", "id": 1, "method": "m", "params": [1, 2]}),
        )
        .expect("decode");
        assert!(req.params().unwrap().is_array());
    }

    #[test]
    fn request_to_value_omits_absent_fields() {
        let mut req = Request::new("status.changed");
        req.set_params(json!({"on": true}));
        let doc = req.to_value();
        assert_eq!(doc["jsonrpc"], "2.0");
        assert_eq!(doc["method"], "status.changed");
        assert!(doc.get("id").is_none());
        assert_eq!(doc["params"]["on"], true);
    }

    #[test]
    fn response_requires_exactly_one_outcome() {
        let resp = Response::new();
        let err = resp.compile().unwrap_err();
        assert!(err.message().contains("missing"));

        let mut resp = Response::new();
        resp.set_id(json!(1));
        assert!(resp.compile().is_err());
        resp.set_result(json!(42));
        assert_eq!(resp.compile().unwrap()["result"], 42);
    }

    #[test]
    fn set_result_clears_error_and_vice_versa() {
        let mut resp = Response::new();
        resp.set_error(INTERNAL_ERROR, "boom");
        resp.set_result(json!("ok"));
        assert!(resp.error().is_none());
        assert_eq!(resp.result(), Some(&json!("ok")));

        resp.set_error(INVALID_PARAMS, "bad");
        assert!(resp.result().is_none());
        assert_eq!(resp.error().unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn copy_id_round_trips_including_null() {
        let req = Request::from_value(&json!({"jsonrpc": "2.0", "id": null, "method": "m"}))
            .expect("decode");
        let mut resp = Response::new();
        resp.copy_id(&req);
        assert_eq!(resp.id(), Some(&Value::Null));

        let req = Request::from_value(&json!({"jsonrpc": "2.0", "id": "a", "method": "m"}))
            .expect("decode");
        let mut resp = Response::new();
        resp.copy_id(&req);
        assert_eq!(resp.id(), Some(&json!("a")));
    }

    #[test]
    fn copy_id_from_notification_leaves_id_absent() {
        let req =
            Request::from_value(&json!({"jsonrpc": "2.0", "method": "m"})).expect("decode");
        let mut resp = Response::new();
        resp.copy_id(&req);
        assert!(!resp.has_id());
        assert!(resp.compile().is_err());
    }

    #[test]
    fn compile_requires_id() {
        let mut resp = Response::new();
        resp.set_result(json!(1));
        let err = resp.compile().unwrap_err();
        assert!(err.message().contains("'id' is missing"));
    }

    #[test]
    fn compile_rejects_invalid_id_type() {
        let mut resp = Response::new();
        resp.set_id(json!([1]));
        resp.set_result(json!(1));
        let err = resp.compile().unwrap_err();
        assert!(err.message().contains("'id' has wrong type"));
    }

    #[test]
    fn compile_emits_error_object() {
        let mut resp = Response::new();
        resp.set_id(json!(3));
        resp.set_error_with_data(SERVER_ERROR, "domain failure", json!({"detail": 1}));
        let doc = resp.compile().unwrap();
        assert_eq!(doc["error"]["code"], SERVER_ERROR);
        assert_eq!(doc["error"]["message"], "domain failure");
        assert_eq!(doc["error"]["data"]["detail"], 1);
    }

    #[test]
    fn response_from_value_accepts_success() {
        let resp = Response::from_value(&json!({"jsonrpc": "2.0", "id": 1, "result": {"a": 1}}))
            .expect("decode");
        assert_eq!(resp.result().unwrap()["a"], 1);
    }

    #[test]
    fn response_from_value_requires_id() {
        let err =
            Response::from_value(&json!({"jsonrpc": "2.0", "result": 1})).unwrap_err();
        assert!(err.message().contains("'id' is missing"));
    }

    #[test]
    fn response_from_value_rejects_both_outcomes() {
        let err = Response::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "result": 1,
            "error": {"code": -32000, "message": "x"}
        }))
        .unwrap_err();
        assert!(err.message().contains("can't coexist"));
    }

    #[test]
    fn response_from_value_validates_error_object() {
        let err = Response::from_value(&json!({"jsonrpc": "2.0", "id": 1, "error": "boom"}))
            .unwrap_err();
        assert!(err.message().contains("'error' has wrong type"));

        let err = Response::from_value(
            &json!({"jsonrpc": "2.0", "id": 1, "error": {"message": "x"}}),
        )
        .unwrap_err();
        assert!(err.message().contains("'error.code' is missing"));

        let err = Response::from_value(
            &json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 1.5, "message": "x"}}),
        )
        .unwrap_err();
        assert!(err.message().contains("'error.code' has wrong type"));

        let err = Response::from_value(
            &json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000}}),
        )
        .unwrap_err();
        assert!(err.message().contains("'error.message' is missing"));
    }

    #[test]
    fn error_codes_map_to_reserved_values() {
        assert_eq!(RpcError::Parse("x".into()).code(), -32700);
        assert_eq!(RpcError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(RpcError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(RpcError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(RpcError::Internal("x".into()).code(), -32603);
    }

    #[test]
    fn server_error_offsets_stay_unique() {
        let a = RpcError::Server { offset: 0, message: "a".into() };
        let b = RpcError::Server { offset: 5, message: "b".into() };
        assert_eq!(a.code(), SERVER_ERROR);
        assert_eq!(b.code(), -32005);
        assert!(b.code() >= SERVER_ERROR_MAX);
    }

    #[test]
    fn custom_error_keeps_its_code() {
        let e = RpcError::Custom { code: 9000, message: "domain".into() };
        assert_eq!(e.code(), 9000);
        assert_eq!(e.to_string(), "domain");
    }
}
