//! JSON-RPC 2.0 framing for client sessions.
//!
//! Sessions exchange newline-delimited JSON. A line holds a single request,
//! a notification (no `id`) or a batch (array) of them. Responses and server
//! notifications are built here as [`serde_json::Value`]s; errors travel as
//! [`RpcError`] and are rendered through jsonrpsee's error object so the
//! wire shape matches every other JSON-RPC speaker.

use std::cmp::Ordering;
use std::fmt;

use jsonrpsee::types::ErrorObjectOwned;
use serde_json::{json, Value};

/// Application error: the request was understood but cannot be served.
pub const BAD_REQUEST: i32 = 1;
/// The daemon failed while serving the request.
pub const DAEMON_ERROR: i32 = 2;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Oldest protocol version served.
pub const PROTOCOL_MIN: ProtocolVersion = ProtocolVersion::new(1, 4, 0);
/// Newest protocol version served.
pub const PROTOCOL_MAX: ProtocolVersion = ProtocolVersion::new(1, 4, 2);

/// An error returned to a client in place of a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, message)
    }

    pub fn daemon(message: impl Into<String>) -> Self {
        Self::new(DAEMON_ERROR, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method \"{method}\""))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for ErrorObjectOwned {
    fn from(err: RpcError) -> Self {
        ErrorObjectOwned::owned(err.code, err.message, None::<()>)
    }
}

pub type RpcResult = Result<Value, RpcError>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A decoded request. `id` is `None` for notifications.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// One line from a client.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Single(Result<Request, (Value, RpcError)>),
    Batch(Vec<Result<Request, (Value, RpcError)>>),
}

/// Decode one line. A line that is not JSON at all is an `Err` carrying the
/// response to send back.
pub fn parse_line(line: &[u8]) -> Result<Incoming, Value> {
    let value: Value = serde_json::from_slice(line)
        .map_err(|e| error_response(Value::Null, &RpcError::new(PARSE_ERROR, format!("invalid JSON: {e}"))))?;
    match value {
        Value::Array(items) if items.is_empty() => Err(error_response(
            Value::Null,
            &RpcError::new(INVALID_REQUEST, "empty batch"),
        )),
        Value::Array(items) => Ok(Incoming::Batch(items.into_iter().map(parse_request).collect())),
        other => Ok(Incoming::Single(parse_request(other))),
    }
}

fn parse_request(value: Value) -> Result<Request, (Value, RpcError)> {
    let Value::Object(mut obj) = value else {
        return Err((Value::Null, RpcError::new(INVALID_REQUEST, "request must be an object")));
    };
    let id = obj.remove("id");
    let err_id = id.clone().unwrap_or(Value::Null);
    if let Some(id) = &id {
        if !(id.is_string() || id.is_number() || id.is_null()) {
            return Err((Value::Null, RpcError::new(INVALID_REQUEST, "invalid request id")));
        }
    }
    let method = match obj.remove("method") {
        Some(Value::String(m)) => m,
        _ => return Err((err_id, RpcError::new(INVALID_REQUEST, "missing method"))),
    };
    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Array(Vec::new()),
        Some(p @ (Value::Array(_) | Value::Object(_))) => p,
        Some(_) => return Err((err_id, RpcError::invalid_params("params must be an array or object"))),
    };
    Ok(Request { id, method, params })
}

/// Positional-or-named parameter access for a handler.
///
/// `names` lists the method's parameters in order; a client may send them
/// as an array or as an object keyed by those names.
pub struct Params<'a> {
    params: &'a Value,
    names: &'static [&'static str],
}

impl<'a> Params<'a> {
    pub fn new(params: &'a Value, names: &'static [&'static str]) -> Result<Self, RpcError> {
        let count = match params {
            Value::Array(a) => a.len(),
            Value::Object(o) => {
                if let Some(k) = o.keys().find(|k| !names.contains(&k.as_str())) {
                    return Err(RpcError::invalid_params(format!("unexpected parameter \"{k}\"")));
                }
                0
            }
            _ => 0,
        };
        if count > names.len() {
            return Err(RpcError::invalid_params(format!(
                "too many parameters: expected at most {}, got {count}",
                names.len()
            )));
        }
        Ok(Self { params, names })
    }

    /// The parameter at `index`, or `None` when omitted or null.
    pub fn get(&self, index: usize) -> Option<&'a Value> {
        let value = match self.params {
            Value::Array(a) => a.get(index),
            Value::Object(o) => self.names.get(index).and_then(|name| o.get(*name)),
            _ => None,
        };
        value.filter(|v| !v.is_null())
    }

    pub fn required(&self, index: usize) -> Result<&'a Value, RpcError> {
        self.get(index).ok_or_else(|| {
            let name = self.names.get(index).copied().unwrap_or("?");
            RpcError::invalid_params(format!("missing parameter \"{name}\""))
        })
    }

    pub fn str(&self, index: usize) -> Result<&'a str, RpcError> {
        let value = self.required(index)?;
        value
            .as_str()
            .ok_or_else(|| RpcError::bad_request(format!("{value} should be a string")))
    }

    /// A non-negative integer parameter. Integral floats are accepted.
    pub fn u64(&self, index: usize) -> Result<u64, RpcError> {
        non_negative_integer(self.required(index)?)
    }

    pub fn u64_or(&self, index: usize, default: u64) -> Result<u64, RpcError> {
        self.get(index).map_or(Ok(default), non_negative_integer)
    }

    pub fn bool_or(&self, index: usize, default: bool) -> Result<bool, RpcError> {
        match self.get(index) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(v) => Err(RpcError::bad_request(format!("{v} should be a boolean"))),
        }
    }
}

fn non_negative_integer(value: &Value) -> Result<u64, RpcError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(RpcError::bad_request(format!("{value} should be a non-negative integer"))),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn result_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "result": result, "id": id})
}

pub fn error_response(id: Value, err: &RpcError) -> Value {
    let error: ErrorObjectOwned = err.clone().into();
    json!({"jsonrpc": "2.0", "error": error, "id": id})
}

/// A server-initiated notification.
pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// Serialize a message as one newline-terminated line.
pub fn to_line(message: &Value) -> Vec<u8> {
    let mut line = message.to_string().into_bytes();
    line.push(b'\n');
    line
}

// ---------------------------------------------------------------------------
// Protocol versions
// ---------------------------------------------------------------------------

/// A `major.minor[.patch]` protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `"1"`, `"1.4"` or `"1.4.2"`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in s.split('.') {
            if count == 3 {
                return None;
            }
            parts[count] = piece.parse().ok()?;
            count += 1;
        }
        (count > 0).then_some(Self::new(parts[0], parts[1], parts[2]))
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// Pick the protocol version for a `server.version` request.
///
/// `requested` is the client's second parameter: absent, a version string,
/// or a `[min, max]` pair. The result is `min(client max, server max)` if it
/// is at least `max(client min, server min)`.
pub fn negotiate_version(
    requested: Option<&Value>,
    server_min: ProtocolVersion,
    server_max: ProtocolVersion,
) -> Option<ProtocolVersion> {
    let (client_min, client_max) = match requested {
        None => (server_min, server_min),
        Some(Value::String(s)) => {
            let v = ProtocolVersion::parse(s)?;
            (v, v)
        }
        Some(Value::Array(pair)) if pair.len() == 2 => {
            let min = ProtocolVersion::parse(pair[0].as_str()?)?;
            let max = ProtocolVersion::parse(pair[1].as_str()?)?;
            (min, max)
        }
        Some(_) => return None,
    };
    let chosen = client_max.min(server_max);
    (chosen >= client_min.max(server_min)).then_some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(line: &str) -> Result<Request, (Value, RpcError)> {
        match parse_line(line.as_bytes()).unwrap() {
            Incoming::Single(r) => r,
            Incoming::Batch(_) => panic!("expected a single request"),
        }
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    #[test]
    fn parses_request_with_positional_params() {
        let req = single(r#"{"jsonrpc":"2.0","id":7,"method":"server.ping","params":[]}"#).unwrap();
        assert_eq!(req.id, Some(json!(7)));
        assert_eq!(req.method, "server.ping");
        assert!(!req.is_notification());
    }

    #[test]
    fn missing_params_become_empty_array() {
        let req = single(r#"{"id":"a","method":"server.banner"}"#).unwrap();
        assert_eq!(req.params, json!([]));
    }

    #[test]
    fn notification_has_no_id() {
        let req = single(r#"{"method":"server.ping"}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn garbage_is_parse_error() {
        let resp = parse_line(b"{nope").unwrap_err();
        assert_eq!(resp["error"]["code"], json!(PARSE_ERROR));
        assert_eq!(resp["id"], Value::Null);
    }

    #[test]
    fn missing_method_is_invalid_request() {
        let (id, err) = single(r#"{"id":3}"#).unwrap_err();
        assert_eq!(id, json!(3));
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn batch_is_split() {
        let line = r#"[{"id":1,"method":"a"},{"id":2,"method":"b"},5]"#;
        let Incoming::Batch(items) = parse_line(line.as_bytes()).unwrap() else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(items[2].is_err());
        assert!(parse_line(b"[]").is_err());
    }

    #[test]
    fn error_response_shape() {
        let resp = error_response(json!(1), &RpcError::bad_request("nope"));
        assert_eq!(resp["error"]["code"], json!(1));
        assert_eq!(resp["error"]["message"], json!("nope"));
        assert_eq!(resp["jsonrpc"], json!("2.0"));
        let line = to_line(&resp);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    // ------------------------------------------------------------------
    // Params
    // ------------------------------------------------------------------

    const NAMES: &[&str] = &["height", "cp_height"];

    #[test]
    fn params_positional_and_named() {
        let arr = json!([5, 8]);
        let p = Params::new(&arr, NAMES).unwrap();
        assert_eq!(p.u64(0).unwrap(), 5);
        assert_eq!(p.u64_or(1, 0).unwrap(), 8);

        let obj = json!({"height": 5});
        let p = Params::new(&obj, NAMES).unwrap();
        assert_eq!(p.u64(0).unwrap(), 5);
        assert_eq!(p.u64_or(1, 0).unwrap(), 0);
    }

    #[test]
    fn params_reject_extras_and_bad_types() {
        assert!(Params::new(&json!([1, 2, 3]), NAMES).is_err());
        assert!(Params::new(&json!({"bogus": 1}), NAMES).is_err());
        let arr = json!([-1]);
        let p = Params::new(&arr, NAMES).unwrap();
        assert_eq!(p.u64(0).unwrap_err().code, BAD_REQUEST);
        let arr = json!([]);
        let p = Params::new(&arr, NAMES).unwrap();
        assert_eq!(p.u64(0).unwrap_err().code, INVALID_PARAMS);
    }

    #[test]
    fn integral_float_accepted() {
        let arr = json!([6.0]);
        assert_eq!(Params::new(&arr, NAMES).unwrap().u64(0).unwrap(), 6);
        let arr = json!([6.5]);
        assert!(Params::new(&arr, NAMES).unwrap().u64(0).is_err());
    }

    // ------------------------------------------------------------------
    // Version negotiation
    // ------------------------------------------------------------------

    #[test]
    fn version_parse_and_display() {
        assert_eq!(ProtocolVersion::parse("1.4").unwrap(), ProtocolVersion::new(1, 4, 0));
        assert_eq!(ProtocolVersion::parse("1.4.2").unwrap().to_string(), "1.4.2");
        assert_eq!(ProtocolVersion::new(1, 4, 0).to_string(), "1.4");
        assert!(ProtocolVersion::parse("1.x").is_none());
        assert!(ProtocolVersion::parse("1.2.3.4").is_none());
        assert!(ProtocolVersion::parse("").is_none());
    }

    #[test]
    fn negotiation_picks_highest_common() {
        let v = negotiate_version(Some(&json!(["1.4", "1.5"])), PROTOCOL_MIN, PROTOCOL_MAX);
        assert_eq!(v, Some(PROTOCOL_MAX));
        let v = negotiate_version(Some(&json!("1.4.1")), PROTOCOL_MIN, PROTOCOL_MAX);
        assert_eq!(v, Some(ProtocolVersion::new(1, 4, 1)));
        assert_eq!(negotiate_version(None, PROTOCOL_MIN, PROTOCOL_MAX), Some(PROTOCOL_MIN));
    }

    #[test]
    fn negotiation_rejects_disjoint_ranges() {
        assert_eq!(negotiate_version(Some(&json!("1.2")), PROTOCOL_MIN, PROTOCOL_MAX), None);
        assert_eq!(negotiate_version(Some(&json!(["1.5", "2.0"])), PROTOCOL_MIN, PROTOCOL_MAX), None);
        assert_eq!(negotiate_version(Some(&json!(["bad", "1.4"])), PROTOCOL_MIN, PROTOCOL_MAX), None);
        assert_eq!(negotiate_version(Some(&json!(14)), PROTOCOL_MIN, PROTOCOL_MAX), None);
    }
}
