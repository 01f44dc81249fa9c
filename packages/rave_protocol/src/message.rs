//! The three protoo frame shapes.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ProtocolError;

/// A boolean wire flag that is always `true`.
///
/// Frames identify themselves with `"request": true`, `"notification": true`
/// or `"response": true`; modelling the flag as a unit type makes a frame with
/// the flag set to `false` fail to decode as that shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct True;

impl Serialize for True {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for True {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(True)
        } else {
            Err(D::Error::custom("expected `true`"))
        }
    }
}

/// `{data, id, method, request:true}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub data: Value,
    pub id: u64,
    pub method: String,
    pub request: True,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            id,
            method: method.into(),
            request: True,
        }
    }
}

/// `{data, method, notification:true}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub data: Value,
    pub method: String,
    pub notification: True,
}

impl Notification {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            method: method.into(),
            notification: True,
        }
    }

    pub fn is(&self, method: &str) -> bool {
        self.method == method
    }
}

/// `{response:true, id, ok, data}`, plus `errorCode`/`errorReason` when the
/// peer rejects a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response: True,
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(
        rename = "errorCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_code: Option<i64>,
    #[serde(
        rename = "errorReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_reason: Option<String>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            response: True,
            id,
            ok: true,
            data,
            error_code: None,
            error_reason: None,
        }
    }

    pub fn error(id: u64, code: i64, reason: impl Into<String>) -> Self {
        Self {
            response: True,
            id,
            ok: false,
            data: Value::Null,
            error_code: Some(code),
            error_reason: Some(reason.into()),
        }
    }
}

/// Any frame read off a session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Request(Request),
    Notification(Notification),
}

impl Message {
    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Message::Notification(n) => Some(n),
            _ => None,
        }
    }

    /// Method name, if the frame carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a frame, keeping fields in declaration order.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Per-connection source of request correlation ids.
///
/// Starts at a random offset so ids from a fresh connection are unlikely to
/// collide with late responses addressed to a previous one. Never yields 0.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(rand::rng().random_range(1..1_000_000))
    }

    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
