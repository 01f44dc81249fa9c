//! Rave Protocol - wire shapes for protoo sessions
//!
//! Every frame on a session socket is one UTF-8 JSON object in one of three
//! shapes: a [`Request`] (expects a [`Response`] with the same id), a
//! [`Notification`] (fire-and-forget), or a [`Response`]. Key order in the
//! encoded form is part of the wire contract, so the structs below declare
//! their fields in wire order and `serde_json` is built with `preserve_order`.
//!
//! Notifications carry nested payloads: room state and queue updates arrive
//! as a JSON string inside `data.message`, chat messages as an object in
//! `data`. The accessors in [`payload`] never fail; anything malformed
//! decodes to `None`.
//!
//! # Example
//!
//! ```
//! use rave_protocol::{Message, Request, decode, encode};
//! use serde_json::json;
//!
//! let request = Request::new(7, "clientPing", json!({}));
//! let text = encode(&request).unwrap();
//! assert_eq!(text, r#"{"data":{},"id":7,"method":"clientPing","request":true}"#);
//!
//! match decode(&text).unwrap() {
//!     Message::Request(req) => assert_eq!(req.method, "clientPing"),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

mod error;
pub mod message;
pub mod outbound;
pub mod payload;
pub mod peer;

pub use error::ProtocolError;
pub use message::{IdGenerator, Message, Notification, Request, Response, True, decode, encode};
pub use outbound::{OutboundChat, client_ping, fully_joined, typing};
pub use payload::{
    ChatMessage, MediaAttachment, MemberState, MeshState, Queue, QueueItem, StateMessage, Vote,
};
pub use peer::{PeerId, UserId};

/// Notification and request method names used on the wire.
pub mod methods {
    pub const CHAT_MESSAGE: &str = "chatMessage";
    pub const STATE_MESSAGE: &str = "stateMessage";
    pub const QUEUE_MESSAGE: &str = "queueMessage";
    pub const KICKED: &str = "kicked";
    pub const FULLY_JOINED: &str = "fullyJoined";
    pub const CLIENT_PING: &str = "clientPing";
    pub const TYPING: &str = "typing";
    pub const TYPING_STOP: &str = "typing_stop";
}
