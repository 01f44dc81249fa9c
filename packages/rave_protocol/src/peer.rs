use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Numeric account id of a session member.
pub type UserId = u64;

/// Peer identity on a session socket, formatted `{userId}_{uuid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Fresh peer id for `user_id` with a random suffix.
    pub fn generate(user_id: UserId) -> Self {
        Self(format!("{}_{}", user_id, uuid::Uuid::new_v4()))
    }

    /// Wrap an existing peer id, checking that it carries a numeric user prefix.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let peer = Self(raw);
        if peer.user_id().is_none() {
            return Err(ProtocolError::InvalidPeerId(peer.0));
        }
        Ok(peer)
    }

    /// Wrap a peer id as received from the wire without validating it.
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.0.split('_').next()?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
