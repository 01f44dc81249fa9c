//! Boundary to the REST collaborator that lists sessions, resolves users and
//! performs side-channel actions. The supervisor and agents only see this
//! trait; the HTTP client lives in the binary.

use async_trait::async_trait;
use rave_protocol::{MediaAttachment, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ApiError;

/// Which sessions the account should be present in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Only sessions the account was invited to.
    #[default]
    Invited,
    /// Public, friends' and invited sessions, de-duplicated.
    All,
}

/// One entry of the desired-session list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub members: Vec<UserId>,
    /// Opaque metadata (privacy/play modes and the like), passed through.
    #[serde(default)]
    pub metadata: Value,
}

impl SessionSummary {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            members: Vec::new(),
            metadata: Value::Null,
        }
    }
}

/// Current details of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Host of the session's socket server. `None` when the room has no server.
    pub endpoint: Option<String>,
    #[serde(default)]
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    /// Raw record as returned by the collaborator.
    #[serde(default)]
    pub raw: Value,
}

impl UserProfile {
    pub fn fallback(id: UserId) -> Self {
        Self {
            id,
            display_name: fallback_name(id),
            raw: Value::Null,
        }
    }
}

pub fn fallback_name(id: UserId) -> String {
    format!("User {id}")
}

/// A file to attach to a chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub is_explicit: bool,
}

#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    async fn list_sessions(
        &self,
        mode: SessionMode,
        limit: usize,
        lang: &str,
    ) -> Result<Vec<SessionSummary>, ApiError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ApiError>;

    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>, ApiError>;

    async fn leave_session(&self, session_id: &str, device_id: &str) -> Result<bool, ApiError>;

    async fn upload_media(
        &self,
        session_id: &str,
        files: Vec<MediaFile>,
    ) -> Result<Vec<MediaAttachment>, ApiError>;
}
