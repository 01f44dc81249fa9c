//! Payloads nested inside notifications.
//!
//! Decoding here is deliberately forgiving: a missing or malformed nested
//! payload yields `None` so the caller can drop the frame and carry on.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::methods;
use crate::{Notification, UserId};

/// Room state carried by `stateMessage` as a JSON string in `data.message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    /// Required key; a `null` value reads as an empty state.
    #[serde(deserialize_with = "null_as_default")]
    pub mesh_state: MeshState,
    pub users: Vec<MemberState>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub likeskips: Vec<Value>,
    #[serde(default)]
    pub kicks: Vec<Value>,
    #[serde(default)]
    pub cleared_votes: Vec<Value>,
    #[serde(default)]
    pub vote_originator: Option<Value>,
}

impl StateMessage {
    /// Current member ids, ordered. Records without a usable id are skipped.
    pub fn member_ids(&self) -> BTreeSet<UserId> {
        self.users.iter().filter_map(|u| u.user_id).collect()
    }
}

/// What the room is currently playing and how it is configured. Mode fields
/// are opaque pass-through values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshState {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub video_instance_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub privacy_mode: Option<Value>,
    #[serde(default)]
    pub play_mode: Option<Value>,
    #[serde(default)]
    pub voip_mode: Option<Value>,
    #[serde(default)]
    pub maturity: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    #[serde(default, deserialize_with = "lenient_user_id")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub when_joined: Option<f64>,
    #[serde(default)]
    pub is_leader: Option<bool>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub voip_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub users: Vec<Value>,
    #[serde(default)]
    pub num_votes: Option<i64>,
    #[serde(default)]
    pub oldest_vote_time: Option<f64>,
    #[serde(default)]
    pub order: Option<i64>,
}

/// Playback queue carried by `queueMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub queue_id: String,
    #[serde(default)]
    pub items: Vec<QueueItem>,
    #[serde(default)]
    pub transaction_ts: Option<Value>,
    #[serde(default)]
    pub last_index: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub view_count: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub is_live: Option<bool>,
}

/// A chat line as broadcast by the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub id: String,
    /// Sender peer id.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub detected_lang: Option<String>,
    #[serde(default)]
    pub translations: Option<Value>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Tagged users; entries that are not objects are kept but never match.
    #[serde(default)]
    pub user_metas: Vec<Value>,
}

impl ChatMessage {
    /// Whether `user` appears in the tag list.
    pub fn mentions(&self, user: UserId) -> bool {
        self.user_metas
            .iter()
            .filter_map(|meta| meta.as_object()?.get("id"))
            .any(|id| value_as_user_id(id) == Some(user))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub is_explicit: bool,
    #[serde(default)]
    pub aspect_ratio: String,
    #[serde(default)]
    pub thumbnail_url: String,
}

impl Notification {
    /// Room state, when this is a well-formed `stateMessage`.
    pub fn state_message(&self) -> Option<StateMessage> {
        if !self.is(methods::STATE_MESSAGE) {
            return None;
        }
        nested(&self.data)
    }

    /// Playback queue, when this is a well-formed `queueMessage`.
    pub fn queue_message(&self) -> Option<Queue> {
        if !self.is(methods::QUEUE_MESSAGE) {
            return None;
        }
        nested(&self.data)
    }

    /// Chat line, when this is a well-formed `chatMessage`. Accepts the line
    /// either inline in `data` or encoded in `data.message`.
    pub fn chat_message(&self) -> Option<ChatMessage> {
        if !self.is(methods::CHAT_MESSAGE) {
            return None;
        }
        let obj = self.data.as_object()?;
        if obj.contains_key("chat") || obj.contains_key("from") {
            ChatMessage::deserialize(&self.data).ok()
        } else {
            nested(&self.data)
        }
    }
}

fn nested<T: DeserializeOwned>(data: &Value) -> Option<T> {
    match data.get("message")? {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        obj @ Value::Object(_) => T::deserialize(obj).ok(),
        _ => None,
    }
}

fn value_as_user_id(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn lenient_user_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<UserId>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_as_user_id(&value))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
