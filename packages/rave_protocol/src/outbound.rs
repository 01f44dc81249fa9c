//! Builders for the frames this side sends.

use serde_json::{Map, Value, json};

use crate::methods;
use crate::{MediaAttachment, Notification};

/// An outgoing chat line. The id is generated locally; the room may echo the
/// line back under a different id.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundChat {
    pub id: String,
    pub text: String,
    pub detected_lang: String,
    pub user_id: Option<String>,
    pub reply_to: Option<String>,
    pub media: Vec<MediaAttachment>,
}

impl OutboundChat {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            detected_lang: "en".to_string(),
            user_id: None,
            reply_to: None,
            media: Vec::new(),
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn media(mut self, media: Vec<MediaAttachment>) -> Self {
        self.media = media;
        self
    }

    /// `chatMessage` notification with data keys in the order
    /// `chat, detected_lang, id, translations, userId?, reply?, media?`.
    pub fn to_notification(&self) -> Notification {
        let mut data = Map::new();
        data.insert("chat".into(), Value::String(self.text.clone()));
        data.insert("detected_lang".into(), Value::String(self.detected_lang.clone()));
        data.insert("id".into(), Value::String(self.id.clone()));
        data.insert("translations".into(), json!({}));
        if let Some(user_id) = &self.user_id {
            data.insert("userId".into(), Value::String(user_id.clone()));
        }
        if let Some(reply) = &self.reply_to {
            data.insert("reply".into(), Value::String(reply.clone()));
        }
        if !self.media.is_empty() {
            let media = self
                .media
                .iter()
                .map(|m| {
                    json!({
                        "url": m.url,
                        "mime": m.mime,
                        "isExplicit": m.is_explicit,
                        "aspectRatio": m.aspect_ratio,
                        "thumbnailUrl": m.thumbnail_url,
                    })
                })
                .collect();
            data.insert("media".into(), Value::Array(media));
        }
        Notification::new(methods::CHAT_MESSAGE, Value::Object(data))
    }
}

/// `typing` / `typing_stop` notification.
pub fn typing(is_typing: bool) -> Notification {
    let method = if is_typing {
        methods::TYPING
    } else {
        methods::TYPING_STOP
    };
    Notification::new(method, json!({}))
}

/// Method and payload of the post-connect handshake request.
pub fn fully_joined() -> (&'static str, Value) {
    (methods::FULLY_JOINED, json!({}))
}

/// Method and payload of the keepalive request.
pub fn client_ping() -> (&'static str, Value) {
    (methods::CLIENT_PING, json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    #[test]
    fn test_chat_key_order_minimal() {
        let mut chat = OutboundChat::new("hi");
        chat.id = "abc".into();
        assert_eq!(
            encode(&chat.to_notification()).unwrap(),
            r#"{"data":{"chat":"hi","detected_lang":"en","id":"abc","translations":{}},"method":"chatMessage","notification":true}"#
        );
    }

    #[test]
    fn test_chat_key_order_full() {
        let mut chat = OutboundChat::new("yo")
            .user_id("5")
            .reply_to("m0")
            .media(vec![MediaAttachment {
                url: "https://u".into(),
                mime: "image/png".into(),
                ..Default::default()
            }]);
        chat.id = "x".into();
        let text = encode(&chat.to_notification()).unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"data":{"chat":"yo","detected_lang":"en","id":"x","translations":{},"userId":"5","reply":"m0","#,
                r#""media":[{"url":"https://u","mime":"image/png","isExplicit":false,"aspectRatio":"","thumbnailUrl":""}]},"#,
                r#""method":"chatMessage","notification":true}"#
            )
        );
    }

    #[test]
    fn test_chat_ids_are_unique() {
        assert_ne!(OutboundChat::new("a").id, OutboundChat::new("a").id);
    }

    #[test]
    fn test_typing_methods() {
        assert_eq!(typing(true).method, "typing");
        assert_eq!(typing(false).method, "typing_stop");
    }

    #[test]
    fn test_outbound_chat_decodes_back() {
        let chat = OutboundChat::new("round").reply_to("r1");
        let parsed = chat.to_notification().chat_message().unwrap();
        assert_eq!(parsed.chat, "round");
        assert_eq!(parsed.id, chat.id);
        assert_eq!(parsed.reply.as_deref(), Some("r1"));
    }
}
