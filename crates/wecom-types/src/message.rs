//! Wire shapes of the callback protocol.
//!
//! `EncryptedEnvelope` is the HTTP body in both directions; `InboundMessage`
//! is what the envelope decrypts to, and `OutgoingReply` is what a response
//! encrypts from.

use serde::{Deserialize, Serialize};

/// Encrypted request body: `{"encrypt": "<base64>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Base64 ciphertext.
    pub encrypt: String,
}

/// Encrypted response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedReply {
    /// Base64 ciphertext of the reply plaintext.
    pub encrypt: String,
    /// Signature over token, timestamp, nonce and `encrypt`.
    pub msgsignature: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Random nonce used in the signature.
    pub nonce: String,
}

/// Conversation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    /// One-to-one chat with the bot.
    #[default]
    Single,
    /// Group chat.
    Group,
}

/// Message sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub userid: String,
}

/// `{"content": "..."}` payloads (text, voice transcription).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub content: String,
}

/// `{"url": "..."}` payloads (image, file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaContent {
    #[serde(default)]
    pub url: String,
}

/// Reference to a previously opened stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRef {
    pub id: String,
}

/// Platform event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContent {
    #[serde(default)]
    pub eventtype: String,
}

/// Decrypted callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub msgid: String,
    #[serde(default)]
    pub aibotid: Option<String>,
    #[serde(default)]
    pub chatid: Option<String>,
    #[serde(default)]
    pub chattype: ChatType,
    #[serde(default)]
    pub from: Sender,
    /// One-shot URL for an active reply outside the callback cycle.
    #[serde(default)]
    pub response_url: Option<String>,
    pub msgtype: String,
    #[serde(default)]
    pub text: Option<TextContent>,
    #[serde(default)]
    pub voice: Option<TextContent>,
    #[serde(default)]
    pub image: Option<MediaContent>,
    #[serde(default)]
    pub file: Option<MediaContent>,
    /// Mixed text/image content, passed through untouched.
    #[serde(default)]
    pub mixed: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: Option<StreamRef>,
    #[serde(default)]
    pub event: Option<EventContent>,
}

/// How the dispatcher treats an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind<'a> {
    /// A poll for an existing stream.
    StreamPoll(&'a str),
    /// A platform event such as `enter_chat`.
    Event(&'a str),
    /// A user message for the reply pipeline.
    Message,
}

impl InboundMessage {
    /// Classify the message.
    pub fn kind(&self) -> MessageKind<'_> {
        match self.msgtype.as_str() {
            "stream" => MessageKind::StreamPoll(
                self.stream.as_ref().map(|s| s.id.as_str()).unwrap_or(""),
            ),
            "event" => MessageKind::Event(
                self.event
                    .as_ref()
                    .map(|e| e.eventtype.as_str())
                    .unwrap_or(""),
            ),
            _ => MessageKind::Message,
        }
    }

    /// Routing target key: `group:<chatid>` for groups, `user:<userid>` otherwise.
    pub fn target_key(&self) -> String {
        match (self.chattype, self.chatid.as_deref()) {
            (ChatType::Group, Some(chat)) if !chat.is_empty() => format!("group:{chat}"),
            _ => format!("user:{}", self.from.userid),
        }
    }

    /// Plain text carried by the message, if any.
    pub fn text_content(&self) -> Option<&str> {
        self.text
            .as_ref()
            .or(self.voice.as_ref())
            .map(|t| t.content.as_str())
            .filter(|t| !t.trim().is_empty())
    }

    /// Media URL carried by the message, if any.
    pub fn media_url(&self) -> Option<&str> {
        self.image
            .as_ref()
            .or(self.file.as_ref())
            .map(|m| m.url.as_str())
            .filter(|u| !u.is_empty())
    }
}

/// Stream reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamReply {
    pub id: String,
    /// True once no further output will follow.
    pub finish: bool,
    pub content: String,
}

/// Reply plaintext, tagged by `msgtype`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "snake_case")]
pub enum OutgoingReply {
    Stream { stream: StreamReply },
    Text { text: TextContentReply },
}

/// Text reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContentReply {
    pub content: String,
}

impl OutgoingReply {
    /// Build a stream reply.
    pub fn stream(id: impl Into<String>, content: impl Into<String>, finish: bool) -> Self {
        OutgoingReply::Stream {
            stream: StreamReply {
                id: id.into(),
                finish,
                content: content.into(),
            },
        }
    }

    /// Build a text reply.
    pub fn text(content: impl Into<String>) -> Self {
        OutgoingReply::Text {
            text: TextContentReply {
                content: content.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_message() {
        let raw = serde_json::json!({
            "msgid": "m1",
            "aibotid": "bot",
            "chattype": "single",
            "from": { "userid": "alice" },
            "response_url": "https://example.com/r",
            "msgtype": "text",
            "text": { "content": "hello" }
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.kind(), MessageKind::Message);
        assert_eq!(msg.text_content(), Some("hello"));
        assert_eq!(msg.target_key(), "user:alice");
        assert_eq!(msg.response_url.as_deref(), Some("https://example.com/r"));
    }

    #[test]
    fn test_parse_stream_poll() {
        let raw = r#"{"msgid":"m2","msgtype":"stream","stream":{"id":"abc"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind(), MessageKind::StreamPoll("abc"));
    }

    #[test]
    fn test_parse_event() {
        let raw = r#"{"msgtype":"event","event":{"eventtype":"enter_chat"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind(), MessageKind::Event("enter_chat"));
    }

    #[test]
    fn test_group_target_key() {
        let raw = r#"{"msgtype":"text","chattype":"group","chatid":"c9","from":{"userid":"bob"},"text":{"content":"hi"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.target_key(), "group:c9");
    }

    #[test]
    fn test_media_url() {
        let raw = r#"{"msgtype":"image","image":{"url":"https://x/y.png"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.media_url(), Some("https://x/y.png"));
        assert!(msg.text_content().is_none());
    }

    #[test]
    fn test_stream_reply_shape() {
        let reply = OutgoingReply::stream("s1", "partial", false);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["msgtype"], "stream");
        assert_eq!(json["stream"]["id"], "s1");
        assert_eq!(json["stream"]["finish"], false);
        assert_eq!(json["stream"]["content"], "partial");
    }

    #[test]
    fn test_text_reply_shape() {
        let json = serde_json::to_value(OutgoingReply::text("welcome")).unwrap();
        assert_eq!(json["msgtype"], "text");
        assert_eq!(json["text"]["content"], "welcome");
    }
}
