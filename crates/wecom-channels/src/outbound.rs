//! Outbound path: write replies into open streams, push otherwise.

use crate::stream::StreamSessionTable;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use wecom_types::error::{WecomError, WecomResult};

/// Outcome of an append to the active stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAppendResult {
    Appended { stream_id: String },
    NoActiveStream,
}

impl OutboundAppendResult {
    pub fn appended(&self) -> bool {
        matches!(self, Self::Appended { .. })
    }

    /// Message id reported to callers: `stream:<streamId>`.
    pub fn message_id(&self) -> Option<String> {
        match self {
            Self::Appended { stream_id } => Some(format!("stream:{stream_id}")),
            Self::NoActiveStream => None,
        }
    }
}

/// Appends outbound text to the open stream for a conversation.
#[derive(Clone)]
pub struct OutboundStreamBridge {
    table: Arc<StreamSessionTable>,
}

impl OutboundStreamBridge {
    pub fn new(table: Arc<StreamSessionTable>) -> Self {
        Self { table }
    }

    /// Append to the active stream. `false` when none is open.
    pub fn try_append_to_active_stream(&self, account_id: &str, target: &str, chunk: &str) -> bool {
        self.append(account_id, target, chunk).appended()
    }

    pub fn append(&self, account_id: &str, target: &str, chunk: &str) -> OutboundAppendResult {
        match self.table.append_to_active(account_id, target, chunk) {
            Some(stream_id) => {
                debug!(account = %account_id, target = %target, stream = %stream_id, len = chunk.len(), "Appended to stream");
                OutboundAppendResult::Appended { stream_id }
            }
            None => OutboundAppendResult::NoActiveStream,
        }
    }

    /// Close the active stream so the next poll finishes it.
    pub fn finish(&self, account_id: &str, target: &str) -> bool {
        self.table.close_active(account_id, target)
    }

    /// Append to one stream, whether or not it is still the active one.
    ///
    /// `NoActiveStream` once that stream is closed or gone.
    pub fn append_to(&self, stream_id: &str, chunk: &str) -> OutboundAppendResult {
        if self.table.append(stream_id, chunk) {
            debug!(stream = %stream_id, len = chunk.len(), "Appended to stream");
            OutboundAppendResult::Appended {
                stream_id: stream_id.to_string(),
            }
        } else {
            OutboundAppendResult::NoActiveStream
        }
    }

    /// Close one stream. `false` if it is unknown.
    pub fn close(&self, stream_id: &str) -> bool {
        self.table.close(stream_id)
    }
}

/// Delivery outside the callback cycle.
#[async_trait]
pub trait DirectPush: Send + Sync {
    /// Push text. Returns a delivery message id.
    async fn push_text(&self, account_id: &str, target: &str, text: &str) -> WecomResult<String>;

    /// Push a media link with an optional caption.
    async fn push_media(
        &self,
        account_id: &str,
        target: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> WecomResult<String> {
        self.push_text(account_id, target, &media_chunk(media_url, caption))
            .await
    }
}

/// How a send was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stream,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub message_id: String,
    pub delivery: Delivery,
}

/// Send adapter: stream first, direct push as fallback.
#[derive(Clone)]
pub struct WecomOutbound {
    bridge: OutboundStreamBridge,
    push: Option<Arc<dyn DirectPush>>,
}

impl WecomOutbound {
    pub fn new(bridge: OutboundStreamBridge, push: Option<Arc<dyn DirectPush>>) -> Self {
        Self { bridge, push }
    }

    pub fn bridge(&self) -> &OutboundStreamBridge {
        &self.bridge
    }

    pub async fn send_text(
        &self,
        account_id: &str,
        target: &str,
        text: &str,
    ) -> WecomResult<SendResult> {
        let appended = self.bridge.append(account_id, target, text);
        self.text_or_push(appended, account_id, target, text).await
    }

    /// [`send_text`](Self::send_text) bound to the stream a reply started on.
    ///
    /// Once that stream is closed, replaced or expired the text is pushed,
    /// never written into a newer stream of the same conversation.
    pub async fn send_text_to(
        &self,
        stream_id: &str,
        account_id: &str,
        target: &str,
        text: &str,
    ) -> WecomResult<SendResult> {
        let appended = self.bridge.append_to(stream_id, text);
        self.text_or_push(appended, account_id, target, text).await
    }

    pub async fn send_media(
        &self,
        account_id: &str,
        target: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> WecomResult<SendResult> {
        let appended = self.bridge.append(account_id, target, &media_chunk(media_url, caption));
        self.media_or_push(appended, account_id, target, media_url, caption)
            .await
    }

    /// [`send_media`](Self::send_media) bound to one stream.
    pub async fn send_media_to(
        &self,
        stream_id: &str,
        account_id: &str,
        target: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> WecomResult<SendResult> {
        let appended = self.bridge.append_to(stream_id, &media_chunk(media_url, caption));
        self.media_or_push(appended, account_id, target, media_url, caption)
            .await
    }

    async fn text_or_push(
        &self,
        appended: OutboundAppendResult,
        account_id: &str,
        target: &str,
        text: &str,
    ) -> WecomResult<SendResult> {
        if let Some(message_id) = appended.message_id() {
            return Ok(SendResult {
                message_id,
                delivery: Delivery::Stream,
            });
        }
        let push = self.push_for(account_id, target)?;
        let message_id = push.push_text(account_id, target, text).await?;
        Ok(SendResult {
            message_id,
            delivery: Delivery::Push,
        })
    }

    async fn media_or_push(
        &self,
        appended: OutboundAppendResult,
        account_id: &str,
        target: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> WecomResult<SendResult> {
        if let Some(message_id) = appended.message_id() {
            return Ok(SendResult {
                message_id,
                delivery: Delivery::Stream,
            });
        }
        let push = self.push_for(account_id, target)?;
        let message_id = push
            .push_media(account_id, target, media_url, caption)
            .await?;
        Ok(SendResult {
            message_id,
            delivery: Delivery::Push,
        })
    }

    fn push_for(&self, account_id: &str, target: &str) -> WecomResult<&Arc<dyn DirectPush>> {
        self.push.as_ref().ok_or_else(|| {
            warn!(account = %account_id, target = %target, "No open stream and no push route");
            WecomError::NoDeliveryPath {
                account_id: account_id.to_string(),
                target: target.to_string(),
            }
        })
    }
}

/// Markdown download link for a media URL.
pub fn media_link(url: &str) -> String {
    format!("[下载文件]({url})")
}

fn media_chunk(url: &str, caption: Option<&str>) -> String {
    match caption.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("{caption}\n\n{}", media_link(url)),
        None => media_link(url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingPush {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DirectPush for RecordingPush {
        async fn push_text(
            &self,
            account_id: &str,
            target: &str,
            text: &str,
        ) -> WecomResult<String> {
            self.sent.lock().unwrap().push((
                account_id.to_string(),
                target.to_string(),
                text.to_string(),
            ));
            Ok("push-1".to_string())
        }
    }

    fn table() -> Arc<StreamSessionTable> {
        Arc::new(StreamSessionTable::new(Duration::from_secs(60)))
    }

    #[test]
    fn test_append_to_active_stream() {
        let table = table();
        let id = table.open("bot", "user:alice");
        let bridge = OutboundStreamBridge::new(table.clone());

        let result = bridge.append("bot", "user:alice", "hi");
        assert_eq!(result.message_id(), Some(format!("stream:{id}")));
        assert!(bridge.try_append_to_active_stream("bot", "user:alice", " there"));
        assert_eq!(table.drain(&id).unwrap().content, "hi there");
    }

    #[test]
    fn test_no_active_stream() {
        let bridge = OutboundStreamBridge::new(table());
        let result = bridge.append("bot", "user:bob", "hi");
        assert_eq!(result, OutboundAppendResult::NoActiveStream);
        assert!(result.message_id().is_none());
        assert!(!bridge.finish("bot", "user:bob"));
    }

    #[test]
    fn test_finish_stops_appends() {
        let table = table();
        table.open("bot", "user:alice");
        let bridge = OutboundStreamBridge::new(table);
        assert!(bridge.finish("bot", "user:alice"));
        assert!(!bridge.try_append_to_active_stream("bot", "user:alice", "late"));
    }

    #[test]
    fn test_media_chunk() {
        assert_eq!(media_link("https://x/a.pdf"), "[下载文件](https://x/a.pdf)");
        assert_eq!(
            media_chunk("https://x/a.pdf", Some("Report")),
            "Report\n\n[下载文件](https://x/a.pdf)"
        );
        assert_eq!(media_chunk("https://x/a.pdf", Some("  ")), "[下载文件](https://x/a.pdf)");
    }

    #[tokio::test]
    async fn test_send_text_prefers_stream() {
        let table = table();
        table.open("bot", "user:alice");
        let push = Arc::new(RecordingPush {
            sent: Mutex::new(Vec::new()),
        });
        let outbound = WecomOutbound::new(
            OutboundStreamBridge::new(table),
            Some(push.clone() as Arc<dyn DirectPush>),
        );

        let result = outbound.send_text("bot", "user:alice", "hello").await.unwrap();
        assert_eq!(result.delivery, Delivery::Stream);
        assert!(result.message_id.starts_with("stream:"));
        assert!(push.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_media_falls_back_to_push() {
        let push = Arc::new(RecordingPush {
            sent: Mutex::new(Vec::new()),
        });
        let outbound = WecomOutbound::new(
            OutboundStreamBridge::new(table()),
            Some(push.clone() as Arc<dyn DirectPush>),
        );

        let result = outbound
            .send_media("bot", "user:alice", "https://x/a.png", Some("pic"))
            .await
            .unwrap();
        assert_eq!(result.delivery, Delivery::Push);
        assert_eq!(result.message_id, "push-1");
        assert_eq!(
            push.sent.lock().unwrap()[0].2,
            "pic\n\n[下载文件](https://x/a.png)"
        );
    }

    #[tokio::test]
    async fn test_send_text_to_superseded_stream_pushes() {
        let table = table();
        let first = table.open("bot", "user:alice");
        let push = Arc::new(RecordingPush {
            sent: Mutex::new(Vec::new()),
        });
        let outbound = WecomOutbound::new(
            OutboundStreamBridge::new(Arc::clone(&table)),
            Some(push.clone() as Arc<dyn DirectPush>),
        );

        let result = outbound
            .send_text_to(&first, "bot", "user:alice", "one")
            .await
            .unwrap();
        assert_eq!(result.message_id, format!("stream:{first}"));

        let second = table.open("bot", "user:alice");
        let result = outbound
            .send_text_to(&first, "bot", "user:alice", "two")
            .await
            .unwrap();
        assert_eq!(result.delivery, Delivery::Push);
        assert_eq!(push.sent.lock().unwrap()[0].2, "two");
        assert_eq!(table.drain(&second).unwrap().content, "");
        assert_eq!(table.drain(&first).unwrap().content, "one");
    }

    #[test]
    fn test_append_to_and_close_one_stream() {
        let table = table();
        let bridge = OutboundStreamBridge::new(Arc::clone(&table));
        let id = table.open("bot", "user:alice");
        assert!(bridge.append_to(&id, "x").appended());
        assert!(bridge.close(&id));
        assert!(!bridge.close("missing"));
        assert_eq!(bridge.append_to(&id, "y"), OutboundAppendResult::NoActiveStream);
        assert_eq!(bridge.append_to("missing", "y"), OutboundAppendResult::NoActiveStream);
    }

    #[tokio::test]
    async fn test_no_delivery_path() {
        let outbound = WecomOutbound::new(OutboundStreamBridge::new(table()), None);
        let err = outbound.send_text("bot", "user:alice", "x").await.unwrap_err();
        assert!(matches!(err, WecomError::NoDeliveryPath { .. }));
    }
}
