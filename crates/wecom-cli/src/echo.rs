//! Demo reply pipeline: streams the user's message back.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use wecom_channels::outbound::{Delivery, WecomOutbound};
use wecom_channels::push::ResponseUrlPush;
use wecom_channels::target::{InboundContext, InboundHandler, ReplyDisposition};
use wecom_types::message::InboundMessage;

/// Echoes text word by word into the stream the message opened.
///
/// If that stream is superseded or expires mid-reply, the remainder goes out
/// through the message's `response_url`.
pub struct EchoHandler {
    outbound: WecomOutbound,
    push: Arc<ResponseUrlPush>,
    delay: Duration,
}

impl EchoHandler {
    pub fn new(outbound: WecomOutbound, push: Arc<ResponseUrlPush>, delay: Duration) -> Self {
        Self {
            outbound,
            push,
            delay,
        }
    }
}

#[async_trait]
impl InboundHandler for EchoHandler {
    async fn handle(&self, ctx: InboundContext, message: InboundMessage) -> ReplyDisposition {
        if let Some(url) = message.response_url.as_deref() {
            self.push.remember(&ctx.account_id, &ctx.target, url);
        }

        if let Some(media_url) = message.media_url() {
            let outbound = self.outbound.clone();
            let media_url = media_url.to_string();
            tokio::spawn(async move {
                let sent = outbound
                    .send_media_to(
                        &ctx.stream_id,
                        &ctx.account_id,
                        &ctx.target,
                        &media_url,
                        Some("Received"),
                    )
                    .await;
                match sent {
                    Ok(result) if result.delivery == Delivery::Stream => {
                        outbound.bridge().close(&ctx.stream_id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(account = %ctx.account_id, target = %ctx.target, error = %e, "Echo media failed");
                    }
                }
            });
            return ReplyDisposition::Streaming;
        }

        let Some(text) = message.text_content().map(str::to_string) else {
            debug!(account = %ctx.account_id, msgtype = %message.msgtype, "Nothing to echo");
            return ReplyDisposition::Ignore;
        };

        let outbound = self.outbound.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            let words: Vec<&str> = text.split_inclusive(' ').collect();
            for (i, word) in words.iter().enumerate() {
                if !outbound.bridge().append_to(&ctx.stream_id, word).appended() {
                    let rest = words[i..].concat();
                    if let Err(e) = outbound
                        .send_text_to(&ctx.stream_id, &ctx.account_id, &ctx.target, &rest)
                        .await
                    {
                        warn!(account = %ctx.account_id, target = %ctx.target, error = %e, "Echo fallback failed");
                    }
                    return;
                }
                tokio::time::sleep(delay).await;
            }
            outbound.bridge().close(&ctx.stream_id);
        });
        ReplyDisposition::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wecom_channels::outbound::{DirectPush, OutboundStreamBridge};
    use wecom_channels::stream::{StreamSessionTable, StreamStatus};

    fn handler(table: &Arc<StreamSessionTable>) -> EchoHandler {
        let push = Arc::new(ResponseUrlPush::default());
        let outbound = WecomOutbound::new(
            OutboundStreamBridge::new(Arc::clone(table)),
            Some(push.clone() as Arc<dyn DirectPush>),
        );
        EchoHandler::new(outbound, push, Duration::from_millis(1))
    }

    fn ctx(stream_id: &str) -> InboundContext {
        InboundContext {
            account_id: "bot".to_string(),
            target: "user:alice".to_string(),
            stream_id: stream_id.to_string(),
        }
    }

    async fn wait_closed(table: &StreamSessionTable, id: &str) {
        for _ in 0..200 {
            if table.status(id) == Some(StreamStatus::Closed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream {id} never closed");
    }

    #[tokio::test]
    async fn test_echoes_text_into_stream() {
        let table = Arc::new(StreamSessionTable::new(Duration::from_secs(60)));
        let id = table.open("bot", "user:alice");
        let message: InboundMessage = serde_json::from_value(serde_json::json!({
            "msgtype": "text",
            "from": { "userid": "alice" },
            "text": { "content": "hello there world" }
        }))
        .unwrap();

        let disposition = handler(&table).handle(ctx(&id), message).await;
        assert_eq!(disposition, ReplyDisposition::Streaming);
        wait_closed(&table, &id).await;
        assert_eq!(table.drain(&id).unwrap().content, "hello there world");
    }

    #[tokio::test]
    async fn test_echoes_media_link() {
        let table = Arc::new(StreamSessionTable::new(Duration::from_secs(60)));
        let id = table.open("bot", "user:alice");
        let message: InboundMessage = serde_json::from_value(serde_json::json!({
            "msgtype": "image",
            "image": { "url": "https://x/a.png" }
        }))
        .unwrap();

        handler(&table).handle(ctx(&id), message).await;
        wait_closed(&table, &id).await;
        assert_eq!(
            table.drain(&id).unwrap().content,
            "Received\n\n[下载文件](https://x/a.png)"
        );
    }

    #[tokio::test]
    async fn test_superseded_reply_stays_out_of_new_stream() {
        let table = Arc::new(StreamSessionTable::new(Duration::from_secs(60)));
        let slow = {
            let push = Arc::new(ResponseUrlPush::default());
            let outbound = WecomOutbound::new(
                OutboundStreamBridge::new(Arc::clone(&table)),
                Some(push.clone() as Arc<dyn DirectPush>),
            );
            EchoHandler::new(outbound, push, Duration::from_millis(20))
        };
        let text = |content: &str| -> InboundMessage {
            serde_json::from_value(serde_json::json!({
                "msgtype": "text",
                "text": { "content": content }
            }))
            .unwrap()
        };

        let first = table.open("bot", "user:alice");
        slow.handle(ctx(&first), text("a1 a2 a3 a4 a5 a6")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = table.open("bot", "user:alice");
        handler(&table).handle(ctx(&second), text("b1 b2 b3")).await;
        wait_closed(&table, &second).await;
        // Let the first task notice its stream is gone.
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(table.drain(&second).unwrap().content, "b1 b2 b3");
        let first_content = table.drain(&first).unwrap().content;
        assert!(first_content.starts_with("a1 "));
        assert!(!first_content.contains('b'));
    }

    #[tokio::test]
    async fn test_empty_message_ignored() {
        let table = Arc::new(StreamSessionTable::new(Duration::from_secs(60)));
        let message: InboundMessage =
            serde_json::from_value(serde_json::json!({ "msgtype": "mixed" })).unwrap();
        let disposition = handler(&table).handle(ctx("s"), message).await;
        assert_eq!(disposition, ReplyDisposition::Ignore);
    }
}
