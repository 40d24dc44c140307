//! Active replies through the one-shot `response_url` of a callback.
//!
//! Each inbound message carries a `response_url` that accepts a single
//! markdown post for a limited time. The latest one per conversation is
//! remembered and consumed by the next push.

use crate::outbound::DirectPush;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wecom_types::error::{WecomError, WecomResult};

/// How long the platform honours a `response_url`.
pub const DEFAULT_RESPONSE_URL_TTL: Duration = Duration::from_secs(60 * 60);

/// [`DirectPush`] over remembered response URLs.
pub struct ResponseUrlPush {
    client: reqwest::Client,
    urls: DashMap<(String, String), (String, Instant)>,
    ttl: Duration,
}

impl ResponseUrlPush {
    pub fn new(ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls: DashMap::new(),
            ttl,
        }
    }

    /// Remember the latest response URL for a conversation.
    pub fn remember(&self, account_id: &str, target: &str, url: &str) {
        if url.is_empty() {
            return;
        }
        self.urls.insert(
            (account_id.to_string(), target.to_string()),
            (url.to_string(), Instant::now()),
        );
    }

    /// Take the remembered URL if it has not expired.
    fn take(&self, account_id: &str, target: &str) -> Option<String> {
        let (_, (url, stored)) = self
            .urls
            .remove(&(account_id.to_string(), target.to_string()))?;
        (stored.elapsed() <= self.ttl).then_some(url)
    }

    /// Drop expired URLs. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.urls.len();
        let ttl = self.ttl;
        self.urls.retain(|_, (_, stored)| stored.elapsed() <= ttl);
        before.saturating_sub(self.urls.len())
    }

    /// Run `purge` every `interval` until `shutdown` flips to true.
    pub fn spawn_purger(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let push = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = push.purge();
                        if purged > 0 {
                            info!(purged, remaining = push.len(), "Response URL purge");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    async fn post_markdown(&self, url: &str, content: &str) -> WecomResult<()> {
        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "content": content,
            }
        });

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| WecomError::Delivery(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_body = resp.text().await.unwrap_or_default();
            return Err(WecomError::Delivery(format!(
                "response_url returned {status}: {err_body}"
            )));
        }

        // {"errcode": 0, "errmsg": "ok"} on success
        let result: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| WecomError::Delivery(e.to_string()))?;
        let errcode = result["errcode"].as_i64().unwrap_or(0);
        if errcode != 0 {
            return Err(WecomError::Delivery(format!(
                "response_url error {errcode}: {}",
                result["errmsg"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(())
    }
}

impl Default for ResponseUrlPush {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_URL_TTL)
    }
}

#[async_trait]
impl DirectPush for ResponseUrlPush {
    async fn push_text(&self, account_id: &str, target: &str, text: &str) -> WecomResult<String> {
        let url = self.take(account_id, target).ok_or_else(|| {
            warn!(account = %account_id, target = %target, "No usable response_url");
            WecomError::NoDeliveryPath {
                account_id: account_id.to_string(),
                target: target.to_string(),
            }
        })?;
        self.post_markdown(&url, text).await?;
        let message_id = format!("push:{}", uuid::Uuid::new_v4().simple());
        debug!(account = %account_id, target = %target, message_id = %message_id, "Pushed via response_url");
        Ok(message_id)
    }
}
