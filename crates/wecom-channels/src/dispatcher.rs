//! Webhook dispatcher: verify, decrypt, route, reply, encrypt, respond.
//!
//! Each request walks the stages in [`Stage`] and either produces an
//! encrypted reply or fails at one of them. The platform gives a callback a
//! short, bounded request/response cycle, so long replies are never awaited
//! here: the dispatcher opens a stream session, answers with a placeholder
//! and lets the platform poll for the rest.

use crate::outbound::OutboundStreamBridge;
use crate::replay::{ReplayGuard, ReplayVerdict};
use crate::stream::{StreamSessionTable, StreamStatus};
use crate::target::{
    normalize_path, InboundContext, InboundHandler, RegisteredTarget, ReplyDisposition,
};
use axum::http::{Method, StatusCode};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wecom_types::config::{AccountConfig, SecurityConfig, StreamConfig};
use wecom_types::error::{WecomError, WecomResult};
use wecom_types::message::{
    EncryptedEnvelope, EncryptedReply, InboundMessage, MessageKind, OutgoingReply,
};

const NONCE_LEN: usize = 16;
const ENTER_CHAT_EVENT: &str = "enter_chat";

/// Request lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Verifying,
    Decrypting,
    Routing,
    Replying,
    Responding,
}

/// A request that stopped at `stage`.
#[derive(Debug)]
pub struct Failed {
    pub stage: Stage,
    pub error: WecomError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, Failed>;
}

impl<T> AtStage<T> for WecomResult<T> {
    fn at(self, stage: Stage) -> Result<T, Failed> {
        self.map_err(|error| Failed { stage, error })
    }
}

/// One inbound HTTP request, reduced to what the protocol needs.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Build a request from a raw (still percent-encoded) query string.
    pub fn new(method: Method, path: &str, raw_query: Option<&str>, body: Vec<u8>) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: parse_query(raw_query.unwrap_or("")),
            body,
        }
    }

    fn param(&self, name: &'static str) -> WecomResult<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                WecomError::MalformedRequest(format!("missing query parameter '{name}'"))
            })
    }
}

/// Parse a query string into a map (last value wins).
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .collect()
}

/// One outbound HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookResponse {
    fn json(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json",
            body,
        }
    }

    fn text(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/plain; charset=utf-8",
            body,
        }
    }

    fn empty() -> Self {
        Self::text(String::new())
    }

    /// Opaque rejection: status code and its canonical reason, never the cause.
    fn rejection(status: StatusCode) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: status.canonical_reason().unwrap_or("error").to_string(),
        }
    }
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub streams: usize,
    pub nonces: usize,
    pub messages: usize,
}

/// Routes webhook callbacks to registered targets and owns stream lifecycles.
pub struct WebhookDispatcher {
    /// Targets by normalized path. Several accounts may share a path.
    targets: DashMap<String, Vec<Arc<RegisteredTarget>>>,
    streams: Arc<StreamSessionTable>,
    replay: ReplayGuard,
    /// `(account, msgid)` -> stream opened for it, to absorb platform retries.
    recent: DashMap<(String, String), (String, Instant)>,
    stream_config: StreamConfig,
}

impl WebhookDispatcher {
    pub fn new(stream_config: StreamConfig, security: &SecurityConfig) -> Self {
        let ttl = Duration::from_secs(stream_config.ttl_secs);
        Self {
            targets: DashMap::new(),
            streams: Arc::new(StreamSessionTable::new(ttl)),
            replay: ReplayGuard::new(security),
            recent: DashMap::new(),
            stream_config,
        }
    }

    /// Shared stream table.
    pub fn streams(&self) -> &Arc<StreamSessionTable> {
        &self.streams
    }

    /// Outbound bridge over this dispatcher's stream table.
    pub fn bridge(&self) -> OutboundStreamBridge {
        OutboundStreamBridge::new(Arc::clone(&self.streams))
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register an account on its webhook path (or `path` when given).
    pub fn register_target(
        self: &Arc<Self>,
        account: &AccountConfig,
        handler: Arc<dyn InboundHandler>,
        path: Option<&str>,
    ) -> WecomResult<WebhookRegistration> {
        let target = RegisteredTarget::from_account(account, handler, path)?;
        Ok(self.register(target))
    }

    /// Bind a target into the routing table.
    ///
    /// A target for the same account on the same path is replaced.
    pub fn register(self: &Arc<Self>, target: RegisteredTarget) -> WebhookRegistration {
        let registration = WebhookRegistration {
            dispatcher: Arc::downgrade(self),
            registration_id: target.registration_id.clone(),
            account_id: target.account_id().to_string(),
            path: target.path().to_string(),
        };

        let mut slot = self.targets.entry(target.path().to_string()).or_default();
        let before = slot.len();
        slot.retain(|t| t.account_id() != target.account_id());
        if slot.len() != before {
            warn!(
                account = %target.account_id(),
                path = %target.path(),
                "Replacing existing webhook target"
            );
        }
        info!(account = %target.account_id(), path = %target.path(), "Registered webhook target");
        slot.push(Arc::new(target));
        registration
    }

    fn unregister(&self, path: &str, registration_id: &str) -> bool {
        let mut removed = false;
        if let Some(mut slot) = self.targets.get_mut(path) {
            let before = slot.len();
            slot.retain(|t| t.registration_id != registration_id);
            removed = slot.len() != before;
        }
        self.targets.remove_if(path, |_, slot| slot.is_empty());
        removed
    }

    /// Registered paths.
    pub fn paths(&self) -> Vec<String> {
        self.targets.iter().map(|e| e.key().clone()).collect()
    }

    /// Target registered for an account, on any path.
    pub fn target_for_account(&self, account_id: &str) -> WecomResult<Arc<RegisteredTarget>> {
        self.targets
            .iter()
            .find_map(|e| e.value().iter().find(|t| t.account_id() == account_id).cloned())
            .ok_or_else(|| WecomError::UnknownAccount(account_id.to_string()))
    }

    fn targets_for(&self, path: &str) -> WecomResult<Vec<Arc<RegisteredTarget>>> {
        self.targets
            .get(path)
            .map(|slot| slot.value().clone())
            .filter(|slot| !slot.is_empty())
            .ok_or_else(|| WecomError::UnknownPath(path.to_string()))
    }

    // ── Request handling ────────────────────────────────────────────

    /// Handle one webhook request end to end.
    pub async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
        let path = normalize_path(&request.path);
        debug!(method = %request.method, path = %path, stage = ?Stage::Received, "Webhook request");

        let result = match request.method {
            Method::POST => self.handle_callback(&path, &request).await,
            Method::GET => self.verify_url(&path, &request),
            _ => return WebhookResponse::rejection(StatusCode::METHOD_NOT_ALLOWED),
        };

        match result {
            Ok(response) => response,
            Err(Failed { stage, error }) => {
                let status = StatusCode::from_u16(error.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    warn!(path = %path, stage = ?stage, error = %error, "Webhook request failed");
                } else {
                    warn!(path = %path, stage = ?stage, status = status.as_u16(), error = %error, "Webhook request rejected");
                }
                WebhookResponse::rejection(status)
            }
        }
    }

    async fn handle_callback(
        &self,
        path: &str,
        request: &WebhookRequest,
    ) -> Result<WebhookResponse, Failed> {
        let targets = self.targets_for(path).at(Stage::Routing)?;

        // Verifying
        let timestamp = request.param("timestamp").at(Stage::Verifying)?;
        let nonce = request.param("nonce").at(Stage::Verifying)?;
        let signature = request.param("msg_signature").at(Stage::Verifying)?;
        let envelope: EncryptedEnvelope = serde_json::from_slice(&request.body)
            .map_err(|e| WecomError::MalformedRequest(format!("invalid body: {e}")))
            .at(Stage::Verifying)?;

        let target = targets
            .iter()
            .find(|t| t.verify(timestamp, nonce, &envelope.encrypt, signature))
            .cloned()
            .ok_or(WecomError::SignatureMismatch)
            .at(Stage::Verifying)?;

        match self
            .replay
            .check(target.account_id(), timestamp, nonce, Utc::now().timestamp())
        {
            ReplayVerdict::Fresh => {}
            verdict => {
                debug!(account = %target.account_id(), ?verdict, "Replay guard refused request");
                return Err(WecomError::Replay).at(Stage::Verifying);
            }
        }

        // Decrypting
        let plaintext = target
            .crypto()
            .decrypt(&envelope.encrypt)
            .at(Stage::Decrypting)?;

        // Routing
        let message: InboundMessage = serde_json::from_str(&plaintext)
            .map_err(|e| WecomError::MalformedRequest(format!("invalid payload: {e}")))
            .at(Stage::Routing)?;
        let reply = self.route(&target, message).await;

        // Replying, Responding
        match reply {
            Some(reply) => self.respond(&target, &reply),
            None => Ok(WebhookResponse::empty()),
        }
    }

    /// GET URL verification: echo back the decrypted `echostr`.
    fn verify_url(&self, path: &str, request: &WebhookRequest) -> Result<WebhookResponse, Failed> {
        let targets = self.targets_for(path).at(Stage::Routing)?;
        let timestamp = request.param("timestamp").at(Stage::Verifying)?;
        let nonce = request.param("nonce").at(Stage::Verifying)?;
        let signature = request.param("msg_signature").at(Stage::Verifying)?;
        // Form decoding turns a raw '+' of the base64 value into a space.
        let echostr = request
            .param("echostr")
            .at(Stage::Verifying)?
            .replace(' ', "+");

        let target = targets
            .iter()
            .find(|t| t.verify(timestamp, nonce, &echostr, signature))
            .ok_or(WecomError::SignatureMismatch)
            .at(Stage::Verifying)?;

        let plaintext = target.crypto().decrypt(&echostr).at(Stage::Decrypting)?;
        info!(account = %target.account_id(), path = %path, "Webhook URL verified");
        Ok(WebhookResponse::text(plaintext))
    }

    async fn route(
        &self,
        target: &Arc<RegisteredTarget>,
        message: InboundMessage,
    ) -> Option<OutgoingReply> {
        if let MessageKind::StreamPoll(stream_id) = message.kind() {
            return Some(self.poll_stream(target.account_id(), stream_id));
        }
        if let MessageKind::Event(event) = message.kind() {
            debug!(account = %target.account_id(), event = %event, "Platform event");
            return match (event, target.welcome_text()) {
                (ENTER_CHAT_EVENT, Some(welcome)) => Some(OutgoingReply::text(welcome)),
                _ => None,
            };
        }
        self.dispatch_message(target, message).await
    }

    async fn dispatch_message(
        &self,
        target: &Arc<RegisteredTarget>,
        message: InboundMessage,
    ) -> Option<OutgoingReply> {
        let account_id = target.account_id();
        let handler = target.handler();
        let route = handler.route(account_id, &message);

        let stream_id = if message.msgid.is_empty() {
            self.streams.open(account_id, &route)
        } else {
            match self
                .recent
                .entry((account_id.to_string(), message.msgid.clone()))
            {
                Entry::Occupied(entry) => {
                    let existing = entry.get().0.clone();
                    drop(entry);
                    debug!(account = %account_id, msgid = %message.msgid, stream = %existing, "Retried message, replaying stream state");
                    return Some(self.poll_stream(account_id, &existing));
                }
                Entry::Vacant(entry) => {
                    let id = self.streams.open(account_id, &route);
                    entry.insert((id.clone(), Instant::now()));
                    id
                }
            }
        };

        info!(
            account = %account_id,
            target = %route,
            stream = %stream_id,
            msgtype = %message.msgtype,
            "Dispatching inbound message"
        );

        let ctx = InboundContext {
            account_id: account_id.to_string(),
            target: route,
            stream_id: stream_id.clone(),
        };
        match handler.handle(ctx, message).await {
            ReplyDisposition::Streaming => Some(self.poll_stream(account_id, &stream_id)),
            ReplyDisposition::Immediate(text) => {
                self.streams.append(&stream_id, &text);
                self.streams.close(&stream_id);
                Some(self.poll_stream(account_id, &stream_id))
            }
            ReplyDisposition::Ignore => {
                self.streams.close(&stream_id);
                None
            }
        }
    }

    /// Current state of an account's stream as a reply.
    ///
    /// Streams of other accounts are answered like unknown ones.
    fn poll_stream(&self, account_id: &str, stream_id: &str) -> OutgoingReply {
        match self.streams.drain_for(account_id, stream_id) {
            Some(drained) => {
                let finish = drained.status == StreamStatus::Closed;
                let content = if drained.content.is_empty() && !finish {
                    self.stream_config.placeholder.clone()
                } else {
                    truncate_utf8(&drained.content, self.stream_config.max_content_bytes)
                        .to_string()
                };
                OutgoingReply::stream(stream_id, content, finish)
            }
            None => {
                debug!(
                    account = %account_id,
                    stream = %stream_id,
                    "Poll for unknown, expired or foreign stream"
                );
                OutgoingReply::stream(stream_id, "", true)
            }
        }
    }

    fn respond(
        &self,
        target: &RegisteredTarget,
        reply: &OutgoingReply,
    ) -> Result<WebhookResponse, Failed> {
        let plaintext = serde_json::to_string(reply)
            .map_err(WecomError::from)
            .at(Stage::Replying)?;
        let encrypt = target.crypto().encrypt(&plaintext).at(Stage::Responding)?;
        let timestamp = Utc::now().timestamp();
        let nonce = random_nonce();
        let msgsignature = target.sign(&timestamp.to_string(), &nonce, &encrypt);
        let body = serde_json::to_string(&EncryptedReply {
            encrypt,
            msgsignature,
            timestamp,
            nonce,
        })
        .map_err(WecomError::from)
        .at(Stage::Responding)?;
        Ok(WebhookResponse::json(body))
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Evict idle streams, stale nonces and forgotten message ids.
    pub fn sweep(&self) -> SweepStats {
        let ttl = self.streams.ttl();
        let before = self.recent.len();
        self.recent.retain(|_, (_, seen)| seen.elapsed() <= ttl);
        SweepStats {
            streams: self.streams.evict_expired(),
            nonces: self.replay.purge(),
            messages: before.saturating_sub(self.recent.len()),
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = dispatcher.sweep();
                        if stats != SweepStats::default() {
                            debug!(?stats, live_streams = dispatcher.streams.len(), "Maintenance sweep");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Webhook maintenance stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Teardown handle returned by registration.
#[derive(Debug)]
pub struct WebhookRegistration {
    dispatcher: Weak<WebhookDispatcher>,
    registration_id: String,
    account_id: String,
    path: String,
}

impl WebhookRegistration {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Remove the target. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return false;
        };
        let removed = dispatcher.unregister(&self.path, &self.registration_id);
        if removed {
            info!(account = %self.account_id, path = %self.path, "Unregistered webhook target");
        }
        removed
    }
}

fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
