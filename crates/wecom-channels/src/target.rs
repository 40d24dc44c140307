//! Registered webhook targets and the reply-pipeline seam.
//!
//! The dispatcher knows nothing about how replies are produced. It hands each
//! decrypted message to an [`InboundHandler`] (implemented by the embedding
//! application) together with the stream it opened for the conversation.

use crate::crypto::CallbackCrypto;
use crate::signature;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use wecom_types::config::AccountConfig;
use wecom_types::error::WecomResult;
use wecom_types::message::InboundMessage;
use zeroize::Zeroizing;

/// Where a message is being handled.
#[derive(Debug, Clone)]
pub struct InboundContext {
    /// Account that received the message.
    pub account_id: String,
    /// Routing target key (see [`InboundHandler::route`]).
    pub target: String,
    /// Stream opened for this conversation turn.
    pub stream_id: String,
}

/// How the reply pipeline answered a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Reply generation continues asynchronously through the outbound bridge.
    Streaming,
    /// The full reply is already known.
    Immediate(String),
    /// Nothing to say.
    Ignore,
}

/// Reply pipeline operations needed by the dispatcher.
///
/// Implemented by the embedding application.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Derive the routing target key for a message.
    fn route(&self, _account_id: &str, message: &InboundMessage) -> String {
        message.target_key()
    }

    /// Hand a message to the reply pipeline.
    ///
    /// Must not wait for reply generation to finish; long work is spawned
    /// and written back through the outbound bridge.
    async fn handle(&self, ctx: InboundContext, message: InboundMessage) -> ReplyDisposition;
}

/// Immutable binding of an account to a webhook path.
pub struct RegisteredTarget {
    pub(crate) registration_id: String,
    account_id: String,
    /// SECURITY: callback token is zeroized on drop.
    token: Zeroizing<String>,
    crypto: CallbackCrypto,
    path: String,
    welcome_text: Option<String>,
    handler: Arc<dyn InboundHandler>,
}

impl RegisteredTarget {
    /// Build a target from an account entry.
    ///
    /// `path` overrides the account's configured `webhook_path`.
    pub fn from_account(
        account: &AccountConfig,
        handler: Arc<dyn InboundHandler>,
        path: Option<&str>,
    ) -> WecomResult<Self> {
        Ok(Self {
            registration_id: uuid::Uuid::new_v4().to_string(),
            account_id: account.account_id.clone(),
            token: account.token.clone(),
            crypto: CallbackCrypto::new(&account.encoding_aes_key, &account.receive_id)?,
            path: normalize_path(path.unwrap_or(&account.webhook_path)),
            welcome_text: account.welcome_text.clone().filter(|t| !t.is_empty()),
            handler,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn crypto(&self) -> &CallbackCrypto {
        &self.crypto
    }

    pub fn welcome_text(&self) -> Option<&str> {
        self.welcome_text.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn InboundHandler> {
        &self.handler
    }

    /// Verify a callback signature against this target's token.
    pub fn verify(&self, timestamp: &str, nonce: &str, encrypted: &str, sig: &str) -> bool {
        signature::verify(&self.token, timestamp, nonce, encrypted, sig)
    }

    /// Sign a response with this target's token.
    pub fn sign(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        signature::sign(&self.token, timestamp, nonce, encrypted)
    }
}

impl fmt::Debug for RegisteredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTarget")
            .field("account_id", &self.account_id)
            .field("path", &self.path)
            .field("receive_id", &self.crypto.receive_id())
            .finish_non_exhaustive()
    }
}

/// Leading slash, no trailing slash (except the root path).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
