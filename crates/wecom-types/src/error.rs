//! Shared error types for the WeCom callback bridge.

use std::fmt;
use thiserror::Error;

/// The specific check that rejected a ciphertext.
///
/// Only ever written to logs. Callers of the webhook see an opaque
/// rejection so the individual checks cannot be used as an oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// The ciphertext was not valid base64.
    Base64,
    /// The ciphertext was empty or not a whole number of cipher blocks.
    BlockAlignment,
    /// The trailing pad count was out of range or the pad bytes differed.
    Padding,
    /// The frame was too short to hold the random prefix and length field.
    Truncated,
    /// The declared message length does not fit the recovered frame.
    LengthMismatch,
    /// The trailing receiver id did not match the registered one.
    ReceiverMismatch,
    /// The recovered message was not valid UTF-8.
    Utf8,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecryptFailure::Base64 => "invalid base64",
            DecryptFailure::BlockAlignment => "ciphertext not block aligned",
            DecryptFailure::Padding => "invalid padding",
            DecryptFailure::Truncated => "frame truncated",
            DecryptFailure::LengthMismatch => "declared length mismatch",
            DecryptFailure::ReceiverMismatch => "receiver id mismatch",
            DecryptFailure::Utf8 => "plaintext is not utf-8",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the callback bridge.
#[derive(Error, Debug)]
pub enum WecomError {
    /// Missing query parameters or an unparsable body.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The request signature did not verify against any registered token.
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// The request timestamp is stale or its nonce was already seen.
    #[error("Replayed or stale request")]
    Replay,

    /// The encrypted payload failed one of the codec integrity checks.
    #[error("Decryption failed: {0}")]
    DecryptionFailure(DecryptFailure),

    /// No target is registered on the requested path.
    #[error("Unknown webhook path: {0}")]
    UnknownPath(String),

    /// No target is registered for the requested account.
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// Encrypting or signing a response failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// The encoding AES key is not a valid 43-character key.
    #[error("Invalid encoding key: {0}")]
    InvalidKey(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An outbound push was attempted and failed.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Neither an open stream nor a push route exists for the target.
    #[error("No delivery path for {account_id}/{target}")]
    NoDeliveryPath {
        /// Account the send was addressed from.
        account_id: String,
        /// Routing target key.
        target: String,
    },

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WecomError {
    /// HTTP status code the webhook surface answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            WecomError::MalformedRequest(_) | WecomError::DecryptionFailure(_) => 400,
            WecomError::SignatureMismatch | WecomError::Replay => 403,
            WecomError::UnknownPath(_) | WecomError::UnknownAccount(_) => 404,
            WecomError::Delivery(_) => 502,
            _ => 500,
        }
    }

    /// Whether this error is a security rejection (never retried).
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            WecomError::SignatureMismatch | WecomError::Replay | WecomError::DecryptionFailure(_)
        )
    }
}

impl From<DecryptFailure> for WecomError {
    fn from(cause: DecryptFailure) -> Self {
        WecomError::DecryptionFailure(cause)
    }
}

/// Alias for Result with WecomError.
pub type WecomResult<T> = Result<T, WecomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WecomError::MalformedRequest("x".into()).status_code(), 400);
        assert_eq!(
            WecomError::DecryptionFailure(DecryptFailure::Padding).status_code(),
            400
        );
        assert_eq!(WecomError::SignatureMismatch.status_code(), 403);
        assert_eq!(WecomError::Replay.status_code(), 403);
        assert_eq!(WecomError::UnknownPath("/x".into()).status_code(), 404);
        assert_eq!(WecomError::UnknownAccount("a".into()).status_code(), 404);
        assert_eq!(WecomError::Encryption("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_decrypt_failure_display_is_opaque_in_status_only() {
        let err = WecomError::from(DecryptFailure::ReceiverMismatch);
        assert!(err.to_string().contains("receiver id mismatch"));
        assert!(err.is_security_rejection());
        assert!(!WecomError::UnknownPath("/".into()).is_security_rejection());
    }
}
