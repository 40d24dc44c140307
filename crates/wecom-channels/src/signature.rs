//! Callback signatures.
//!
//! `msg_signature = hex(sha1(sorted(token, timestamp, nonce, encrypt).concat()))`

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Compute the signature over the four callback strings.
pub fn sign(token: &str, timestamp: &str, nonce: &str, encrypted: &str) -> String {
    let mut parts = [token, timestamp, nonce, encrypted];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Verify a signature (constant-time comparison).
pub fn verify(token: &str, timestamp: &str, nonce: &str, encrypted: &str, signature: &str) -> bool {
    let expected = sign(token, timestamp, nonce, encrypted);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
