//! Callback payload codec.
//!
//! Frame layout before encryption:
//!
//! ```text
//! random[16] | u32 big-endian message length | message (UTF-8) | receiver id | pad
//! ```
//!
//! The frame is padded to a 32-byte boundary (every pad byte holds the pad
//! length, a full block when already aligned) and encrypted with AES-256-CBC.
//! The key is the 32-byte base64-decoded encoding key and the IV is its first
//! 16 bytes. The whole key is used, so this is AES-256 and not AES-128 over
//! half of it. Decryption checks padding, declared length and receiver id, and
//! any failure rejects the whole payload.
//!
//! There is no MAC. A flip in bytes 4..16 of the first cipher block turns
//! into the same flip in the message and still decrypts; integrity comes
//! from the callback signature over the ciphertext ([`crate::signature`]).

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use rand::RngCore;
use wecom_types::config::ENCODING_KEY_LEN;
use wecom_types::error::{DecryptFailure, WecomError, WecomResult};
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;
const HEADER_LEN: usize = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const AES_BLOCK: usize = 16;
/// Pad block size used by the platform (larger than the AES block).
pub const PAD_BLOCK: usize = 32;

/// Platform keys are 43 chars and may carry non-zero trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encrypts and decrypts callback payloads for one account.
pub struct CallbackCrypto {
    /// SECURITY: AES key material is zeroized on drop.
    key: Zeroizing<[u8; KEY_LEN]>,
    receive_id: String,
}

impl CallbackCrypto {
    /// Build a codec from the 43-character encoding key and receiver id.
    pub fn new(encoding_aes_key: &str, receive_id: &str) -> WecomResult<Self> {
        Ok(Self {
            key: decode_key(encoding_aes_key)?,
            receive_id: receive_id.to_string(),
        })
    }

    /// Receiver id bound into every frame.
    pub fn receive_id(&self) -> &str {
        &self.receive_id
    }

    /// Encrypt `plaintext` with a fresh random prefix, returning base64.
    pub fn encrypt(&self, plaintext: &str) -> WecomResult<String> {
        let mut prefix = [0u8; RANDOM_PREFIX_LEN];
        rand::thread_rng().fill_bytes(&mut prefix);
        self.encrypt_with_prefix(plaintext, &prefix)
    }

    fn encrypt_with_prefix(
        &self,
        plaintext: &str,
        prefix: &[u8; RANDOM_PREFIX_LEN],
    ) -> WecomResult<String> {
        let message = plaintext.as_bytes();
        let declared = u32::try_from(message.len())
            .map_err(|_| WecomError::Encryption("plaintext exceeds 4 GiB".to_string()))?;

        let mut frame = Vec::with_capacity(
            HEADER_LEN + message.len() + self.receive_id.len() + PAD_BLOCK,
        );
        frame.extend_from_slice(prefix);
        frame.extend_from_slice(&declared.to_be_bytes());
        frame.extend_from_slice(message);
        frame.extend_from_slice(self.receive_id.as_bytes());
        pad(&mut frame);

        let cipher = Aes256CbcEnc::new(
            GenericArray::from_slice(&self.key[..]),
            GenericArray::from_slice(&self.key[..IV_LEN]),
        );
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&frame);
        Ok(STANDARD.encode(ciphertext))
    }

    /// Decrypt a base64 ciphertext, verifying padding, length and receiver id.
    pub fn decrypt(&self, ciphertext: &str) -> WecomResult<String> {
        self.open_frame(ciphertext).map_err(WecomError::DecryptionFailure)
    }

    fn open_frame(&self, ciphertext: &str) -> Result<String, DecryptFailure> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| DecryptFailure::Base64)?;
        if raw.is_empty() || raw.len() % AES_BLOCK != 0 {
            return Err(DecryptFailure::BlockAlignment);
        }

        let cipher = Aes256CbcDec::new(
            GenericArray::from_slice(&self.key[..]),
            GenericArray::from_slice(&self.key[..IV_LEN]),
        );
        let frame = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&raw)
            .map_err(|_| DecryptFailure::BlockAlignment)?;
        let frame = unpad(&frame)?;

        if frame.len() < HEADER_LEN {
            return Err(DecryptFailure::Truncated);
        }
        let mut length_field = [0u8; LENGTH_FIELD_LEN];
        length_field.copy_from_slice(&frame[RANDOM_PREFIX_LEN..HEADER_LEN]);
        let declared = u32::from_be_bytes(length_field) as usize;

        let body = &frame[HEADER_LEN..];
        if declared > body.len() {
            return Err(DecryptFailure::LengthMismatch);
        }
        let (message, receiver) = body.split_at(declared);
        if receiver != self.receive_id.as_bytes() {
            return Err(DecryptFailure::ReceiverMismatch);
        }

        String::from_utf8(message.to_vec()).map_err(|_| DecryptFailure::Utf8)
    }
}

/// Encrypt `plaintext` for the given key and receiver id.
pub fn encrypt(plaintext: &str, encoding_aes_key: &str, receive_id: &str) -> WecomResult<String> {
    CallbackCrypto::new(encoding_aes_key, receive_id)?.encrypt(plaintext)
}

/// Decrypt `ciphertext` for the given key and receiver id.
pub fn decrypt(ciphertext: &str, encoding_aes_key: &str, receive_id: &str) -> WecomResult<String> {
    CallbackCrypto::new(encoding_aes_key, receive_id)?.decrypt(ciphertext)
}

fn decode_key(encoding_aes_key: &str) -> WecomResult<Zeroizing<[u8; KEY_LEN]>> {
    if encoding_aes_key.len() != ENCODING_KEY_LEN {
        return Err(WecomError::InvalidKey(format!(
            "expected {} characters, got {}",
            ENCODING_KEY_LEN,
            encoding_aes_key.len()
        )));
    }
    let decoded = KEY_ENGINE
        .decode(format!("{encoding_aes_key}="))
        .map(Zeroizing::new)
        .map_err(|e| WecomError::InvalidKey(e.to_string()))?;
    if decoded.len() != KEY_LEN {
        return Err(WecomError::InvalidKey(format!(
            "decoded key is {} bytes, expected {KEY_LEN}",
            decoded.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&decoded);
    Ok(key)
}

fn pad(frame: &mut Vec<u8>) {
    let amount = PAD_BLOCK - (frame.len() % PAD_BLOCK);
    frame.resize(frame.len() + amount, amount as u8);
}

fn unpad(frame: &[u8]) -> Result<&[u8], DecryptFailure> {
    let amount = *frame.last().ok_or(DecryptFailure::Padding)? as usize;
    if amount == 0 || amount > PAD_BLOCK || amount > frame.len() {
        return Err(DecryptFailure::Padding);
    }
    let (body, padding) = frame.split_at(frame.len() - amount);
    if padding.iter().any(|&b| b as usize != amount) {
        return Err(DecryptFailure::Padding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn codec(receive_id: &str) -> CallbackCrypto {
        CallbackCrypto::new(KEY, receive_id).unwrap()
    }

    fn flip(ciphertext: &str, index: usize) -> String {
        let mut raw = STANDARD.decode(ciphertext).unwrap();
        raw[index] ^= 0x01;
        STANDARD.encode(raw)
    }

    #[test]
    fn test_round_trip() {
        let c = codec("wwcorp123");
        let long = "x".repeat(1000);
        for text in ["", "hello", "你好，世界", long.as_str()] {
            let encrypted = c.encrypt(text).unwrap();
            assert_eq!(c.decrypt(&encrypted).unwrap(), text);
        }
    }

    #[test]
    fn test_round_trip_empty_receiver() {
        let c = codec("");
        let encrypted = c.encrypt(r#"{"msgtype":"text"}"#).unwrap();
        assert_eq!(c.decrypt(&encrypted).unwrap(), r#"{"msgtype":"text"}"#);
    }

    #[test]
    fn test_free_functions() {
        let encrypted = encrypt("ping", KEY, "r1").unwrap();
        assert_eq!(decrypt(&encrypted, KEY, "r1").unwrap(), "ping");
    }

    #[test]
    fn test_fresh_prefix_each_call() {
        let c = codec("r");
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn test_ciphertext_is_pad_block_aligned() {
        let c = codec("");
        for len in [0usize, 11, 12, 13, 44, 45] {
            let encrypted = c.encrypt(&"a".repeat(len)).unwrap();
            let raw = STANDARD.decode(encrypted).unwrap();
            assert_eq!(raw.len() % PAD_BLOCK, 0, "len {len}");
        }
    }

    #[test]
    fn test_full_pad_block_when_aligned() {
        let mut frame = vec![7u8; PAD_BLOCK * 2];
        pad(&mut frame);
        assert_eq!(frame.len(), PAD_BLOCK * 3);
        assert!(frame[PAD_BLOCK * 2..].iter().all(|&b| b as usize == PAD_BLOCK));
        assert_eq!(unpad(&frame).unwrap().len(), PAD_BLOCK * 2);
    }

    #[test]
    fn test_unpad_rejects_bad_padding() {
        assert_eq!(unpad(&[1, 2, 0]), Err(DecryptFailure::Padding));
        assert_eq!(unpad(&[1, 2, 33]), Err(DecryptFailure::Padding));
        assert_eq!(unpad(&[9, 2, 3, 3]), Err(DecryptFailure::Padding));
        assert_eq!(unpad(&[5, 5]), Err(DecryptFailure::Padding));
        assert_eq!(unpad(&[9, 3, 3, 3]).unwrap(), &[9]);
    }

    #[test]
    fn test_wrong_receiver_rejected() {
        let encrypted = codec("corp-a").encrypt("secret").unwrap();
        let err = codec("corp-b").decrypt(&encrypted).unwrap_err();
        assert!(matches!(
            err,
            WecomError::DecryptionFailure(DecryptFailure::ReceiverMismatch)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let encrypted = codec("r").encrypt("secret").unwrap();
        let other =
            CallbackCrypto::new("ZYXWVUTSRQPONMLKJIHGFEDCBA9876543210zyxwvut", "r").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(WecomError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_tampered_tail_blocks_rejected() {
        let c = codec("wwcorp123");
        let text = "m".repeat(100);
        let encrypted = c.encrypt_with_prefix(&text, &[42u8; RANDOM_PREFIX_LEN]).unwrap();
        let total = STANDARD.decode(&encrypted).unwrap().len();
        for index in total - 2 * AES_BLOCK..total {
            assert!(
                c.decrypt(&flip(&encrypted, index)).is_err(),
                "flip at {index} was accepted"
            );
        }
    }

    #[test]
    fn test_tampered_length_field_rejected() {
        // Flipping the first cipher block flips the length field in the second.
        let c = codec("wwcorp123");
        let encrypted = c.encrypt_with_prefix("hello world", &[7u8; RANDOM_PREFIX_LEN]).unwrap();
        for index in 0..LENGTH_FIELD_LEN {
            let err = c.decrypt(&flip(&encrypted, index)).unwrap_err();
            assert!(matches!(err, WecomError::DecryptionFailure(_)));
        }
    }

    #[test]
    fn test_first_block_flip_decrypts_but_breaks_signature() {
        let c = codec("");
        let encrypted = c.encrypt_with_prefix("hello world", &[7u8; RANDOM_PREFIX_LEN]).unwrap();
        let sig = crate::signature::sign("token", "1700000000", "n", &encrypted);

        let tampered = flip(&encrypted, LENGTH_FIELD_LEN);
        assert_eq!(c.decrypt(&tampered).unwrap(), "iello world");
        assert!(!crate::signature::verify("token", "1700000000", "n", &tampered, &sig));
    }

    #[test]
    fn test_truncated_and_garbage_rejected() {
        let c = codec("r");
        let encrypted = c.encrypt("hello").unwrap();
        let raw = STANDARD.decode(&encrypted).unwrap();

        let short = STANDARD.encode(&raw[..raw.len() - AES_BLOCK]);
        assert!(c.decrypt(&short).is_err());

        let misaligned = STANDARD.encode(&raw[..raw.len() - 3]);
        assert!(matches!(
            c.decrypt(&misaligned),
            Err(WecomError::DecryptionFailure(DecryptFailure::BlockAlignment))
        ));

        assert!(matches!(
            c.decrypt("not base64 !!"),
            Err(WecomError::DecryptionFailure(DecryptFailure::Base64))
        ));
        assert!(matches!(
            c.decrypt(""),
            Err(WecomError::DecryptionFailure(DecryptFailure::BlockAlignment))
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            CallbackCrypto::new("short", ""),
            Err(WecomError::InvalidKey(_))
        ));
        assert!(matches!(
            CallbackCrypto::new(&format!("{KEY}A"), ""),
            Err(WecomError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_invalid_key_alphabet() {
        let bad = format!("{}*", &KEY[..42]);
        assert!(matches!(
            CallbackCrypto::new(&bad, ""),
            Err(WecomError::InvalidKey(_))
        ));
    }
}
