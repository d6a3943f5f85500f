//! Per-value envelope format.
//!
//! Each leaf is serialized to compact JSON, encrypted with AES-256-GCM under a
//! key stretched from the master key with PBKDF2-HMAC-SHA256, and packed as
//!
//! ```text
//! relic:v1:BASE64([iterations:4 BE][salt:16][iv:12][ciphertext || tag:16])
//! ```
//!
//! Salt and IV are drawn fresh for every call, so encoding the same value twice
//! never yields the same token.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde_json::Value;

use crate::error::CodecError;
use crate::kdf::{KeyCache, MasterKey, SALT_LENGTH};

/// Prefix shared by every token version
pub const TOKEN_PREFIX: &str = "relic:";

/// Current token format version
pub const TOKEN_VERSION: &str = "v1";

/// Nonce length in bytes (96 bits for AES-GCM)
pub const IV_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LENGTH: usize = 16;

const ITERATIONS_LENGTH: usize = 4;
const HEADER_LENGTH: usize = ITERATIONS_LENGTH + SALT_LENGTH + IV_LENGTH;

/// Smallest accepted PBKDF2 iteration count
pub const MIN_ITERATIONS: u32 = 1;

/// Largest accepted PBKDF2 iteration count. Tokens claiming more are treated as
/// tampered rather than stalling the process in the KDF.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Default PBKDF2 iteration count for new tokens
pub const DEFAULT_ITERATIONS: u32 = 210_000;

/// Check whether a string is a token (prefix match only).
pub fn is_encoded(value: &str) -> bool {
    value.starts_with(TOKEN_PREFIX)
}

/// Check whether an iteration count is within the accepted range.
pub fn valid_iterations(iterations: u32) -> bool {
    (MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations)
}

/// Encrypt one leaf value into a token.
pub fn encode_leaf(
    cache: &KeyCache,
    master_key: &MasterKey,
    value: &Value,
    iterations: u32,
) -> Result<String, CodecError> {
    if !valid_iterations(iterations) {
        return Err(CodecError::Encrypt(format!(
            "iteration count {} outside {}..={}",
            iterations, MIN_ITERATIONS, MAX_ITERATIONS
        )));
    }

    let plaintext =
        serde_json::to_vec(value).map_err(|e| CodecError::Encrypt(e.to_string()))?;

    let mut salt = [0u8; SALT_LENGTH];
    let mut iv = [0u8; IV_LENGTH];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = cache.derive(master_key, &salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::Encrypt(format!("Failed to create cipher: {}", e)))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| CodecError::Encrypt(e.to_string()))?;

    let mut packed = Vec::with_capacity(HEADER_LENGTH + ciphertext.len());
    packed.extend_from_slice(&iterations.to_be_bytes());
    packed.extend_from_slice(&salt);
    packed.extend_from_slice(&iv);
    packed.extend_from_slice(&ciphertext);

    Ok(format!(
        "{}{}:{}",
        TOKEN_PREFIX,
        TOKEN_VERSION,
        BASE64.encode(&packed)
    ))
}

/// The unpacked binary fields of a token.
struct Envelope<'a> {
    iterations: u32,
    salt: [u8; SALT_LENGTH],
    iv: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn unpack(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LENGTH + TAG_LENGTH {
            return Err(CodecError::InvalidFormat(format!(
                "payload is {} bytes, expected at least {}",
                bytes.len(),
                HEADER_LENGTH + TAG_LENGTH
            )));
        }

        let (iterations, rest) = bytes.split_at(ITERATIONS_LENGTH);
        let (salt, rest) = rest.split_at(SALT_LENGTH);
        let (iv, ciphertext) = rest.split_at(IV_LENGTH);

        let mut iteration_bytes = [0u8; ITERATIONS_LENGTH];
        iteration_bytes.copy_from_slice(iterations);
        let mut salt_bytes = [0u8; SALT_LENGTH];
        salt_bytes.copy_from_slice(salt);

        Ok(Self {
            iterations: u32::from_be_bytes(iteration_bytes),
            salt: salt_bytes,
            iv,
            ciphertext,
        })
    }
}

/// Split `relic:<version>:<payload>`, returning the base64 payload.
fn strip_token(token: &str) -> Result<&str, CodecError> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| CodecError::InvalidFormat("missing 'relic:' prefix".to_string()))?;
    let (version, payload) = rest
        .split_once(':')
        .ok_or_else(|| CodecError::InvalidFormat("missing version tag".to_string()))?;
    if version != TOKEN_VERSION {
        return Err(CodecError::InvalidFormat(format!(
            "unsupported token version '{}', expected '{}'",
            version, TOKEN_VERSION
        )));
    }
    Ok(payload)
}

/// Decrypt a token back into the original leaf value.
pub fn decode_leaf(
    cache: &KeyCache,
    master_key: &MasterKey,
    token: &str,
) -> Result<Value, CodecError> {
    let payload = strip_token(token)?;
    let packed = BASE64
        .decode(payload)
        .map_err(|e| CodecError::InvalidFormat(format!("payload is not base64: {}", e)))?;
    let envelope = Envelope::unpack(&packed)?;

    // The iteration count is covered by the tag only indirectly (through the
    // derived key), so an out-of-range value can only mean tampering.
    if !valid_iterations(envelope.iterations) {
        return Err(CodecError::DecryptFailed);
    }

    let key = cache.derive(master_key, &envelope.salt, envelope.iterations);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| CodecError::DecryptFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(envelope.iv), envelope.ciphertext)
        .map_err(|_| CodecError::DecryptFailed)?;

    serde_json::from_slice(&plaintext)
        .map_err(|_| CodecError::InvalidFormat("decrypted value is not JSON".to_string()))
}
