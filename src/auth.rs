//! Challenge/response authentication.
//!
//! The server issues a 32-byte random challenge (Base64). A client proves
//! knowledge of its registered key material by returning
//! `BLAKE2b-256(challenge_bytes || pubkey_bytes)` in Base64. This is a
//! preimage proof, not a digital signature; the computation is fixed to
//! stay compatible with existing clients. Challenges are valid for 30
//! seconds and consumed by exactly one AUTH.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Duration;

use crate::core::error::ChatError;

type Blake2b256 = Blake2b<U32>;

pub const CHALLENGE_BYTES: usize = 32;
pub const KEY_BYTES: usize = 32;
pub const CHALLENGE_TTL: Duration = Duration::from_secs(30);

/// Fresh random challenge nonce. An RNG failure is an error, never a
/// fallback to a weaker source.
pub fn generate_challenge() -> Result<String, ChatError> {
    random_b64(CHALLENGE_BYTES)
}

/// Fresh 32-byte key. With this scheme the Base64 text is both the
/// registered public form and the signing secret.
pub fn generate_key() -> Result<String, ChatError> {
    random_b64(KEY_BYTES)
}

fn random_b64(len: usize) -> Result<String, ChatError> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(BASE64.encode(bytes))
}

pub fn response_digest(challenge: &[u8], pubkey: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(challenge);
    hasher.update(pubkey);
    hasher.finalize().into()
}

/// The expected AUTH argument for a challenge, computed client-side.
/// Returns None when either input is not valid Base64.
pub fn sign_challenge(pubkey_b64: &str, challenge_b64: &str) -> Option<String> {
    let pubkey = BASE64.decode(pubkey_b64).ok()?;
    let challenge = BASE64.decode(challenge_b64).ok()?;
    Some(BASE64.encode(response_digest(&challenge, &pubkey)))
}

/// Accepts iff the signature decodes to exactly
/// `BLAKE2b-256(challenge || pubkey)`. Any decode failure rejects. The
/// comparison covers the full buffer and never short-circuits.
pub fn verify_signature(pubkey_b64: &str, challenge_b64: &str, signature_b64: &str) -> bool {
    let pubkey = match BASE64.decode(pubkey_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let challenge = match BASE64.decode(challenge_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match BASE64.decode(signature_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let expected = response_digest(&challenge, &pubkey);
    constant_time_eq(&signature, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
