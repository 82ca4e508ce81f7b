//! Pre-shared AES-128 key loading, the authentication challenge, and
//! length-framed payload encryption.
//!
//! Grounded on the teacher's `db.rs` at-rest encryption (AES-GCM, random
//! nonce prefixed to ciphertext) and its `Hello`-style handshake in
//! `s2s.rs`; the peer-id + shared-key proof named in spec §4.4 is made
//! concrete here as an HMAC-SHA256 challenge/response keyed by the shared
//! key, so neither side ever puts the raw key on the wire.

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Loads the raw 16-byte AES-128 shared key from `sharedkey.bin`.
pub fn load_key<P: AsRef<Path>>(path: P) -> Result<[u8; KEY_LEN]> {
    let bytes = fs::read(path.as_ref()).map_err(|e| {
        Error::FatalInit(format!("could not read shared key {}: {e}", path.as_ref().display()))
    })?;
    if bytes.len() != KEY_LEN {
        return Err(Error::FatalInit(format!(
            "shared key file must be exactly {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Computes the HMAC-SHA256 challenge response over `peer_id`, keyed by
/// the shared AES-128 key. Both sides of a handshake compute this and
/// compare; a mismatch fails authentication.
pub fn challenge_response(key: &[u8; KEY_LEN], peer_id: &str) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(peer_id.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Encrypts a framed payload with AES-128-GCM. The random nonce is
/// prepended to the ciphertext, matching the teacher's at-rest encryption
/// layout.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("AES-GCM encryption over an in-memory buffer cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a payload produced by [`encrypt`]. Any tampering or wrong key
/// surfaces as a framing error — the connection that produced it is
/// dropped (spec §4.4, protocol-framing error kind).
pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Framing("encrypted payload shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::Framing("failed to decrypt payload: bad key or corrupt frame".into()))
}
