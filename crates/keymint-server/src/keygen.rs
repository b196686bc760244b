//! Opaque license token generation.
//!
//! A token is `hex(nonce):hex(ciphertext)` where the ciphertext is a
//! ChaCha20 encryption of a fresh 32-byte random secret (hex-encoded) under
//! the server key. The stream cipher carries no authentication tag on
//! purpose: nothing ever decrypts a token. A tampered token is just a
//! different opaque string that will not match any stored key, so validation
//! rejects it at lookup time, never at decode time.
//!
//! The `:` separator is part of the format contract — display-only key
//! formats used elsewhere never contain one, and neither does the trial
//! reset probe sentinel, so an opaque token can always be told apart.

use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, Params, PasswordHasher};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

/// 32-byte token-encryption key derived from the master key via Argon2id.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Derive the token-encryption key from `master_key` and `salt` using
/// Argon2id. The salt is stored persistently (keymint.salt) and reused
/// across restarts so issued tokens stay reproducible from the same inputs.
pub fn derive_key(master_key: &str, salt: &[u8; 32]) -> Result<EncryptionKey> {
    let salt_string = SaltString::encode_b64(salt)
        .map_err(|e| anyhow::anyhow!("invalid salt for argon2: {e}"))?;

    let params = Params::new(
        65536, // m_cost: 64 MiB
        3,     // t_cost: 3 iterations
        1,     // p_cost: 1 lane
        Some(32),
    )
    .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let hash = argon2
        .hash_password(master_key.as_bytes(), &salt_string)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;

    let output = hash.hash.context("no hash output")?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&output.as_bytes()[..32]);

    Ok(EncryptionKey(key))
}

/// Generate a fresh 32-byte random salt.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Stateless token factory holding the derived server key.
pub struct KeyGenerator {
    key: EncryptionKey,
}

impl KeyGenerator {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Produce a new opaque license token. Pure — no store access, and the
    /// randomness of the secret and nonce makes collisions negligible.
    pub fn generate(&self) -> String {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);

        // Hex-encode the secret first; the ciphertext is over the 64-char
        // ASCII form, matching the issued-token layout clients already hold.
        let mut buf = hex::encode(secret).into_bytes();

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);

        let mut cipher = ChaCha20::new(self.key.as_bytes().into(), (&nonce).into());
        cipher.apply_keystream(&mut buf);

        format!("{}:{}", hex::encode(nonce), hex::encode(buf))
    }
}
