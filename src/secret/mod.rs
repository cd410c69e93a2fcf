//! Symmetric protection for stored secrets.
//!
//! Profiles never hold a plaintext password or client secret; every secret is
//! run through [`SecretVault`] before it is stored and decrypted only at the
//! moment a session is built. Key material is process-wide configuration
//! supplied by the surrounding application.

use std::num::NonZeroU32;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, pbkdf2};
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;

/// Hash used for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    fn pbkdf2(self) -> pbkdf2::Algorithm {
        match self {
            HashAlgorithm::Sha1 => pbkdf2::PBKDF2_HMAC_SHA1,
            HashAlgorithm::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
            HashAlgorithm::Sha512 => pbkdf2::PBKDF2_HMAC_SHA512,
        }
    }
}

/// Symmetric key width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySize {
    Bits128,
    Bits256,
}

impl KeySize {
    fn aead(self) -> &'static aead::Algorithm {
        match self {
            KeySize::Bits128 => &aead::AES_128_GCM,
            KeySize::Bits256 => &aead::AES_256_GCM,
        }
    }
}

/// Process-wide key material for the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub passphrase: String,
    pub salt: String,
    pub hash_algorithm: HashAlgorithm,
    pub iterations: u32,
    /// Bound into every ciphertext as associated data; both sides must agree.
    pub init_vector: String,
    pub key_size: KeySize,
}

impl Default for KeyMaterial {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            salt: String::new(),
            hash_algorithm: HashAlgorithm::Sha256,
            iterations: 10_000,
            init_vector: String::new(),
            key_size: KeySize::Bits256,
        }
    }
}

/// Encrypts and decrypts profile secrets with PBKDF2-derived AES-GCM keys.
///
/// Ciphertext is text: base64 over `nonce || sealed bytes`. Decrypting with
/// different key material fails authentication and never yields the original
/// plaintext.
#[derive(Debug, Clone)]
pub struct SecretVault {
    material: KeyMaterial,
}

impl SecretVault {
    pub fn new(material: KeyMaterial) -> Self {
        Self { material }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, ConnectionError> {
        let key = self.derive_key()?;

        let mut nonce_bytes = [0u8; aead::NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| ConnectionError::configuration("unable to generate an encryption nonce"))?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut sealed = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, self.aad(), &mut sealed)
            .map_err(|_| ConnectionError::configuration("secret encryption failed"))?;

        let mut payload = Vec::with_capacity(aead::NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, ConnectionError> {
        let payload = BASE64
            .decode(ciphertext)
            .map_err(|_| ConnectionError::configuration("stored secret is not valid ciphertext"))?;
        if payload.len() <= aead::NONCE_LEN {
            return Err(ConnectionError::configuration(
                "stored secret is not valid ciphertext",
            ));
        }

        let key = self.derive_key()?;
        let (nonce_bytes, sealed) = payload.split_at(aead::NONCE_LEN);
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ConnectionError::configuration("stored secret is not valid ciphertext"))?;

        let mut sealed = sealed.to_vec();
        let plaintext = key
            .open_in_place(nonce, self.aad(), &mut sealed)
            .map_err(|_| {
                ConnectionError::configuration(
                    "unable to decrypt stored secret with the configured key material",
                )
            })?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| ConnectionError::configuration("decrypted secret is not valid UTF-8"))
    }

    fn aad(&self) -> aead::Aad<&[u8]> {
        aead::Aad::from(self.material.init_vector.as_bytes())
    }

    fn derive_key(&self) -> Result<aead::LessSafeKey, ConnectionError> {
        let iterations = NonZeroU32::new(self.material.iterations)
            .ok_or_else(|| ConnectionError::configuration("key iteration count must be non-zero"))?;

        let algorithm = self.material.key_size.aead();
        let mut key_bytes = vec![0u8; algorithm.key_len()];
        pbkdf2::derive(
            self.material.hash_algorithm.pbkdf2(),
            iterations,
            self.material.salt.as_bytes(),
            self.material.passphrase.as_bytes(),
            &mut key_bytes,
        );

        let unbound = aead::UnboundKey::new(algorithm, &key_bytes)
            .map_err(|_| ConnectionError::configuration("invalid vault key material"))?;
        Ok(aead::LessSafeKey::new(unbound))
    }
}
