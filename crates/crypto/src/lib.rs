//! Cryptographic building blocks: chunk AEAD and validator signatures.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use ring::aead;
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

pub type Nonce = [u8; NONCE_LEN];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("ciphertext shorter than nonce")]
    Truncated,

    #[error("authentication failed")]
    Unauthenticated,

    #[error("invalid key material")]
    InvalidKey,

    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// Store-scoped symmetric key for chunk encryption (AES-256-GCM).
///
/// Sealed form is `nonce || ciphertext || tag`; the nonce is drawn fresh
/// per seal, so sealing is not deterministic even for identical plaintext.
#[derive(Copy, Clone)]
pub struct ChunkKey {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkKey(..)")
    }
}

impl ChunkKey {
    #[must_use]
    pub const fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn random(csprng: &mut impl RngCore) -> Self {
        let mut key = [0; KEY_LEN];
        csprng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn seal(&self, payload: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        let sealing_key = aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_256_GCM, &self.key)
                .map_err(|_| CryptoError::InvalidKey)?,
        );

        let mut nonce = [0; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut cipher_text = payload;
        sealing_key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut cipher_text,
            )
            .map_err(|_| CryptoError::Unauthenticated)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + cipher_text.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&cipher_text);

        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }

        let (nonce, cipher_text) = sealed.split_at(NONCE_LEN);
        let nonce: Nonce = nonce.try_into().map_err(|_| CryptoError::Truncated)?;

        let opening_key = aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_256_GCM, &self.key)
                .map_err(|_| CryptoError::InvalidKey)?,
        );

        let mut payload = cipher_text.to_vec();
        let plain_len = opening_key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut payload,
            )
            .map_err(|_| CryptoError::Unauthenticated)?
            .len();

        payload.truncate(plain_len);

        Ok(payload)
    }
}

/// Signing half of a validator identity.
#[derive(Clone, Debug)]
pub struct ValidatorSigner {
    key: SigningKey,
}

impl ValidatorSigner {
    #[must_use]
    pub fn new(secret: [u8; KEY_LEN]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn random(csprng: &mut (impl RngCore + rand::CryptoRng)) -> Self {
        Self {
            key: SigningKey::generate(csprng),
        }
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }

    #[must_use]
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }
}

/// Verifying half of a validator identity.
#[derive(Clone, Copy, Debug)]
pub struct ValidatorVerifier {
    key: VerifyingKey,
}

impl ValidatorVerifier {
    pub fn new(public: [u8; KEY_LEN]) -> Result<Self, CryptoError> {
        Ok(Self {
            key: VerifyingKey::from_bytes(&public).map_err(|_| CryptoError::InvalidKey)?,
        })
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;

        self.key
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::Unauthenticated)
    }
}
