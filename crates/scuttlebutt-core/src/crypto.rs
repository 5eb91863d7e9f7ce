//! Update signing and verification
//!
//! Authentication is pluggable: the engine calls a [`Sign`] implementation
//! for updates it originates and a [`Verify`] implementation for updates from
//! any other source. The Ed25519 plugins here sign
//! `BLAKE3("scuttlebutt-update" || canonical_bytes(payload, timestamp, source))`.

use crate::canonical::update_bytes;
use crate::error::{Error, Result};
use crate::types::{Signature, SourceId, Update};
use async_trait::async_trait;
use blake3::Hasher;
use ed25519_dalek::{Signature as Ed25519Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use std::collections::HashMap;

/// Domain prefix for update signatures
pub const DOMAIN_UPDATE_SIG: &[u8] = b"scuttlebutt-update";

/// Signs locally originated updates. Called synchronously during ingestion.
pub trait Sign<P>: Send + Sync {
    fn sign(&self, update: &Update<P>) -> anyhow::Result<Signature>;
}

impl<P, F> Sign<P> for F
where
    F: Fn(&Update<P>) -> anyhow::Result<Signature> + Send + Sync,
{
    fn sign(&self, update: &Update<P>) -> anyhow::Result<Signature> {
        self(update)
    }
}

/// Verifies updates from other sources.
///
/// Returning `Ok(false)` rejects the update; an `Err` is reported as an error
/// and the update is dropped. Retrying is up to the implementation.
#[async_trait]
pub trait Verify<P: Send + Sync + 'static>: Send + Sync {
    async fn verify(&self, update: &Update<P>) -> anyhow::Result<bool>;
}

/// Digest of the signed portion of an update.
pub fn sign_bytes<P: Serialize>(update: &Update<P>) -> Result<[u8; 32]> {
    let bytes = update_bytes(update)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_UPDATE_SIG);
    hasher.update(&bytes);

    Ok(*hasher.finalize().as_bytes())
}

/// Ed25519 signer for a replica's own updates
#[derive(Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a new random key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl<P: Serialize> Sign<P> for Ed25519Signer {
    fn sign(&self, update: &Update<P>) -> anyhow::Result<Signature> {
        let message = sign_bytes(update)?;
        Ok(Signature(self.signing_key.sign(&message).to_bytes().to_vec()))
    }
}

/// Ed25519 verifier holding one public key per trusted source.
#[derive(Clone, Default)]
pub struct Ed25519Verifier {
    keys: HashMap<SourceId, VerifyingKey>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `public_key` for updates from `source`
    pub fn insert(&mut self, source: SourceId, public_key: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        self.keys.insert(source, key);
        Ok(())
    }

    pub fn with_key(mut self, source: SourceId, public_key: &[u8; 32]) -> Result<Self> {
        self.insert(source, public_key)?;
        Ok(self)
    }
}

#[async_trait]
impl<P: Serialize + Send + Sync + 'static> Verify<P> for Ed25519Verifier {
    async fn verify(&self, update: &Update<P>) -> anyhow::Result<bool> {
        // Unknown keys are a verification failure, not an error
        let Some(key) = self.keys.get(update.source.as_str()) else {
            return Ok(false);
        };
        let Some(signature) = &update.signature else {
            return Ok(false);
        };
        let Ok(bytes) = <[u8; 64]>::try_from(signature.as_bytes()) else {
            return Ok(false);
        };

        let message = sign_bytes(update)?;
        Ok(key.verify(&message, &Ed25519Signature::from_bytes(&bytes)).is_ok())
    }
}
