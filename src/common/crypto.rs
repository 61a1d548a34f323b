use std::fmt;

use bytes::Bytes;
use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest as ShaDigest, Sha512};

use super::error::{CertError, Result};

pub type Digest = [u8; 64];

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;

/// Public half of a server identity. Only its serialized bytes ever travel.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PublicKey {
    key: VerifyingKey,
}

/// Private half of a server identity. Lives only on the owning node.
#[derive(Clone)]
pub struct SecretKey {
    signer: SigningKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            CertError::InvalidKey(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|e| CertError::InvalidKey(e.to_string()))?;
        Ok(PublicKey { key })
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let raw = hex::decode(encoded.trim()).map_err(|e| CertError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&raw)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.key.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Returns false for malformed signatures as well as for mismatches.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.key.verify_strict(message, &sig).is_ok()
    }
}

impl SecretKey {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        SecretKey {
            signer: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            CertError::InvalidKey(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(SecretKey {
            signer: SigningKey::from_bytes(&raw),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.signer.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Bytes {
        let sig = self.signer.sign(message).to_bytes();
        Bytes::copy_from_slice(&sig)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("public", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Digest over the (term, index, payload) tuple a follower signs.
pub fn signing_digest(term: u64, index: u64, payload: Option<&[u8]>) -> Digest {
    let mut hasher = Sha512::new();
    hasher.update(term.to_le_bytes());
    hasher.update(index.to_le_bytes());
    if let Some(payload) = payload {
        hasher.update(payload);
    }
    let result = hasher.finalize();
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&result[..]);
    digest
}
