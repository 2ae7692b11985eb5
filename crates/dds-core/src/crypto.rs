//! Document signing and verification
//!
//! Ed25519 over the canonical sign bytes from [`crate::canonical`].

use crate::canonical::document_sign_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::HashSet;

/// Produces detached signatures
pub trait DocumentSigner: Send + Sync {
    fn sign(&self, bytes: &[u8]) -> DocumentSignature;
}

/// Checks detached signatures
pub trait DocumentVerifier: Send + Sync {
    fn verify(&self, bytes: &[u8], signature: &DocumentSignature) -> bool;
}

/// Ed25519 keypair for signing locally owned documents
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (persisted across restarts)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes, for persistence
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl DocumentSigner for KeyPair {
    fn sign(&self, bytes: &[u8]) -> DocumentSignature {
        DocumentSignature {
            public_key: self.public_key(),
            signature: self.signing_key.sign(bytes).to_bytes().to_vec(),
        }
    }
}

/// Ed25519 verifier, optionally pinned to a set of trusted keys
#[derive(Clone, Debug, Default)]
pub struct Ed25519Verifier {
    /// Empty accepts any key with a valid signature
    trusted: HashSet<Bytes32>,
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trusted(keys: impl IntoIterator<Item = Bytes32>) -> Self {
        Self {
            trusted: keys.into_iter().collect(),
        }
    }

    /// Parse hex-encoded public keys
    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let mut trusted = HashSet::new();
        for key in keys {
            let bytes = hex::decode(key.as_ref())
                .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
            let key: Bytes32 = bytes
                .try_into()
                .map_err(|_| Error::InvalidPublicKey(key.as_ref().to_string()))?;
            trusted.insert(key);
        }
        Ok(Self { trusted })
    }
}

impl DocumentVerifier for Ed25519Verifier {
    fn verify(&self, bytes: &[u8], signature: &DocumentSignature) -> bool {
        if !self.trusted.is_empty() && !self.trusted.contains(&signature.public_key) {
            return false;
        }
        let Ok(verifying_key) = VerifyingKey::from_bytes(&signature.public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.signature.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(bytes, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

/// Attach a signature over the document's canonical bytes
pub fn sign_document(signer: &dyn DocumentSigner, document: Document) -> Result<Document> {
    let bytes = document_sign_bytes(&document)?;
    let signature = signer.sign(&bytes);
    Ok(document.with_signature(signature))
}

/// Check a document's detached signature
pub fn verify_document(verifier: &dyn DocumentVerifier, document: &Document) -> Result<()> {
    let signature = document
        .signature
        .as_ref()
        .ok_or_else(|| Error::MissingField("signature".into()))?;
    let bytes = document_sign_bytes(document)?;
    if verifier.verify(&bytes, signature) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}
