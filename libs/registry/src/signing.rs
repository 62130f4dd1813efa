//! Unit payload signing.

use sha2::{Digest, Sha256};

use crate::model::Unit;

/// Produces signatures over unit payloads.
pub trait PayloadSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> String;
}

/// Checks signatures over unit payloads.
pub trait PayloadVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// Shared-key SHA-256 digest signer for development clusters and tests.
///
/// The signature is the hex digest of `key || 0x00 || payload`. Anyone holding
/// the key can both sign and verify.
#[derive(Clone)]
pub struct DigestSigner {
    key: Vec<u8>,
}

impl DigestSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn digest(&self, payload: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update([0u8]);
        hasher.update(payload);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for DigestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestSigner").finish_non_exhaustive()
    }
}

impl PayloadSigner for DigestSigner {
    fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.digest(payload))
    }
}

impl PayloadVerifier for DigestSigner {
    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let expected = self.digest(payload);
        if provided.len() != expected.len() {
            return false;
        }
        // Constant-time comparison.
        provided
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Attach a signature to `unit`.
pub fn sign_unit(signer: &dyn PayloadSigner, unit: &mut Unit) {
    unit.signature = Some(signer.sign(&unit.signing_payload()));
}

/// Returns true if `unit` carries a signature that verifies.
pub fn verify_unit(verifier: &dyn PayloadVerifier, unit: &Unit) -> bool {
    match unit.signature.as_deref() {
        Some(signature) => verifier.verify(&unit.signing_payload(), signature),
        None => false,
    }
}
