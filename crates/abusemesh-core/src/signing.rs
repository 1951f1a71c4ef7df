//! A signing/verification seam standing in for PGP, treated as an external
//! collaborator the core merely consumes.
//!
//! The concrete implementation here signs with Ed25519 rather than parsing
//! real OpenPGP packets: actual PGP key loading is out of scope, and
//! Ed25519 is the cryptographic primitive the rest of this dependency stack
//! already carries.

use bincode::{Decode, Encode};
use ed25519_dalek::ed25519::signature::Signer as _;
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::node::PgpEntity;

/// A detached signature over a payload's canonical (signature-zeroed) bytes.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature(#[serde(with = "serde_big_array")] [u8; 64]);

mod serde_big_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(bytes.as_slice(), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let buf: Vec<u8> = serde_bytes::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl Signature {
    pub const ZERO: Self = Self([0u8; 64]);

    pub fn to_bytes(self) -> [u8; 64] {
        self.0
    }
}

impl From<ed25519_dalek::Signature> for Signature {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

#[derive(Debug, Snafu)]
pub enum VerifyError {
    #[snafu(display("malformed signature"))]
    Malformed,
    #[snafu(display("malformed pgp entity / public key"))]
    MalformedKey,
    #[snafu(display("signature does not verify"))]
    Mismatch,
}

/// Implemented by whatever key material a node holds locally, to sign
/// outgoing events.
pub trait SigningProvider {
    fn sign(&self, canonical_bytes: &[u8]) -> Signature;

    fn pgp_entity(&self) -> PgpEntity;
}

/// Implemented to check an incoming event's signature against the issuing
/// node's advertised [`PgpEntity`]. Pure: no I/O, no mutation.
pub trait SignatureVerifier {
    fn verify(
        &self,
        entity: &PgpEntity,
        canonical_bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), VerifyError>;
}

/// Ed25519 keypair used both to sign locally-originated events and, as a
/// [`SignatureVerifier`], to check remote ones.
pub struct Ed25519Signer {
    keypair: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self {
            keypair: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            keypair: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// The raw 32-byte secret key, for persisting to a signing key file.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.keypair.to_bytes()
    }
}

impl SigningProvider for Ed25519Signer {
    fn sign(&self, canonical_bytes: &[u8]) -> Signature {
        self.keypair.sign(canonical_bytes).into()
    }

    fn pgp_entity(&self) -> PgpEntity {
        PgpEntity::from_ed25519_public(&self.keypair.verifying_key())
    }
}

#[derive(Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(
        &self,
        entity: &PgpEntity,
        canonical_bytes: &[u8],
        signature: &Signature,
    ) -> Result<(), VerifyError> {
        let verifying_key = entity.as_ed25519_public().ok_or(VerifyError::MalformedKey)?;
        let sig = ed25519_dalek::Signature::from_slice(&signature.to_bytes())
            .map_err(|_| VerifyError::Malformed)?;
        verifying_key
            .verify(canonical_bytes, &sig)
            .map_err(|_| VerifyError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn signs_and_verifies() {
        let signer = Ed25519Signer::generate(&mut OsRng);
        let entity = signer.pgp_entity();
        let sig = signer.sign(b"hello");

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&entity, b"hello", &sig).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let signer = Ed25519Signer::generate(&mut OsRng);
        let entity = signer.pgp_entity();
        let sig = signer.sign(b"hello");

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&entity, b"goodbye", &sig).is_err());
    }
}
