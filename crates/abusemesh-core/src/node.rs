//! The [`Node`] entity and the data it carries on the wire: id, ASN, IP
//! address (string + family enum), protocol version string, contact
//! details, PGP entity as raw packet bytes.

use bincode::{Decode, Encode};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::signing::Signature;

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddrFamily {
    IPv4,
    IPv6,
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct ContactPerson {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Carried on the [`Node`] entity itself rather than only in local config,
/// since contact details are part of the `Node` wire message.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct ContactDetails {
    pub organization: String,
    pub email: String,
    pub phone: String,
    pub physical_address: String,
    pub persons: Vec<ContactPerson>,
}

/// OpenPGP entity, carried as raw packet bytes plus the two values derivable
/// from them (primary key id, fingerprint). Real OpenPGP parsing is out of
/// scope here; `primary_key_id` and `fingerprint` are derived from an
/// Ed25519 public key instead of real PGP packets, and `packets` simply
/// stores that public key's bytes.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PgpEntity {
    pub packets: Vec<u8>,
    pub primary_key_id: u64,
    pub fingerprint: [u8; 20],
}

impl PgpEntity {
    pub fn from_ed25519_public(key: &VerifyingKey) -> Self {
        let bytes = key.to_bytes();
        let digest = blake3::hash(&bytes);
        let digest_bytes = digest.as_bytes();

        let mut fingerprint = [0u8; 20];
        fingerprint.copy_from_slice(&digest_bytes[..20]);

        let primary_key_id = u64::from_be_bytes(digest_bytes[..8].try_into().expect("8 bytes"));

        Self {
            packets: bytes.to_vec(),
            primary_key_id,
            fingerprint,
        }
    }

    pub fn as_ed25519_public(&self) -> Option<VerifyingKey> {
        let bytes: [u8; 32] = self.packets.as_slice().try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Node {
    pub id: NodeId,
    pub protocol_version: String,
    pub listen_addr_family: AddrFamily,
    /// `SocketAddr::to_string()`/`parse()` representation.
    pub listen_addr: String,
    pub contact_details: ContactDetails,
    pub asn: i32,
    pub pgp_entity: PgpEntity,
    /// Self-signature over the rest of the payload (signature field
    /// zeroed); the issuing node for a `Node` event is the node itself.
    pub signature: Signature,
}

#[bon::bon]
impl Node {
    #[builder]
    pub fn new(
        id: NodeId,
        protocol_version: String,
        listen_addr_family: AddrFamily,
        listen_addr: String,
        contact_details: ContactDetails,
        asn: i32,
        pgp_entity: PgpEntity,
    ) -> Self {
        Self {
            id,
            protocol_version,
            listen_addr_family,
            listen_addr,
            contact_details,
            asn,
            pgp_entity,
            signature: Signature::ZERO,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut zeroed = self.clone();
        zeroed.signature = Signature::ZERO;
        bincode::encode_to_vec(&zeroed, bincode::config::standard()).expect("Node always encodes")
    }
}
