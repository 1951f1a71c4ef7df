//! A bilateral peering relationship, signed by both parties.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::signing::Signature;

#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Neighbor {
    pub node_a: NodeId,
    pub node_b: NodeId,
    pub signature_a: Signature,
    pub signature_b: Signature,
}

impl Neighbor {
    pub fn new(node_a: NodeId, node_b: NodeId) -> Self {
        Self {
            node_a,
            node_b,
            signature_a: Signature::ZERO,
            signature_b: Signature::ZERO,
        }
    }

    /// Canonical bytes for `node_a`'s signature: both signature fields
    /// zeroed, matching the zero-the-signature-field convention applied
    /// uniformly across payload kinds.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let zeroed = Self {
            node_a: self.node_a,
            node_b: self.node_b,
            signature_a: Signature::ZERO,
            signature_b: Signature::ZERO,
        };
        bincode::encode_to_vec(&zeroed, bincode::config::standard())
            .expect("Neighbor always encodes")
    }

    pub fn references(&self, node: NodeId) -> bool {
        self.node_a == node || self.node_b == node
    }

    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.node_a == node {
            Some(self.node_b)
        } else if self.node_b == node {
            Some(self.node_a)
        } else {
            None
        }
    }
}
