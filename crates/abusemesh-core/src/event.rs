//! The tagged-variant [`Event`]. Identity is the [`EventId`]; equality of
//! events is equality of id.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, NodeId};
use crate::neighbor::Neighbor;
use crate::node::Node;
use crate::report::{DelistAcceptance, DelistRequest, Report, ReportConfirmation};
use crate::signing::Signature;

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateKind {
    New,
    Edit,
    Delete,
}

/// One arm per payload kind. Exhaustive matches over this variant (the
/// validator, the table dispatcher) are a compile-time checkable change
/// when a new payload kind is added.
#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub enum EventPayload {
    Node(Node),
    Neighbor(Neighbor),
    Report(Report),
    ReportConfirmation(ReportConfirmation),
    DelistRequest(DelistRequest),
    DelistAcceptance(DelistAcceptance),
}

impl EventPayload {
    /// `true` for a payload that carries no data; this is a distinct
    /// invalidity from "unknown payload kind". A tagged Rust enum makes
    /// "unknown kind" unrepresentable, but an
    /// empty `Node`/`Report`/... identifier string still needs rejecting,
    /// which `Validator` checks per-variant.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            EventPayload::Node(n) => n.canonical_bytes(),
            EventPayload::Neighbor(n) => n.canonical_bytes(),
            EventPayload::Report(r) => r.canonical_bytes(),
            EventPayload::ReportConfirmation(c) => c.canonical_bytes(),
            EventPayload::DelistRequest(d) => d.canonical_bytes(),
            EventPayload::DelistAcceptance(d) => d.canonical_bytes(),
        }
    }

    /// The node whose signature must verify this payload. `Neighbor` has
    /// two issuers and is handled separately by the validator.
    pub fn sole_issuer(&self) -> Option<NodeId> {
        match self {
            EventPayload::Node(n) => Some(n.id),
            EventPayload::Report(r) => Some(r.issuing_node),
            EventPayload::ReportConfirmation(c) => Some(c.issuing_node),
            EventPayload::DelistRequest(d) => Some(d.issuing_node),
            EventPayload::DelistAcceptance(d) => Some(d.issuing_node),
            EventPayload::Neighbor(_) => None,
        }
    }

    pub fn signature(&self) -> Option<Signature> {
        match self {
            EventPayload::Node(n) => Some(n.signature),
            EventPayload::Report(r) => Some(r.signature),
            EventPayload::ReportConfirmation(c) => Some(c.signature),
            EventPayload::DelistRequest(d) => Some(d.signature),
            EventPayload::DelistAcceptance(d) => Some(d.signature),
            EventPayload::Neighbor(_) => None,
        }
    }
}

#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Event {
    pub id: EventId,
    pub kind: UpdateKind,
    pub payload: EventPayload,
}

#[bon::bon]
impl Event {
    #[builder]
    pub fn new(#[builder(default = EventId::new())] id: EventId, kind: UpdateKind, payload: EventPayload) -> Self {
        Self { id, kind, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AddrFamily, ContactDetails, PgpEntity};

    fn sample_node_payload() -> EventPayload {
        EventPayload::Node(
            Node::builder()
                .id(NodeId::new())
                .protocol_version("1".to_string())
                .listen_addr_family(AddrFamily::IPv4)
                .listen_addr("127.0.0.1:9000".to_string())
                .contact_details(ContactDetails::default())
                .asn(65000)
                .pgp_entity(PgpEntity {
                    packets: vec![0; 32],
                    primary_key_id: 0,
                    fingerprint: [0; 20],
                })
                .build(),
        )
    }

    #[test]
    fn event_identity_is_its_id() {
        let id = EventId::new();
        let e1 = Event::builder().id(id).kind(UpdateKind::New).payload(sample_node_payload()).build();
        let e2 = Event::builder().id(id).kind(UpdateKind::New).payload(sample_node_payload()).build();
        assert_eq!(e1.id, e2.id);
    }
}
