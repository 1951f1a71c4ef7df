//! The validator: a pure function from `(event, node snapshot)` to
//! valid/invalid. It is the sole place cryptographic verification of
//! incoming events happens.
//!
//! Validation reads from a cheap, periodically-refreshed clone of the node
//! table rather than routing through the `TableSet` worker, which would
//! serialize all ingress behind table mutation and couple write latency to
//! verification cost. [`NodeSnapshot`] is that clone.

use std::collections::{HashMap, HashSet};

use abusemesh_core::{Event, EventPayload, NodeId, ReportId, SignatureVerifier};
use snafu::Snafu;

/// A point-in-time clone of the node table, keyed by [`NodeId`], good
/// enough to verify issuer signatures and foreign-key preconditions
/// against. Refreshed periodically by whoever owns the real `TableSet`
/// (see `abusemesh-node`'s wiring).
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot(HashMap<NodeId, abusemesh_core::Node>);

impl NodeSnapshot {
    pub fn new(nodes: HashMap<NodeId, abusemesh_core::Node>) -> Self {
        Self(nodes)
    }

    pub fn get(&self, id: &NodeId) -> Option<&abusemesh_core::Node> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains_key(id)
    }
}

/// A point-in-time clone of the set of known report ids, good enough to
/// check the foreign-key precondition that a confirmation/delist
/// request/delist acceptance references an already-known report (§3).
/// Refreshed the same way as [`NodeSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct ReportSnapshot(HashSet<ReportId>);

impl ReportSnapshot {
    pub fn new(ids: HashSet<ReportId>) -> Self {
        Self(ids)
    }

    pub fn contains(&self, id: &ReportId) -> bool {
        self.0.contains(id)
    }
}

#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
pub enum Invalidity {
    #[snafu(display("event payload carries no data"))]
    EmptyPayload,
    #[snafu(display("issuing node {node} is unknown"))]
    UnknownIssuer { node: NodeId },
    #[snafu(display("signature does not verify for issuing node {node}"))]
    SignatureMismatch { node: NodeId },
    #[snafu(display("event carries no signature"))]
    MissingSignature,
    #[snafu(display("report {report} is unknown"))]
    UnknownReport { report: ReportId },
    #[snafu(display("neighbor event references the same node {node} on both sides"))]
    NeighborNotDistinct { node: NodeId },
}

pub type ValidationResult = std::result::Result<(), Invalidity>;

/// Checks emptiness distinct from "unknown payload kind": a tagged Rust
/// enum makes an unknown payload kind unrepresentable, but an
/// entity with an empty identifying string is still a distinct invalidity
/// worth surfacing separately in logs.
fn payload_is_empty(payload: &EventPayload) -> bool {
    match payload {
        EventPayload::Node(n) => n.listen_addr.is_empty(),
        EventPayload::Report(r) => r.suspect_identifier.is_empty(),
        EventPayload::Neighbor(_) => false,
        EventPayload::ReportConfirmation(_) => false,
        EventPayload::DelistRequest(_) => false,
        EventPayload::DelistAcceptance(_) => false,
    }
}

/// Validates `event` against `snapshot`. Never mutates `snapshot` or any
/// table; this is the only function in the crate permitted to call into
/// [`abusemesh_core::SignatureVerifier`].
pub fn validate(
    event: &Event,
    snapshot: &NodeSnapshot,
    reports: &ReportSnapshot,
    verifier: &impl SignatureVerifier,
) -> ValidationResult {
    if payload_is_empty(&event.payload) {
        return EmptyPayloadSnafu.fail();
    }

    match &event.payload {
        EventPayload::ReportConfirmation(c) if !reports.contains(&c.report) => {
            return UnknownReportSnafu { report: c.report }.fail();
        }
        EventPayload::DelistRequest(d) if !reports.contains(&d.report) => {
            return UnknownReportSnafu { report: d.report }.fail();
        }
        EventPayload::DelistAcceptance(d) if !reports.contains(&d.report) => {
            return UnknownReportSnafu { report: d.report }.fail();
        }
        _ => {}
    }

    if let EventPayload::Neighbor(neighbor) = &event.payload {
        if neighbor.node_a == neighbor.node_b {
            return NeighborNotDistinctSnafu { node: neighbor.node_a }.fail();
        }
        for node in [neighbor.node_a, neighbor.node_b] {
            if !snapshot.contains(&node) {
                return UnknownIssuerSnafu { node }.fail();
            }
        }
        let a = snapshot.get(&neighbor.node_a).expect("checked above");
        let b = snapshot.get(&neighbor.node_b).expect("checked above");
        let bytes = neighbor.canonical_bytes();
        verifier
            .verify(&a.pgp_entity, &bytes, &neighbor.signature_a)
            .map_err(|_| Invalidity::SignatureMismatch { node: neighbor.node_a })?;
        verifier
            .verify(&b.pgp_entity, &bytes, &neighbor.signature_b)
            .map_err(|_| Invalidity::SignatureMismatch { node: neighbor.node_b })?;
        return Ok(());
    }

    let issuer = event.payload.sole_issuer().expect("non-Neighbor payloads have a sole issuer");
    let node = snapshot.get(&issuer).ok_or(Invalidity::UnknownIssuer { node: issuer })?;
    let signature = event.payload.signature().ok_or(Invalidity::MissingSignature)?;
    let bytes = event.payload.canonical_bytes();
    verifier
        .verify(&node.pgp_entity, &bytes, &signature)
        .map_err(|_| Invalidity::SignatureMismatch { node: issuer })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use abusemesh_core::node::{AddrFamily, ContactDetails};
    use abusemesh_core::report::SuspectResource;
    use abusemesh_core::signing::{Ed25519Signer, Ed25519Verifier};
    use abusemesh_core::{Node, Report, SigningProvider as _};
    use rand::rngs::OsRng;

    use super::*;

    fn signer() -> Ed25519Signer {
        Ed25519Signer::generate(&mut OsRng)
    }

    fn node_for(signer: &Ed25519Signer, id: NodeId) -> Node {
        let pgp_entity = signer.pgp_entity();
        Node::builder()
            .id(id)
            .protocol_version("1".to_string())
            .listen_addr_family(AddrFamily::IPv4)
            .listen_addr("127.0.0.1:9000".to_string())
            .contact_details(ContactDetails::default())
            .asn(65000)
            .pgp_entity(pgp_entity)
            .build()
    }

    #[test]
    fn accepts_correctly_signed_report() {
        let signer = signer();
        let node_id = NodeId::new();
        let node = node_for(&signer, node_id);

        let mut report = Report::builder()
            .id(abusemesh_core::ReportId::new())
            .issuing_node(node_id)
            .suspect_resource_type(SuspectResource::IPRange)
            .suspect_identifier("198.51.100.0/24".to_string())
            .abuse_type("spam".to_string())
            .build();
        report.signature = signer.sign(&report.canonical_bytes());

        let snapshot = NodeSnapshot::new(HashMap::from([(node_id, node)]));
        let event = Event::builder()
            .kind(abusemesh_core::UpdateKind::New)
            .payload(EventPayload::Report(report))
            .build();

        assert!(validate(&event, &snapshot, &ReportSnapshot::default(), &Ed25519Verifier).is_ok());
    }

    #[test]
    fn rejects_unknown_issuer() {
        let signer = signer();
        let node_id = NodeId::new();

        let mut report = Report::builder()
            .id(abusemesh_core::ReportId::new())
            .issuing_node(node_id)
            .suspect_resource_type(SuspectResource::IPRange)
            .suspect_identifier("198.51.100.0/24".to_string())
            .abuse_type("spam".to_string())
            .build();
        report.signature = signer.sign(&report.canonical_bytes());

        let snapshot = NodeSnapshot::default();
        let event = Event::builder()
            .kind(abusemesh_core::UpdateKind::New)
            .payload(EventPayload::Report(report))
            .build();

        assert_eq!(
            validate(&event, &snapshot, &ReportSnapshot::default(), &Ed25519Verifier),
            Err(Invalidity::UnknownIssuer { node: node_id })
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let signer = signer();
        let node_id = NodeId::new();
        let node = node_for(&signer, node_id);

        let mut report = Report::builder()
            .id(abusemesh_core::ReportId::new())
            .issuing_node(node_id)
            .suspect_resource_type(SuspectResource::IPRange)
            .suspect_identifier("198.51.100.0/24".to_string())
            .abuse_type("spam".to_string())
            .build();
        report.signature = signer.sign(&report.canonical_bytes());
        report.abuse_type = "phishing".to_string();

        let snapshot = NodeSnapshot::new(HashMap::from([(node_id, node)]));
        let event = Event::builder()
            .kind(abusemesh_core::UpdateKind::New)
            .payload(EventPayload::Report(report))
            .build();

        assert_eq!(
            validate(&event, &snapshot, &ReportSnapshot::default(), &Ed25519Verifier),
            Err(Invalidity::SignatureMismatch { node: node_id })
        );
    }

    #[test]
    fn rejects_confirmation_of_unknown_report() {
        let signer = signer();
        let node_id = NodeId::new();
        let node = node_for(&signer, node_id);

        let report_id = abusemesh_core::ReportId::new();
        let mut confirmation = abusemesh_core::ReportConfirmation::new(node_id, report_id);
        confirmation.signature = signer.sign(&confirmation.canonical_bytes());

        let snapshot = NodeSnapshot::new(HashMap::from([(node_id, node)]));
        let event = Event::builder()
            .kind(abusemesh_core::UpdateKind::New)
            .payload(EventPayload::ReportConfirmation(confirmation))
            .build();

        assert_eq!(
            validate(&event, &snapshot, &ReportSnapshot::default(), &Ed25519Verifier),
            Err(Invalidity::UnknownReport { report: report_id })
        );

        let known_reports = ReportSnapshot::new(HashSet::from([report_id]));
        assert!(validate(&event, &snapshot, &known_reports, &Ed25519Verifier).is_ok());
    }

    #[test]
    fn rejects_neighbor_referencing_itself_twice() {
        use abusemesh_core::Neighbor;

        let signer = signer();
        let node_id = NodeId::new();
        let node = node_for(&signer, node_id);

        let mut neighbor = Neighbor::new(node_id, node_id);
        let bytes = neighbor.canonical_bytes();
        neighbor.signature_a = signer.sign(&bytes);
        neighbor.signature_b = signer.sign(&bytes);

        let snapshot = NodeSnapshot::new(HashMap::from([(node_id, node)]));
        let event = Event::builder()
            .kind(abusemesh_core::UpdateKind::New)
            .payload(EventPayload::Neighbor(neighbor))
            .build();

        assert_eq!(
            validate(&event, &snapshot, &ReportSnapshot::default(), &Ed25519Verifier),
            Err(Invalidity::NeighborNotDistinct { node: node_id })
        );
    }
}
