//! Per-accepted-connection RPC dispatch. One task per inbound TCP
//! connection, reading framed requests and
//! dispatching on [`abusemesh_net::RpcId`]: a `TableEventStream` call hands
//! the connection off to [`abusemesh_session::ServerSession::serve`] for the
//! rest of its lifetime, since nothing else will be dispatched on it again.

use std::collections::HashMap;
use std::sync::Arc;

use abusemesh_core::signing::Ed25519Verifier;
use abusemesh_core::{Event, EventPayload, Neighbor, NodeId, SignatureVerifier as _, UpdateKind};
use abusemesh_net::connection::{decode_request_body, read_framed_request, write_framed_response};
use abusemesh_net::RpcId;
use abusemesh_net_api::{
    admin, GetHistoricTableEventsResponse, GetNodeResponse, GetNodeTableResponse,
    GetNeighborTableResponse, GetDelistAcceptanceTableResponse, GetDelistRequestTableResponse,
    GetReportConfirmationTableResponse, GetReportTableResponse, NegotiateNeighborshipResponse,
    OfferSignatureResponse, PingResponse, TableEventStreamResponse,
};
use abusemesh_session::{ClientSessionStorage, ServerSession, ServerSessionStorage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NodeResult;
use crate::transport::NodeStream;

const LOG_TARGET: &str = "abusemesh::node::dispatch";

/// Matches up complementary [`abusemesh_net_api::OfferSignatureRequest`]s
/// (one from each side of a prospective [`Neighbor`] pairing) before
/// assembling and enqueuing the resulting `Neighbor` event.
#[derive(Default)]
pub struct PendingOffers {
    offers: tokio::sync::Mutex<HashMap<(NodeId, NodeId), HashMap<NodeId, abusemesh_core::Signature>>>,
}

impl PendingOffers {
    fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Records `offering_node`'s signature over the `(offering_node,
    /// subject_node)` pairing; returns the completed [`Neighbor`] once both
    /// sides have offered a verified signature.
    async fn record(
        &self,
        offering_node: NodeId,
        subject_node: NodeId,
        signature: abusemesh_core::Signature,
    ) -> Option<Neighbor> {
        let key = Self::pair_key(offering_node, subject_node);
        let mut offers = self.offers.lock().await;
        let entry = offers.entry(key).or_default();
        entry.insert(offering_node, signature);

        let (node_a, node_b) = key;
        let sig_a = entry.get(&node_a).copied();
        let sig_b = entry.get(&node_b).copied();
        match (sig_a, sig_b) {
            (Some(signature_a), Some(signature_b)) => {
                offers.remove(&key);
                Some(Neighbor {
                    node_a,
                    node_b,
                    signature_a,
                    signature_b,
                })
            }
            _ => None,
        }
    }
}

/// Everything a connection-handling task needs: the shared storages and
/// workers a running node owns.
pub struct NodeContext {
    pub self_id: NodeId,
    pub event_stream: Arc<abusemesh_db::EventStream>,
    pub table_set: abusemesh_db::TableSetHandle,
    pub client_session_storage: Arc<ClientSessionStorage>,
    pub server_session_storage: Arc<ServerSessionStorage<NodeStream>>,
    pub pending_offers: PendingOffers,
}

/// Drives one accepted connection (plain or TLS-wrapped per
/// `transport = "..."`) until it errors, the peer hangs up, or `cancel`
/// fires.
pub async fn handle_connection(
    ctx: Arc<NodeContext>,
    mut stream: NodeStream,
    cancel: CancellationToken,
) -> NodeResult<()> {
    let mut bound_client: Option<NodeId> = None;

    loop {
        let (rpc_id, body) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            req = read_framed_request(&mut stream) => req?,
        };

        match rpc_id {
            RpcId::Ping => {
                let _req: abusemesh_net_api::PingRequest = decode_request_body(&body)?;
                write_framed_response(&mut stream, &PingResponse).await?;
            }

            RpcId::GetNode => {
                let _req: abusemesh_net_api::GetNodeRequest = decode_request_body(&body)?;
                if let Some(node) = ctx.table_set.get_node(ctx.self_id).await {
                    write_framed_response(&mut stream, &GetNodeResponse { node }).await?;
                } else {
                    warn!(target: LOG_TARGET, "local node record missing from table set");
                    return Ok(());
                }
            }

            RpcId::NegotiateNeighborship => {
                let req: abusemesh_net_api::NegotiateNeighborshipRequest =
                    decode_request_body(&body)?;
                let session = ctx
                    .client_session_storage
                    .get_or_insert_with(req.requesting_node, || {
                        ServerSession::new(req.requesting_node)
                    })
                    .await;
                let session_id = session.negotiate().await;
                bound_client = Some(req.requesting_node);
                write_framed_response(&mut stream, &NegotiateNeighborshipResponse { session_id })
                    .await?;
            }

            RpcId::GetNodeTable => {
                let _req: abusemesh_net_api::GetNodeTableRequest = decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_nodes(cancel.clone()).await;
                write_framed_response(&mut stream, &GetNodeTableResponse { rows }).await?;
            }
            RpcId::GetReportTable => {
                let _req: abusemesh_net_api::GetReportTableRequest = decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_reports(cancel.clone()).await;
                write_framed_response(&mut stream, &GetReportTableResponse { rows }).await?;
            }
            RpcId::GetNeighborTable => {
                let _req: abusemesh_net_api::GetNeighborTableRequest = decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_neighbors(cancel.clone()).await;
                write_framed_response(&mut stream, &GetNeighborTableResponse { rows }).await?;
            }
            RpcId::GetReportConfirmationTable => {
                let _req: abusemesh_net_api::GetReportConfirmationTableRequest =
                    decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_report_confirmations(cancel.clone()).await;
                write_framed_response(&mut stream, &GetReportConfirmationTableResponse { rows })
                    .await?;
            }
            RpcId::GetDelistRequestTable => {
                let _req: abusemesh_net_api::GetDelistRequestTableRequest =
                    decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_delist_requests(cancel.clone()).await;
                write_framed_response(&mut stream, &GetDelistRequestTableResponse { rows }).await?;
            }
            RpcId::GetDelistAcceptanceTable => {
                let _req: abusemesh_net_api::GetDelistAcceptanceTableRequest =
                    decode_request_body(&body)?;
                let rows = ctx.table_set.get_all_delist_acceptances(cancel.clone()).await;
                write_framed_response(&mut stream, &GetDelistAcceptanceTableResponse { rows })
                    .await?;
            }

            RpcId::GetHistoricTableEvents => {
                let _req: abusemesh_net_api::GetHistoricTableEventsRequest =
                    decode_request_body(&body)?;
                let events = ctx.event_stream.get_all_events().await?;
                write_framed_response(&mut stream, &GetHistoricTableEventsResponse { events })
                    .await?;
            }

            RpcId::TableEventStream => {
                let req: abusemesh_net_api::TableEventStreamRequest = decode_request_body(&body)?;
                // A reconnect after `Interrupted` dials a fresh connection and
                // preserves `session_id` rather than renegotiating, so this
                // connection may never have seen `NegotiateNeighborship`;
                // fall back to the client-asserted `node_id` and let
                // `ServerSession::serve`'s session-id check below guard
                // against impersonation.
                let client = bound_client.unwrap_or(req.node_id);
                let Some(session) = ctx.client_session_storage.get(client).await else {
                    warn!(target: LOG_TARGET, %client, "no session for client");
                    return Ok(());
                };
                write_framed_response(
                    &mut stream,
                    &TableEventStreamResponse {
                        session_id: req.session_id,
                    },
                )
                .await?;
                info!(target: LOG_TARGET, %client, offset = req.offset, "serving table event stream");
                session
                    .serve(req.session_id, req.offset, &ctx.event_stream, &mut stream, cancel.clone())
                    .await?;
                return Ok(());
            }

            RpcId::OfferSignature => {
                let req: abusemesh_net_api::OfferSignatureRequest = decode_request_body(&body)?;
                let accepted = handle_offer_signature(&ctx, &req).await;
                write_framed_response(&mut stream, &OfferSignatureResponse { accepted }).await?;
            }

            RpcId::AdminGetNode => {
                let req: admin::GetNodeRequest = decode_request_body(&body)?;
                let node = ctx.table_set.get_node(req.node).await;
                write_framed_response(&mut stream, &admin::GetNodeResponse { node }).await?;
            }
            RpcId::AdminGetClients => {
                let _req: admin::GetClientsRequest = decode_request_body(&body)?;
                let mut clients = Vec::new();
                for (node, session) in ctx.client_session_storage.all().await {
                    clients.push(admin::ClientSummary {
                        node,
                        state: session.state().await.as_str().to_string(),
                        event_counter: session.event_counter(),
                    });
                }
                write_framed_response(&mut stream, &admin::GetClientsResponse { clients }).await?;
            }
            RpcId::AdminGetServers => {
                let _req: admin::GetServersRequest = decode_request_body(&body)?;
                let mut servers = Vec::new();
                for (_, session) in ctx.server_session_storage.all().await {
                    let status = session.status().await;
                    servers.push(admin::ServerSummary {
                        node: status.peer,
                        state: status.state.as_str().to_string(),
                        event_counter: status.event_counter,
                        admin_down: status.admin_down,
                    });
                }
                write_framed_response(&mut stream, &admin::GetServersResponse { servers }).await?;
            }
        }
    }
}

async fn handle_offer_signature(
    ctx: &NodeContext,
    req: &abusemesh_net_api::OfferSignatureRequest,
) -> bool {
    let Some(offering) = ctx.table_set.get_node(req.offering_node).await else {
        debug!(target: LOG_TARGET, node = %req.offering_node, "offer from unknown node rejected");
        return false;
    };

    let (node_a, node_b) = if req.offering_node < req.subject_node {
        (req.offering_node, req.subject_node)
    } else {
        (req.subject_node, req.offering_node)
    };
    let canonical = Neighbor::new(node_a, node_b).canonical_bytes();

    if Ed25519Verifier
        .verify(&offering.pgp_entity, &canonical, &req.signature)
        .is_err()
    {
        debug!(target: LOG_TARGET, node = %req.offering_node, "offer signature does not verify");
        return false;
    }

    if let Some(neighbor) = ctx
        .pending_offers
        .record(req.offering_node, req.subject_node, req.signature)
        .await
    {
        let event = Event::builder()
            .kind(UpdateKind::New)
            .payload(EventPayload::Neighbor(neighbor))
            .build();
        if ctx.event_stream.write_channel().send(event).await.is_err() {
            warn!(target: LOG_TARGET, "event stream gone, dropping matched neighbor offer");
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use abusemesh_core::signing::Ed25519Verifier;
    use abusemesh_db::{Database, EventStream, TableSet};
    use abusemesh_net::Connection;
    use abusemesh_net_api::{NegotiateNeighborshipRequest, TableEventStreamRequest};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn spawn_node(cancel: CancellationToken) -> std::net::SocketAddr {
        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let event_stream = EventStream::new(db.clone(), 16, Ed25519Verifier);
        let (table_set, table_set_handle) = TableSet::new(db, 16);
        tokio::spawn(table_set.run(cancel.clone()));
        event_stream.attach(table_set_handle.as_observer()).await;

        let ctx = Arc::new(NodeContext {
            self_id: NodeId::new(),
            event_stream,
            table_set: table_set_handle,
            client_session_storage: Arc::new(ClientSessionStorage::new()),
            server_session_storage: Arc::new(ServerSessionStorage::<NodeStream>::new()),
            pending_offers: PendingOffers::default(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        let (stream, _) = accepted.expect("accept");
                        let stream: NodeStream = Box::new(stream);
                        let ctx = ctx.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            let _ = handle_connection(ctx, stream, cancel).await;
                        });
                    }
                }
            }
        });

        addr
    }

    /// Regression test for the `Interrupted` -> `Established` reconnect
    /// path (spec.md's "reopen the event stream ... preserving SessionId"):
    /// a `TableEventStream` call on a brand-new connection, with no
    /// `NegotiateNeighborship` on that same connection, must still resolve
    /// to the already-negotiated `ServerSession` via the request's
    /// `node_id`.
    #[tokio::test]
    async fn reconnect_resolves_session_without_renegotiating() {
        let cancel = CancellationToken::new();
        let addr = spawn_node(cancel.clone()).await;
        let client_node = NodeId::new();

        let first = Connection::new(TcpStream::connect(addr).await.expect("connect"));
        let negotiation = first
            .rpc(&NegotiateNeighborshipRequest {
                requesting_node: client_node,
            })
            .await
            .expect("negotiate");

        let (ack, guard) = first
            .rpc_streaming(&TableEventStreamRequest {
                node_id: client_node,
                session_id: negotiation.session_id,
                offset: 0,
            })
            .await
            .expect("open stream");
        assert_eq!(ack.session_id, negotiation.session_id);
        drop(guard);
        drop(first);

        // A fresh TCP connection, simulating a reconnect after the
        // transport dropped: no NegotiateNeighborship call happens here.
        let second = Connection::new(TcpStream::connect(addr).await.expect("reconnect"));
        let (ack, _guard) = second
            .rpc_streaming(&TableEventStreamRequest {
                node_id: client_node,
                session_id: negotiation.session_id,
                offset: 0,
            })
            .await
            .expect("reopen stream without renegotiating");
        assert_eq!(ack.session_id, negotiation.session_id);

        cancel.cancel();
    }
}
