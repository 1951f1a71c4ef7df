//! [`ClientSession`]: the consuming half of a peer relation. One
//! `ClientSession` per upstream server, each driven by its own task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abusemesh_core::{Event, Node, NodeId, SessionId};
use abusemesh_db::EventStream;
use abusemesh_net::connection::StreamGuard;
use abusemesh_net::Connection;
use abusemesh_net_api::{NegotiateNeighborshipRequest, TableEvent, TableEventStreamRequest};
use abusemesh_util_error::AsFmtCompact as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::SessionResult;
use crate::storage::SessionStorage;

const LOG_TARGET: &str = "abusemesh::session::client";

/// Backoff/threshold knobs for a [`ClientSession`]'s state machine. Backoff
/// is additive and configurable; defaults are 30s for idle backoff and 1s
/// between state-machine iterations, with a failure threshold of 3.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub idle_backoff: Duration,
    pub iteration_interval: Duration,
    pub failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_secs(30),
            iteration_interval: Duration::from_secs(1),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    Idle,
    Connecting,
    Established,
    Interrupted,
}

impl ClientSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Interrupted => "interrupted",
        }
    }
}

/// A point-in-time, admin-query-friendly view of a [`ClientSession`] (feeds
/// the `GetServers` admin RPC).
#[derive(Debug, Clone)]
pub struct ClientSessionStatus {
    pub peer: NodeId,
    pub state: ClientSessionState,
    pub event_counter: u64,
    pub admin_down: bool,
}

/// Dials a peer by [`NodeId`], producing a framed RPC [`Connection`].
/// Separated out so the session state machine stays transport-generic: in
/// production this resolves the peer's `listen_addr` (via the node table)
/// and opens a TCP connection; tests can substitute an in-memory pair.
#[async_trait::async_trait]
pub trait PeerDialer<T>: Send + Sync
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn dial(&self, peer: &Node) -> SessionResult<Connection<T>>;
}

/// The consuming-side state machine for one upstream peer.
pub struct ClientSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    self_id: NodeId,
    peer: NodeId,
    dialer: Arc<dyn PeerDialer<T>>,
    table_set: abusemesh_db::TableSetHandle,
    event_stream: Arc<EventStream>,
    config: SessionConfig,

    session_id: RwLock<Option<SessionId>>,
    event_counter: AtomicU64,
    admin_down: AtomicBool,
    state: RwLock<ClientSessionState>,
}

impl<T> ClientSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        self_id: NodeId,
        peer: NodeId,
        dialer: Arc<dyn PeerDialer<T>>,
        table_set: abusemesh_db::TableSetHandle,
        event_stream: Arc<EventStream>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            peer,
            dialer,
            table_set,
            event_stream,
            config,
            session_id: RwLock::new(None),
            event_counter: AtomicU64::new(0),
            admin_down: AtomicBool::new(false),
            state: RwLock::new(ClientSessionState::Idle),
        })
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub async fn set_admin_down(&self, down: bool) {
        self.admin_down.store(down, Ordering::SeqCst);
    }

    pub async fn status(&self) -> ClientSessionStatus {
        ClientSessionStatus {
            peer: self.peer,
            state: *self.state.read().await,
            event_counter: self.event_counter.load(Ordering::SeqCst),
            admin_down: self.admin_down.load(Ordering::SeqCst),
        }
    }

    async fn reset(&self) {
        *self.session_id.write().await = None;
        self.event_counter.store(0, Ordering::SeqCst);
    }

    /// The state machine's control loop, cycling through the four-state
    /// table. Runs until `cancel` fires.
    #[instrument(name = "client-session", skip_all, fields(peer = %self.peer))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut next_attempt = Instant::now();
        let mut failed_connection_attempts = 0u32;
        let mut failed_reconnect_attempts = 0u32;
        let mut open_stream: Option<StreamGuard<T>> = None;

        loop {
            if cancel.is_cancelled() {
                debug!(target: LOG_TARGET, "session cancelled");
                return;
            }

            let state = *self.state.read().await;
            match state {
                ClientSessionState::Idle => {
                    if self.admin_down.load(Ordering::SeqCst) {
                        if sleep_or_cancel(self.config.iteration_interval, &cancel).await {
                            return;
                        }
                        continue;
                    }

                    if next_attempt <= Instant::now() {
                        next_attempt = Instant::now() + self.config.idle_backoff;
                        *self.state.write().await = ClientSessionState::Connecting;
                    } else if sleep_or_cancel(self.config.iteration_interval, &cancel).await {
                        return;
                    }
                }

                ClientSessionState::Connecting => {
                    match self.try_connect().await {
                        Ok(guard) => {
                            open_stream = Some(guard);
                            failed_connection_attempts = 0;
                            *self.state.write().await = ClientSessionState::Established;
                        }
                        Err(err) => {
                            warn!(target: LOG_TARGET, peer = %self.peer, err = %err.fmt_compact(), "negotiation/stream open failed");
                            failed_connection_attempts += 1;
                            if failed_connection_attempts >= self.config.failure_threshold {
                                self.reset().await;
                                failed_connection_attempts = 0;
                                next_attempt = Instant::now() + self.config.idle_backoff;
                                *self.state.write().await = ClientSessionState::Idle;
                            }
                            if sleep_or_cancel(self.config.iteration_interval, &cancel).await {
                                return;
                            }
                        }
                    }
                }

                ClientSessionState::Established => {
                    let Some(guard) = open_stream.as_mut() else {
                        *self.state.write().await = ClientSessionState::Interrupted;
                        continue;
                    };
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = guard.recv_frame::<TableEvent>() => frame,
                    };
                    match frame {
                        Ok(frame) => {
                            if self.event_stream.write_channel().send(frame.event).await.is_err() {
                                debug!(target: LOG_TARGET, "local event stream gone, quitting");
                                return;
                            }
                            self.event_counter.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            info!(target: LOG_TARGET, peer = %self.peer, err = %err.fmt_compact(), "event stream interrupted");
                            open_stream = None;
                            *self.state.write().await = ClientSessionState::Interrupted;
                        }
                    }
                }

                ClientSessionState::Interrupted => {
                    match self.try_reconnect().await {
                        Ok(guard) => {
                            open_stream = Some(guard);
                            failed_reconnect_attempts = 0;
                            *self.state.write().await = ClientSessionState::Established;
                        }
                        Err(err) => {
                            warn!(target: LOG_TARGET, peer = %self.peer, err = %err.fmt_compact(), "reconnect failed");
                            failed_reconnect_attempts += 1;
                            if failed_reconnect_attempts >= self.config.failure_threshold {
                                self.reset().await;
                                failed_reconnect_attempts = 0;
                                next_attempt = Instant::now() + self.config.idle_backoff;
                                *self.state.write().await = ClientSessionState::Idle;
                            }
                            if sleep_or_cancel(self.config.iteration_interval, &cancel).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn peer_node(&self) -> SessionResult<Node> {
        self.table_set
            .get_node(self.peer)
            .await
            .ok_or(crate::error::SessionError::UnknownPeer { peer: self.peer })
    }

    async fn try_connect(&self) -> SessionResult<StreamGuard<T>> {
        let peer = self.peer_node().await?;
        let conn = self.dialer.dial(&peer).await?;

        let negotiation = conn
            .rpc(&NegotiateNeighborshipRequest {
                requesting_node: self.self_id,
            })
            .await?;
        *self.session_id.write().await = Some(negotiation.session_id);

        let offset = self.event_counter.load(Ordering::SeqCst);
        let (_ack, guard) = conn
            .rpc_streaming(&TableEventStreamRequest {
                node_id: self.self_id,
                session_id: negotiation.session_id,
                offset,
            })
            .await?;
        Ok(guard)
    }

    /// Reopens the event stream at the current `event_counter`, preserving
    /// `session_id` rather than renegotiating a fresh one (spec's
    /// Interrupted -> Established transition). This always dials a new
    /// connection, so `node_id` rides along on the request itself: the
    /// server resolves the existing `ServerSession` from it instead of
    /// relying on a `NegotiateNeighborship` having happened on this
    /// connection.
    async fn try_reconnect(&self) -> SessionResult<StreamGuard<T>> {
        let peer = self.peer_node().await?;
        let conn = self.dialer.dial(&peer).await?;
        let session_id = self
            .session_id
            .read()
            .await
            .ok_or(crate::error::SessionError::NotFound)?;
        let offset = self.event_counter.load(Ordering::SeqCst);
        let (_ack, guard) = conn
            .rpc_streaming(&TableEventStreamRequest {
                node_id: self.self_id,
                session_id,
                offset,
            })
            .await?;
        Ok(guard)
    }
}

/// Sleeps for `dur` unless `cancel` fires first; returns `true` if
/// cancelled.
async fn sleep_or_cancel(dur: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(dur) => false,
    }
}

/// The consuming side's per-upstream-peer storage: a map from server
/// NodeId to ClientSession, with the same shape and locking as the serving
/// side's storage.
pub type ServerSessionStorage<T> = SessionStorage<ClientSession<T>>;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use abusemesh_core::signing::Ed25519Verifier;
    use abusemesh_core::node::{AddrFamily, ContactDetails};
    use abusemesh_core::{SessionId, SigningProvider as _};
    use abusemesh_db::{Database, NodeSnapshot, TableSet};
    use abusemesh_net::connection::{decode_request_body, read_framed_request, write_framed_response};
    use abusemesh_net_api::{NegotiateNeighborshipResponse, TableEventStreamResponse};
    use tokio::io::DuplexStream;

    use super::*;

    struct DirectDialer {
        peer_conn: tokio::sync::Mutex<Option<Connection<DuplexStream>>>,
    }

    #[async_trait::async_trait]
    impl PeerDialer<DuplexStream> for DirectDialer {
        async fn dial(&self, _peer: &Node) -> SessionResult<Connection<DuplexStream>> {
            Ok(self
                .peer_conn
                .lock()
                .await
                .take()
                .expect("single use in test"))
        }
    }

    async fn make_node(signer: &abusemesh_core::signing::Ed25519Signer, id: NodeId) -> Node {
        Node::builder()
            .id(id)
            .protocol_version("1".to_string())
            .listen_addr_family(AddrFamily::IPv4)
            .listen_addr("127.0.0.1:9001".to_string())
            .contact_details(ContactDetails::default())
            .asn(65000)
            .pgp_entity(signer.pgp_entity())
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn negotiates_then_receives_pushed_events() {
        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let event_stream = EventStream::new(db.clone(), 16, Ed25519Verifier);
        let (table_set, handle) = TableSet::new(db, 16);
        tokio::spawn(table_set.run(CancellationToken::new()));

        let signer = abusemesh_core::signing::Ed25519Signer::generate(&mut rand::rngs::OsRng);
        let peer_id = NodeId::new();
        let node = make_node(&signer, peer_id).await;
        let mut snapshot = HashMap::new();
        snapshot.insert(peer_id, node);
        event_stream
            .refresh_node_snapshot(NodeSnapshot::new(snapshot))
            .await;

        let self_id = NodeId::new();
        let (client_side, mut server_side) = tokio::io::duplex(8192);
        let dialer: Arc<dyn PeerDialer<DuplexStream>> = Arc::new(DirectDialer {
            peer_conn: tokio::sync::Mutex::new(Some(Connection::new(client_side))),
        });

        let fake_server = tokio::spawn(async move {
            let (rpc_id, body) = read_framed_request(&mut server_side).await.expect("req");
            assert_eq!(rpc_id, abusemesh_net::RpcId::NegotiateNeighborship);
            let req: abusemesh_net_api::NegotiateNeighborshipRequest =
                decode_request_body(&body).expect("decode");
            assert_eq!(req.requesting_node, self_id);
            let session_id = SessionId::new();
            write_framed_response(
                &mut server_side,
                &NegotiateNeighborshipResponse { session_id },
            )
            .await
            .expect("write");

            let (rpc_id, body) = read_framed_request(&mut server_side).await.expect("req");
            assert_eq!(rpc_id, abusemesh_net::RpcId::TableEventStream);
            let req: abusemesh_net_api::TableEventStreamRequest =
                decode_request_body(&body).expect("decode");
            assert_eq!(req.node_id, self_id);
            assert_eq!(req.offset, 0);
            write_framed_response(&mut server_side, &TableEventStreamResponse { session_id })
                .await
                .expect("write");

            let mut report = abusemesh_core::Report::builder()
                .id(abusemesh_core::ReportId::new())
                .issuing_node(peer_id)
                .suspect_resource_type(abusemesh_core::report::SuspectResource::IPRange)
                .suspect_identifier("198.51.100.0/24".to_string())
                .abuse_type("spam".to_string())
                .build();
            report.signature = signer.sign(&report.canonical_bytes());
            let event = abusemesh_core::Event::builder()
                .kind(abusemesh_core::UpdateKind::New)
                .payload(abusemesh_core::EventPayload::Report(report))
                .build();
            write_framed_response(&mut server_side, &TableEvent { event })
                .await
                .expect("write event");

            // Keep the connection open past the assertions below; the test
            // cancels the session before this task's drop would close it.
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let session = ClientSession::new(
            self_id,
            peer_id,
            dialer,
            handle,
            event_stream.clone(),
            SessionConfig {
                idle_backoff: Duration::from_secs(3600),
                iteration_interval: Duration::from_millis(10),
                failure_threshold: 3,
            },
        );

        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(session.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = session.status().await;
        assert_eq!(status.state, ClientSessionState::Established);
        assert_eq!(status.event_counter, 1);
        assert_eq!(event_stream.get_all_events().await.expect("events").len(), 1);

        cancel.cancel();
        run_handle.await.expect("join");
        fake_server.await.expect("join");
    }
}
