//! [`ServerSession`]: the serving half of a peer relation. Unlike
//! [`crate::client_session::ClientSession`], a `ServerSession` has no
//! control loop of its own — it is data owned by [`ClientSessionStorage`]
//! and driven from whatever task the transport layer spawned to handle the
//! incoming `TableEventStream` RPC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use abusemesh_core::{Event, NodeId, SessionId};
use abusemesh_db::EventStream;
use abusemesh_net_api::TableEvent;
use snafu::ensure;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SessionIdMismatchSnafu, SessionResult};
use crate::storage::SessionStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSessionState {
    Idle,
    Established,
    Interrupted,
}

impl ServerSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Established => "established",
            Self::Interrupted => "interrupted",
        }
    }
}

/// The server's view of one connected client. The `session_id` is agreed
/// once in `NegotiateNeighborship` and must match on every subsequent
/// `TableEventStream` call for the same client.
pub struct ServerSession {
    client: NodeId,
    session_id: RwLock<Option<SessionId>>,
    state: RwLock<ServerSessionState>,
    event_counter: AtomicU64,
    last_activity: RwLock<tokio::time::Instant>,
}

impl ServerSession {
    pub fn new(client: NodeId) -> Self {
        Self {
            client,
            session_id: RwLock::new(None),
            state: RwLock::new(ServerSessionState::Idle),
            event_counter: AtomicU64::new(0),
            last_activity: RwLock::new(tokio::time::Instant::now()),
        }
    }

    pub fn client(&self) -> NodeId {
        self.client
    }

    pub async fn state(&self) -> ServerSessionState {
        *self.state.read().await
    }

    pub fn event_counter(&self) -> u64 {
        self.event_counter.load(Ordering::SeqCst)
    }

    /// Negotiates a fresh `SessionId` for this client. Resets the replay
    /// cursor: the client is expected to open its stream at whatever offset
    /// it chooses next.
    pub async fn negotiate(&self) -> SessionId {
        let id = SessionId::new();
        *self.session_id.write().await = Some(id);
        *self.last_activity.write().await = tokio::time::Instant::now();
        id
    }

    async fn bind(&self, requested: SessionId) -> SessionResult<()> {
        let mut current = self.session_id.write().await;
        match *current {
            Some(existing) => ensure!(
                existing == requested,
                SessionIdMismatchSnafu {
                    given: requested,
                    current: existing,
                }
            ),
            None => *current = Some(requested),
        }
        Ok(())
    }

    /// Drives one `TableEventStream` call to completion: replays every
    /// event from `offset` onward, then streams newly accepted events as
    /// they arrive until the connection errors or `cancel` fires. Replay is
    /// satisfied from the EventStream snapshot by skipping the first
    /// `offset` accepted events, then the session attaches as an observer
    /// for subsequent real-time delivery.
    pub async fn serve<W>(
        self: &Arc<Self>,
        session_id: SessionId,
        offset: u64,
        event_stream: &Arc<EventStream>,
        stream: &mut W,
        cancel: CancellationToken,
    ) -> SessionResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.bind(session_id).await?;
        self.event_counter.store(offset, Ordering::SeqCst);
        *self.state.write().await = ServerSessionState::Established;

        let backlog = event_stream.get_events_from(offset).await?;

        for event in backlog {
            self.push(&event, event_stream, stream).await?;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let observer_id = event_stream
            .attach(Arc::new(ObserverForward { tx }))
            .await;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break Ok(());
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = self.push(&event, event_stream, stream).await {
                                break Err(err);
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        event_stream.detach(observer_id).await;
        *self.state.write().await = ServerSessionState::Interrupted;
        result
    }

    async fn push<W>(
        &self,
        event: &Event,
        _event_stream: &Arc<EventStream>,
        stream: &mut W,
    ) -> SessionResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        abusemesh_net::connection::write_framed_response(
            stream,
            &TableEvent {
                event: event.clone(),
            },
        )
        .await?;
        self.event_counter.fetch_add(1, Ordering::SeqCst);
        *self.last_activity.write().await = tokio::time::Instant::now();
        Ok(())
    }

    /// Administrative close: Established -> Idle.
    pub async fn close(&self) {
        *self.state.write().await = ServerSessionState::Idle;
    }

    /// True if the session has sat `Interrupted` for at least `timeout`.
    pub async fn is_stale(&self, timeout: std::time::Duration) -> bool {
        *self.state.read().await == ServerSessionState::Interrupted
            && self.last_activity.read().await.elapsed() >= timeout
    }
}

struct ObserverForward {
    tx: tokio::sync::mpsc::Sender<Event>,
}

impl abusemesh_db::EventObserver for ObserverForward {
    fn event_accepted(&self, event: &Event) {
        if self.tx.try_send(event.clone()).is_err() {
            debug!(
                target: "abusemesh::session::server",
                "observer channel full or closed, dropping forwarded event"
            );
        }
    }
}

/// Default timeout after which a swept `Interrupted` session is dropped.
pub const DEFAULT_INTERRUPTED_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Periodically removes `ServerSession`s that have sat `Interrupted` for
/// longer than `timeout`, to avoid unbounded session accumulation.
pub async fn sweep_interrupted_sessions(
    storage: &ClientSessionStorage,
    timeout: std::time::Duration,
) {
    for (peer, session) in storage.all().await {
        if session.is_stale(timeout).await {
            info!(target: "abusemesh::session::server", %peer, "sweeping stale interrupted session");
            let _ = storage.remove(peer).await;
        }
    }
}

/// The serving side's per-client storage: a map from client NodeId to
/// session.
pub type ClientSessionStorage = SessionStorage<ServerSession>;

#[cfg(test)]
mod tests {
    use abusemesh_core::signing::Ed25519Verifier;
    use abusemesh_core::{EventPayload, SigningProvider as _, UpdateKind};
    use abusemesh_db::Database;

    use super::*;

    fn report_event(
        signer: &abusemesh_core::signing::Ed25519Signer,
        issuing_node: NodeId,
    ) -> Event {
        let mut report = abusemesh_core::Report::builder()
            .id(abusemesh_core::ReportId::new())
            .issuing_node(issuing_node)
            .suspect_resource_type(abusemesh_core::report::SuspectResource::IPRange)
            .suspect_identifier("203.0.113.0/24".to_string())
            .abuse_type("spam".to_string())
            .build();
        report.signature = signer.sign(&report.canonical_bytes());
        Event::builder()
            .kind(UpdateKind::New)
            .payload(EventPayload::Report(report))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn rejects_mismatched_session_id() {
        let session = Arc::new(ServerSession::new(NodeId::new()));
        let negotiated = session.negotiate().await;
        let other = SessionId::new();
        assert_ne!(negotiated, other);

        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let event_stream = EventStream::new(db, 16, Ed25519Verifier);
        let mut sink = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session
            .serve(other, 0, &event_stream, &mut sink, cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SessionError::SessionIdMismatch { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn replays_backlog_then_forwards_live_events() {
        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let event_stream = EventStream::new(db, 16, Ed25519Verifier);
        let run_cancel = CancellationToken::new();
        let run_handle = tokio::spawn(event_stream.clone().run(run_cancel.clone()));

        let signer = abusemesh_core::signing::Ed25519Signer::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::new();
        let node = abusemesh_core::Node::builder()
            .id(node_id)
            .protocol_version("1".to_string())
            .listen_addr_family(abusemesh_core::node::AddrFamily::IPv4)
            .listen_addr("127.0.0.1:9002".to_string())
            .contact_details(abusemesh_core::node::ContactDetails::default())
            .asn(65000)
            .pgp_entity(signer.pgp_entity())
            .build();
        let mut snapshot = std::collections::HashMap::new();
        snapshot.insert(node_id, node);
        event_stream
            .refresh_node_snapshot(abusemesh_db::NodeSnapshot::new(snapshot))
            .await;

        let backlog_event = report_event(&signer, node_id);
        event_stream
            .write_channel()
            .send(backlog_event.clone())
            .await
            .expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let session = Arc::new(ServerSession::new(node_id));
        let session_id = session.negotiate().await;
        let mut sink = Vec::new();
        let cancel = CancellationToken::new();

        let session_clone = session.clone();
        let event_stream_clone = event_stream.clone();
        let cancel_clone = cancel.clone();
        let serve_handle = tokio::spawn(async move {
            session_clone
                .serve(session_id, 0, &event_stream_clone, &mut sink, cancel_clone)
                .await
                .expect("serve");
            sink
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(session.event_counter(), 1);

        let live_event = report_event(&signer, node_id);
        event_stream
            .write_channel()
            .send(live_event.clone())
            .await
            .expect("send live");
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(session.event_counter(), 2);

        cancel.cancel();
        let sink = serve_handle.await.expect("serve join");
        assert!(!sink.is_empty());

        run_cancel.cancel();
        run_handle.await.expect("event stream join");
    }
}
