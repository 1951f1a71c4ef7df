//! `abusemesh-node`: the replication daemon. Loads a
//! [`config::NodeConfig`], opens the local database, wires
//! [`abusemesh_db::EventStream`] and [`abusemesh_db::TableSet`] together with
//! one [`abusemesh_session::ClientSession`] per configured peer and a TCP
//! accept loop serving [`abusemesh_session::ServerSession`]s, and runs until
//! terminated.

mod cli;
mod config;
mod dispatch;
mod error;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use abusemesh_core::signing::{Ed25519Signer, Ed25519Verifier};
use abusemesh_core::{Event, EventPayload, SigningProvider as _, UpdateKind};
use abusemesh_db::{Database, EventStream, NodeSnapshot, TableSet};
use abusemesh_net::Connection;
use abusemesh_net_api::GetNodeRequest;
use abusemesh_session::{ClientSession, ClientSessionStorage, ServerSessionStorage, SessionConfig};
use abusemesh_util_error::AsFmtCompact as _;
use clap::Parser;
use config::TransportMode;
use dispatch::{NodeContext, PendingOffers};
use error::NodeResult;
use snafu::ResultExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport::NodeStream;

const LOG_TARGET: &str = "abusemesh::node";

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}

#[snafu::report]
#[tokio::main]
async fn main() -> NodeResult<()> {
    init_logging();
    let opts = cli::Opts::parse();

    match opts.cmd {
        cli::OptsCmd::GenKey { out } => gen_key(out).await,
        cli::OptsCmd::Serve { config } => serve(config, opts.global).await,
    }
}

async fn gen_key(out: std::path::PathBuf) -> NodeResult<()> {
    let signer = Ed25519Signer::generate(&mut rand::rngs::OsRng);
    tokio::fs::write(&out, signer.to_bytes()).await?;
    info!(target: LOG_TARGET, path = %out.display(), "wrote new signing key");
    Ok(())
}

async fn serve(config_path: std::path::PathBuf, global: cli::GlobalOpts) -> NodeResult<()> {
    transport::install_default_crypto_provider();
    let node_config = config::NodeConfig::load(&config_path).await?;

    let tls_acceptor = match node_config.transport {
        TransportMode::Tls => {
            // `validate()` already required both paths to be set.
            let cert_path = node_config.tls_cert_path.clone().expect("validated");
            let key_path = node_config.tls_key_path.clone().expect("validated");
            Some(transport::acceptor(&cert_path, &key_path)?)
        }
        TransportMode::Insecure => None,
    };

    let key_bytes = tokio::fs::read(&node_config.signing_key_path)
        .await
        .context(error::SigningKeySnafu {
            path: node_config.signing_key_path.clone(),
        })?;
    let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| {
        error::SigningKeyLengthSnafu {
            path: node_config.signing_key_path.clone(),
        }
        .build()
    })?;
    let signer = Ed25519Signer::from_bytes(&key_bytes);

    let db_path = global.data_dir().join("abusemesh.redb");
    let db = Arc::new(Database::open(db_path).await?);

    let event_stream = EventStream::new(db.clone(), node_config.event_channel_capacity, Ed25519Verifier);
    let (table_set, table_set_handle) = TableSet::new(db, node_config.table_channel_capacity);

    let cancel = CancellationToken::new();

    let table_set_task = tokio::spawn(table_set.run(cancel.clone()));
    event_stream.attach(table_set_handle.as_observer()).await;

    let own_node = {
        let mut node = abusemesh_core::Node::builder()
            .id(node_config.node_id)
            .protocol_version("1".to_string())
            .listen_addr_family(abusemesh_core::node::AddrFamily::IPv4)
            .listen_addr(node_config.listen_addr.clone())
            .contact_details(node_config.contact_details.clone())
            .asn(node_config.asn)
            .pgp_entity(signer.pgp_entity())
            .build();
        node.signature = signer.sign(&node.canonical_bytes());
        node
    };
    event_stream
        .write_channel()
        .send(
            Event::builder()
                .kind(UpdateKind::New)
                .payload(EventPayload::Node(own_node))
                .build(),
        )
        .await
        .expect("event stream worker just started");

    spawn_node_snapshot_refresher(event_stream.clone(), table_set_handle.clone(), cancel.clone());

    let client_session_storage = Arc::new(ClientSessionStorage::new());
    let server_session_storage = Arc::new(ServerSessionStorage::<NodeStream>::new());

    for peer in &node_config.peers {
        spawn_peer_bootstrap_and_session(
            node_config.node_id,
            peer.clone(),
            node_config.transport,
            event_stream.clone(),
            table_set_handle.clone(),
            server_session_storage.clone(),
            cancel.clone(),
        );
    }

    spawn_session_sweeper(client_session_storage.clone(), cancel.clone());

    let ctx = Arc::new(NodeContext {
        self_id: node_config.node_id,
        event_stream: event_stream.clone(),
        table_set: table_set_handle,
        client_session_storage: client_session_storage.clone(),
        server_session_storage: server_session_storage.clone(),
        pending_offers: PendingOffers::default(),
    });

    let listen_addr = node_config.listen_socket_addr()?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!(target: LOG_TARGET, %listen_addr, "listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target: LOG_TARGET, "shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, remote_addr) = accepted?;
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let stream: NodeStream = match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => Box::new(tls),
                            Err(err) => {
                                warn!(target: LOG_TARGET, %remote_addr, %err, "tls handshake failed");
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };
                    if let Err(err) = dispatch::handle_connection(ctx, stream, cancel).await {
                        warn!(target: LOG_TARGET, %remote_addr, err = %err.fmt_compact(), "connection handler failed");
                    }
                });
            }
        }
    }

    cancel.cancel();
    table_set_task.await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_node_snapshot_refresher(
    event_stream: Arc<EventStream>,
    table_set: abusemesh_db::TableSetHandle,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let snapshot = table_set.get_node_snapshot().await;
            event_stream.refresh_node_snapshot(NodeSnapshot::new(snapshot)).await;
            let report_ids = table_set.get_report_id_snapshot().await;
            event_stream
                .refresh_report_snapshot(abusemesh_db::ReportSnapshot::new(report_ids))
                .await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
    });
}

fn spawn_session_sweeper(storage: Arc<ClientSessionStorage>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            abusemesh_session::sweep_interrupted_sessions(
                &storage,
                abusemesh_session::DEFAULT_INTERRUPTED_TIMEOUT,
            )
            .await;
        }
    });
}

/// Fetches `peer`'s self-signed [`abusemesh_core::Node`] record over a
/// one-off connection and feeds it into the local event stream, retrying
/// with a flat backoff until it succeeds or `cancel` fires. This is what
/// lets [`ClientSession::peer_node`] resolve the peer's address from the
/// table afterward, without AbuseMesh having to trust an unsigned address
/// book entry: `Node` events are self-certifying.
fn spawn_peer_bootstrap_and_session(
    self_id: abusemesh_core::NodeId,
    peer: config::PeerConfig,
    transport_mode: TransportMode,
    event_stream: Arc<EventStream>,
    table_set: abusemesh_db::TableSetHandle,
    server_session_storage: Arc<ServerSessionStorage<NodeStream>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            match bootstrap_peer_node(&peer, &event_stream).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(target: LOG_TARGET, peer = %peer.node_id, err = %err.fmt_compact(), "peer bootstrap failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                    }
                }
            }
        }

        let session = ClientSession::new(
            self_id,
            peer.node_id,
            transport::dialer(transport_mode),
            table_set,
            event_stream,
            SessionConfig::default(),
        );
        if server_session_storage.add(peer.node_id, session.clone()).await.is_ok() {
            session.run(cancel).await;
        }
    });
}

async fn bootstrap_peer_node(peer: &config::PeerConfig, event_stream: &Arc<EventStream>) -> NodeResult<()> {
    let stream = TcpStream::connect(&peer.addr).await?;
    let conn = Connection::new(stream);
    let resp = conn.rpc(&GetNodeRequest).await?;

    if resp.node.id != peer.node_id {
        warn!(
            target: LOG_TARGET,
            expected = %peer.node_id,
            got = %resp.node.id,
            "peer returned a node record for a different id, ignoring"
        );
        return Ok(());
    }

    let _ = event_stream
        .write_channel()
        .send(
            Event::builder()
                .kind(UpdateKind::New)
                .payload(EventPayload::Node(resp.node))
                .build(),
        )
        .await;
    Ok(())
}
