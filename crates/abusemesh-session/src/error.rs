//! Errors raised while driving a session's state machine or serving a
//! replay. Transport-level failures are folded into a single `Transport`
//! variant: the state machines only need to know "did the call succeed",
//! not the transport's error taxonomy.

use abusemesh_core::SessionId;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("rpc to peer failed"))]
    Transport { source: abusemesh_net::RpcError },
    #[snafu(display("local event storage failed"))]
    Storage { source: abusemesh_db::DbError },
    #[snafu(display("peer {peer} is not a known node"))]
    UnknownPeer { peer: abusemesh_core::NodeId },
    #[snafu(display(
        "reconnect session id {given} does not match the session's current id {current}"
    ))]
    SessionIdMismatch {
        given: SessionId,
        current: SessionId,
    },
    #[snafu(display("a session for this peer already exists"))]
    Duplicate,
    #[snafu(display("no session exists for this peer"))]
    NotFound,
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

impl From<abusemesh_net::RpcError> for SessionError {
    fn from(source: abusemesh_net::RpcError) -> Self {
        Self::Transport { source }
    }
}

impl From<abusemesh_db::DbError> for SessionError {
    fn from(source: abusemesh_db::DbError) -> Self {
        Self::Storage { source }
    }
}
