//! Session state machines for replicating the event log between peers:
//! [`ServerSession`] on the serving side, per remote client;
//! [`ClientSession`] on the consuming side, per upstream peer.
//!
//! Each side runs one task per peer connection, cycling through an explicit
//! state table with additive backoff between reconnect attempts.

mod client_session;
mod error;
mod server_session;
mod storage;

pub use client_session::{
    ClientSession, ClientSessionState, ClientSessionStatus, PeerDialer, ServerSessionStorage,
    SessionConfig,
};
pub use error::{SessionError, SessionResult};
pub use server_session::{
    sweep_interrupted_sessions, ClientSessionStorage, ServerSession, ServerSessionState,
    DEFAULT_INTERRUPTED_TIMEOUT,
};
pub use storage::SessionStorage;
