//! The process entry point's single error channel: every fatal failure in
//! any worker, wherever it originates, is folded into a `NodeError` and
//! surfaces through `main`'s `Result`.

use snafu::Snafu;

use crate::config::ConfigError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NodeError {
    #[snafu(display("failed to load config: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("failed to read signing key from {path:?}: {source}"))]
    SigningKey {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("signing key at {path:?} is not 32 bytes"))]
    SigningKeyLength { path: std::path::PathBuf },

    #[snafu(display("database failed: {source}"))]
    Database { source: abusemesh_db::DbError },

    #[snafu(display("session failed: {source}"))]
    Session { source: abusemesh_session::SessionError },

    #[snafu(display("rpc failed: {source}"))]
    Rpc { source: abusemesh_net::RpcError },

    #[snafu(display("io error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("tls setup failed: {source}"))]
    Tls {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("a worker task panicked: {source}"))]
    Join { source: tokio::task::JoinError },
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

impl From<ConfigError> for NodeError {
    fn from(source: ConfigError) -> Self {
        Self::Config { source }
    }
}

impl From<abusemesh_db::DbError> for NodeError {
    fn from(source: abusemesh_db::DbError) -> Self {
        Self::Database { source }
    }
}

impl From<abusemesh_session::SessionError> for NodeError {
    fn from(source: abusemesh_session::SessionError) -> Self {
        Self::Session { source }
    }
}

impl From<abusemesh_net::RpcError> for NodeError {
    fn from(source: abusemesh_net::RpcError) -> Self {
        Self::Rpc { source }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(source: tokio::task::JoinError) -> Self {
        Self::Join { source }
    }
}
