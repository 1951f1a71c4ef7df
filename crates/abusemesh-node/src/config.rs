//! TOML node configuration, loaded and validated once at startup; a
//! malformed or invalid config is a fatal startup error.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use abusemesh_core::NodeId;
use abusemesh_core::node::ContactDetails;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse config file {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("insecure transport is only permitted in dev builds"))]
    InsecureTransportNotAllowed,
    #[snafu(display("transport = \"tls\" requires both tls_cert_path and tls_key_path"))]
    MissingTlsMaterial,
    #[snafu(display("listen_addr {listen_addr:?} does not parse as a socket address"))]
    InvalidListenAddr { listen_addr: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// The only non-dev-gated mode is `Tls`: every production connection is
/// wrapped in a `rustls` session (see `crate::transport`). `Insecure` is
/// plain TCP with no encryption at all, refused outside a dev build
/// (validated in [`NodeConfig::validate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Tls,
    Insecure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String,
}

fn default_channel_capacity() -> usize {
    1000
}

/// A node's local identity and operating parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub asn: i32,
    #[serde(default)]
    pub contact_details: ContactDetails,
    /// Path to a 32-byte raw Ed25519 secret key file.
    pub signing_key_path: PathBuf,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub transport: TransportMode,
    /// PEM certificate chain; required when `transport = "tls"`.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key matching `tls_cert_path`; required when `transport =
    /// "tls"`.
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_channel_capacity")]
    pub table_channel_capacity: usize,
}

impl NodeConfig {
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Self = toml::from_str(&raw).context(ParseSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        let dev_mode = cfg!(debug_assertions) || abusemesh_util::is_abusemesh_dev_mode_set();
        match self.transport {
            TransportMode::Insecure if !dev_mode => return InsecureTransportNotAllowedSnafu.fail(),
            TransportMode::Tls if self.tls_cert_path.is_none() || self.tls_key_path.is_none() => {
                return MissingTlsMaterialSnafu.fail();
            }
            _ => {}
        }
        self.listen_socket_addr()?;
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.listen_addr
            .parse()
            .ok()
            .context(InvalidListenAddrSnafu {
                listen_addr: self.listen_addr.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        tokio::fs::write(&path, b"this is not valid toml =====")
            .await
            .expect("write");

        let err = NodeConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn rejects_unparseable_listen_addr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let node_id = NodeId::new();
        tokio::fs::write(
            &path,
            format!(
                r#"
                node_id = "{node_id}"
                listen_addr = "not-a-socket-addr"
                asn = 65000
                signing_key_path = "key.bin"
                transport = "insecure"
                "#
            ),
        )
        .await
        .expect("write");

        let err = NodeConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListenAddr { .. }));
    }

    #[tokio::test]
    async fn rejects_tls_transport_without_cert_material() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let node_id = NodeId::new();
        tokio::fs::write(
            &path,
            format!(
                r#"
                node_id = "{node_id}"
                listen_addr = "127.0.0.1:9000"
                asn = 65000
                signing_key_path = "key.bin"
                "#
            ),
        )
        .await
        .expect("write");

        // `transport` defaults to `TransportMode::Tls`, so a config with no
        // tls_cert_path/tls_key_path must be rejected rather than silently
        // falling back to an unencrypted connection.
        let err = NodeConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsMaterial));
    }
}
