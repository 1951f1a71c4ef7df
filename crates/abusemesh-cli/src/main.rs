//! `abusemesh-cli`: the admin query client. Dials a running
//! `abusemesh-node`'s plain RPC listener and issues one of the three admin
//! calls, printing the JSON-encoded response to stdout.

mod cli;

use std::io;

use abusemesh_net::Connection;
use abusemesh_net_api::admin;
use clap::Parser;
use cli::Opts;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(display("failed to connect to {addr}: {source}"))]
    Connect {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[snafu(transparent)]
    Rpc { source: abusemesh_net::RpcError },
    #[snafu(display("failed to serialize response: {source}"))]
    Serialize { source: serde_json::Error },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging();

    let opts = Opts::parse();
    let stream = TcpStream::connect(opts.addr)
        .await
        .context(ConnectSnafu { addr: opts.addr })?;
    let conn = Connection::new(stream);

    let value = match opts.cmd {
        cli::OptsCmd::GetNode { node } => {
            let resp = conn.rpc(&admin::GetNodeRequest { node }).await?;
            serde_json::to_value(resp.node).context(SerializeSnafu)?
        }
        cli::OptsCmd::GetClients => {
            let resp = conn.rpc(&admin::GetClientsRequest).await?;
            serde_json::to_value(resp.clients).context(SerializeSnafu)?
        }
        cli::OptsCmd::GetServers => {
            let resp = conn.rpc(&admin::GetServersRequest).await?;
            serde_json::to_value(resp.servers).context(SerializeSnafu)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&value).context(SerializeSnafu)?);
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .try_init();
}
