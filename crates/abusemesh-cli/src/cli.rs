//! Command-line surface for the admin query client: a thin wrapper issuing
//! the three admin RPCs (`GetNode`, `GetClients`, `GetServers`) against a
//! running node.

use std::net::SocketAddr;

use abusemesh_core::NodeId;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    /// Address of the target node's admin RPC listener.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub addr: SocketAddr,

    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Looks up a single node by id.
    GetNode { node: NodeId },
    /// Lists the sessions the target node is serving (its connected
    /// clients).
    GetClients,
    /// Lists the sessions the target node is consuming from (its
    /// upstream servers).
    GetServers,
}
