//! Command-line surface for the `abusemesh-node` daemon: a config-file-driven
//! `serve` subcommand plus a `gen-key` helper.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "AbuseMesh", "abusemesh")
        .map(|p| p.data_dir().to_owned())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Parser)]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,
    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, clap::Args)]
pub struct GlobalOpts {
    /// Directory holding the node's database and signing key, when not
    /// overridden per-subcommand.
    #[arg(long, env = "ABUSEMESH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

impl GlobalOpts {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Generates a fresh Ed25519 signing key and writes it to `out`.
    GenKey {
        #[arg(long)]
        out: PathBuf,
    },
    /// Runs the daemon: loads `config`, opens the database under the data
    /// directory, and serves incoming connections until terminated.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
}
