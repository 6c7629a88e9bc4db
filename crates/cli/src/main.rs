//! Signer node binary.
//!
//! Runs the signing service and carries the operator tooling around it:
//! node identity generation, topology encryption and the key ceremony.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{init_tracing, AppConfig};
use tracing::error;

/// Threshold ECDSA signer for cross-chain intents.
#[derive(Parser, Debug)]
#[command(name = "signer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SIGNER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Node name selecting a `[nodes.<name>]` override block.
    #[arg(long, env = "SIGNER_NAME", global = true)]
    name: Option<String>,

    /// Fetch the configuration document from this URL instead of a file.
    #[arg(long, env = "SIGNER_CONFIG_URL", global = true, conflicts_with = "config")]
    config_url: Option<String>,

    /// Use the staging chain set.
    #[arg(long, global = true)]
    staging: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node: peer bus, chain listeners, intent handlers and HTTP API.
    Run,

    /// Node identity management.
    Peer {
        #[command(subcommand)]
        command: PeerCommand,
    },

    /// Topology publishing helpers.
    Topology {
        #[command(subcommand)]
        command: TopologyCommand,
    },

    /// Run the distributed key generation ceremony with every peer.
    Keygen {
        /// Refresh the existing keyshare instead of generating a new key.
        #[arg(long)]
        refresh: bool,

        /// Session id shared by all participants.
        #[arg(long)]
        session_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PeerCommand {
    /// Generate an ed25519 node key and print its peer id.
    GenKey {
        /// Output file (defaults to `node.key_path`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Overwrite an existing key file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TopologyCommand {
    /// Encrypt a cleartext topology document for publishing.
    Encrypt {
        /// Cleartext topology JSON.
        #[arg(short, long)]
        path: PathBuf,

        /// Output file (defaults to `<path>.enc`).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Fetch, verify and decrypt the configured topology.
    Test,
}

async fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config_url {
        Some(url) => {
            let body = reqwest::get(url)
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("Failed to fetch config from {}", url))?
                .text()
                .await?;
            AppConfig::from_toml(&body, cli.name.as_deref(), cli.staging)?
        }
        None => AppConfig::load(cli.config.as_deref(), cli.name.as_deref(), cli.staging)?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli).await?;
    init_tracing(&config.logging);

    let result = match cli.command {
        Commands::Run => commands::run(config).await,
        Commands::Peer {
            command: PeerCommand::GenKey { out, force },
        } => commands::gen_key(&config, out, force),
        Commands::Topology {
            command: TopologyCommand::Encrypt { path, out },
        } => commands::encrypt_topology(&config, &path, out).await,
        Commands::Topology {
            command: TopologyCommand::Test,
        } => commands::test_topology(&config).await,
        Commands::Keygen {
            refresh,
            session_id,
        } => commands::keygen(config, refresh, session_id).await,
    };

    if let Err(ref e) = result {
        error!("{:#}", e);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "signer", "keygen", "--refresh", "--name", "node-2", "--staging",
        ])
        .unwrap();
        assert_eq!(cli.name.as_deref(), Some("node-2"));
        assert!(cli.staging);
        assert!(matches!(
            cli.command,
            Commands::Keygen {
                refresh: true,
                session_id: None
            }
        ));
    }

    #[test]
    fn test_topology_encrypt_requires_path() {
        assert!(Cli::try_parse_from(["signer", "topology", "encrypt"]).is_err());
        let cli =
            Cli::try_parse_from(["signer", "topology", "encrypt", "--path", "peers.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Topology {
                command: TopologyCommand::Encrypt { .. }
            }
        ));
    }

    #[test]
    fn test_config_sources_conflict() {
        assert!(Cli::try_parse_from([
            "signer",
            "run",
            "--config",
            "a.toml",
            "--config-url",
            "http://localhost/a.toml",
        ])
        .is_err());
    }
}
