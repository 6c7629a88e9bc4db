//! Node identity commands.

use std::path::PathBuf;

use anyhow::{bail, Result};
use common::{AppConfig, NodeKey};

/// Generate a fresh node key and print the peer id operators publish in the
/// topology.
pub fn gen_key(config: &AppConfig, out: Option<PathBuf>, force: bool) -> Result<()> {
    let path = out.unwrap_or_else(|| config.node.key_path.clone());
    if path.exists() && !force {
        bail!(
            "Key file {} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let key = NodeKey::generate();
    key.save(&path)?;

    println!("Key written to {}", path.display());
    println!("Peer id: {}", key.peer_id());
    Ok(())
}
