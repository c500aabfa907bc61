// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use ember_chain::{MemState, MemStorage, RawCodec};
use ember_p2p::{Manager, NodeRole, NodeType, P2pConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host_ip = host;
    }
    if let Some(port) = cli.port {
        config.host_port = port;
    }
    if cli.discovery {
        config.node_type = NodeType::Discovery;
    }
    config.bootstrap_nodes.extend(cli.bootstrap.iter().copied());

    let role = match config.node_type {
        NodeType::Normal => NodeRole::Normal {
            chain: Arc::new(RawCodec::new()),
            storage: Arc::new(MemStorage::new()),
            state: Arc::new(MemState::new()),
        },
        NodeType::Discovery => NodeRole::Discovery,
    };

    let bootstrap = config.bootstrap_nodes.clone();
    let manager = Manager::new(config, role);
    manager.start_server().await.context("failed to start the p2p server")?;
    info!(
        node_id = %manager.node_id().to_hex(),
        addr = ?manager.local_addr(),
        "embernode up"
    );

    for addr in bootstrap {
        if let Err(e) = manager.connect_to(addr).await {
            warn!(%addr, "bootstrap dial failed: {e}");
        }
    }
    manager.start_discovery();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    manager.stop().await;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<P2pConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config file {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("could not parse config file {}", path.display()))
        }
        None => Ok(P2pConfig::default()),
    }
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.host_port, 8086);
        assert_eq!(config.node_type, NodeType::Normal);
    }

    #[test]
    fn load_config_reads_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host_port: 9099\nnode_type: discovery\nbootstrap_nodes:\n  - 127.0.0.1:9100"
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.host_port, 9099);
        assert_eq!(config.node_type, NodeType::Discovery);
        assert_eq!(config.bootstrap_nodes, vec!["127.0.0.1:9100".parse().unwrap()]);
    }

    #[test]
    fn load_config_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host_prot: 9099").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }
}
