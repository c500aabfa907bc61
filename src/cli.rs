// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "embernode", version, about = "Ember blockchain node")]
pub struct Cli {
    /// Path to the YAML config file. Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long, value_name = "IP")]
    pub host: Option<IpAddr>,

    /// Override the configured bind port. 0 asks the OS for a free port.
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Run as a discovery node (read-only peer index).
    #[arg(long)]
    pub discovery: bool,

    /// Additional bootstrap endpoint (host:port). Repeatable.
    #[arg(long = "bootstrap", value_name = "ADDR")]
    pub bootstrap: Vec<SocketAddr>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
