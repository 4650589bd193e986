//! Node identity and startup configuration.
//!
//! Everything here is derived from CLI arguments alone. `NODE_NAME`,
//! `NODE_PORT`, `PEERS` and `BROADCAST_ADDRESS` exist for the container
//! entrypoint that wraps this binary; the core never reads the process
//! environment.

use std::net::SocketAddr;

use clap::Parser;

use crate::error::{Error, Result};

pub const DISCOVERY_PORT: u16 = 41234;
pub const DEFAULT_BROADCAST_ADDR: &str = "255.255.255.255";
pub const MIN_VOTING_SECONDS: u64 = 30;
pub const MAX_VOTING_SECONDS: u64 = 600;
pub const DEFAULT_VOTING_SECONDS: u64 = 100;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "quorumvote",
    about = "Peer-to-peer anonymous voting mesh node",
    version
)]
pub struct Args {
    /// Short operator-chosen identity, 2-20 chars of [A-Za-z0-9_-]
    pub node_id: String,

    /// TCP port this node listens on
    pub port: u16,

    /// Seed peers as host:port, tried at startup and whenever rediscovered
    pub seeds: Vec<String>,

    /// Disable the observer/GUI fan-out plane entirely
    #[arg(long)]
    pub no_gui: bool,

    /// Only accept GUI observer connections, skip joining the voting mesh
    #[arg(long)]
    pub gui_only: bool,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub port: u16,
    pub seeds: Vec<SocketAddr>,
    pub no_gui: bool,
    pub gui_only: bool,
}

impl NodeConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        validate_node_id(&args.node_id)?;
        let mut seeds = Vec::with_capacity(args.seeds.len());
        for seed in &args.seeds {
            seeds.push(resolve_host_port(seed)?);
        }
        Ok(Self {
            node_id: args.node_id,
            port: args.port,
            seeds,
            no_gui: args.no_gui,
            gui_only: args.gui_only,
        })
    }
}

pub fn validate_node_id(node_id: &str) -> Result<()> {
    let len_ok = (2..=20).contains(&node_id.len());
    let chars_ok = node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "node id '{node_id}' must be 2-20 chars of [A-Za-z0-9_-]"
        )))
    }
}

/// `host:port` → a resolved socket address. Loopback hostnames resolve via
/// the standard library resolver; this is a startup-time operation and
/// blocking DNS here is acceptable (it runs before the event loop starts).
pub fn resolve_host_port(spec: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    spec.to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid peer address '{spec}': {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("could not resolve '{spec}'")))
}

/// Clamp an untrusted voting duration to the allowed range, defaulting
/// invalid input rather than rejecting it outright (matches the boundary
/// table: 29 -> 100, 30 -> 30, 600 -> 600, 601 -> 100).
pub fn clamp_voting_seconds(requested: Option<u64>) -> u64 {
    match requested {
        Some(seconds) if (MIN_VOTING_SECONDS..=MAX_VOTING_SECONDS).contains(&seconds) => seconds,
        _ => DEFAULT_VOTING_SECONDS,
    }
}

/// Loopback addresses are normalized to `localhost` in the address book so
/// that self-connects via different loopback spellings are recognized as
/// the same peer.
pub fn normalize_host(host: &str) -> String {
    match host {
        "127.0.0.1" | "::1" | "0.0.0.0" => "localhost".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_length_and_charset_enforced() {
        assert!(validate_node_id("alice").is_ok());
        assert!(validate_node_id("a").is_err());
        assert!(validate_node_id(&"a".repeat(21)).is_err());
        assert!(validate_node_id("alice!").is_err());
        assert!(validate_node_id("alice-2_bob").is_ok());
    }

    #[test]
    fn voting_seconds_clamp_to_default_table() {
        assert_eq!(clamp_voting_seconds(Some(29)), DEFAULT_VOTING_SECONDS);
        assert_eq!(clamp_voting_seconds(Some(30)), 30);
        assert_eq!(clamp_voting_seconds(Some(600)), 600);
        assert_eq!(clamp_voting_seconds(Some(601)), DEFAULT_VOTING_SECONDS);
        assert_eq!(clamp_voting_seconds(None), DEFAULT_VOTING_SECONDS);
    }

    #[test]
    fn loopback_hosts_normalize_to_localhost() {
        assert_eq!(normalize_host("127.0.0.1"), "localhost");
        assert_eq!(normalize_host("192.168.1.5"), "192.168.1.5");
    }
}
