//! LAN presence beacon: a UDP broadcast of `{nodeId, port}` every 5 seconds,
//! and ingestion of peers' beacons into connect candidates.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::DISCOVERY_PORT;
use crate::error::Result;

pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub node_id: String,
    pub port: u16,
}

#[derive(Debug)]
pub struct DiscoveredBeacon {
    pub beacon: Beacon,
    pub from: SocketAddr,
}

/// Binds the discovery socket with broadcast enabled. Bound to
/// `0.0.0.0:DISCOVERY_PORT` so beacons from any local interface are heard.
pub async fn bind() -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Runs forever: every `BEACON_INTERVAL`, broadcasts our beacon, and
/// forwards every beacon we receive (including malformed ones, dropped
/// silently) to `tx`.
pub async fn run(
    socket: UdpSocket,
    my_node_id: String,
    my_port: u16,
    broadcast_address: String,
    tx: mpsc::UnboundedSender<DiscoveredBeacon>,
) {
    let beacon = Beacon {
        node_id: my_node_id,
        port: my_port,
    };
    let payload = match serde_json::to_vec(&beacon) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode discovery beacon, beaconing disabled");
            return;
        }
    };
    let target = format!("{broadcast_address}:{DISCOVERY_PORT}");

    let mut interval = tokio::time::interval(BEACON_INTERVAL);
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&payload, &target).await {
                    tracing::debug!(error = %e, "discovery beacon send failed");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, from)) => {
                        if let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..len]) {
                            if tx.send(DiscoveredBeacon { beacon, from }).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "discovery beacon recv failed");
                    }
                }
            }
        }
    }
}
