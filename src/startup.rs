//! Startup duplicate-identity probe.
//!
//! Before opening the listener, dial every seed with a transient
//! validation connection and watch for any evidence that our chosen node
//! id is already in use on the mesh. A probe connection failure is not
//! evidence of anything and is ignored; only a positive identity hit is
//! fatal.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::codec::Message;
use crate::error::{Error, Result};

const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);
const PER_PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(my_node_id: &str, seeds: &[std::net::SocketAddr]) -> Result<()> {
    timeout(OVERALL_TIMEOUT, probe_all(my_node_id, seeds))
        .await
        .unwrap_or(Ok(()))
}

async fn probe_all(my_node_id: &str, seeds: &[std::net::SocketAddr]) -> Result<()> {
    for addr in seeds {
        match timeout(PER_PEER_TIMEOUT, probe_one(my_node_id, *addr)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!(%addr, "duplicate probe timed out, treating as connection failure");
            }
        }
    }
    Ok(())
}

async fn probe_one(my_node_id: &str, addr: std::net::SocketAddr) -> Result<()> {
    let stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "duplicate probe connection failed, not a duplicate signal");
            return Ok(());
        }
    };
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let validator_id = format!("validator_{}", chrono::Utc::now().timestamp_millis());
    let request = Message::PeerExchangeRequest {
        from: validator_id,
        is_validation: true,
    };
    let bytes = serde_json::to_vec(&request)?;
    if framed.send(Bytes::from(bytes)).await.is_err() {
        return Ok(());
    }

    while let Some(Ok(frame)) = framed.next().await {
        let Ok(message) = serde_json::from_slice::<Message>(&frame) else {
            continue;
        };
        match message {
            Message::PeerExchangeResponse { peers } => {
                if peers.iter().any(|p| p.node_id == my_node_id) {
                    return Err(Error::DuplicateIdentity(format!(
                        "node id '{my_node_id}' already present in peer list from {addr}"
                    )));
                }
                return Ok(());
            }
            Message::Handshake { from, .. } | Message::HandshakeAck { from, .. } => {
                if from == my_node_id {
                    return Err(Error::DuplicateIdentity(format!(
                        "peer at {addr} identified itself as '{my_node_id}'"
                    )));
                }
                return Ok(());
            }
            _ => continue,
        }
    }
    Ok(())
}
