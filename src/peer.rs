//! One message-oriented channel to one remote. A peer link is framed with
//! a 4-byte length prefix (`tokio_util::codec::LengthDelimitedCodec`)
//! carrying one JSON-encoded [`Message`] per frame, split into an
//! independent reader and writer task so a slow remote can't stall the
//! node actor's event loop.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::codec::Message;

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    /// Participates in the voting mesh and counts toward the active node count.
    VotingNode,
    /// A GUI observer: receives notifications, issues `COMMAND`s, never
    /// counted toward consensus thresholds.
    Gui,
}

/// Handle the mesh manager keeps for one open link.
pub struct LinkHandle {
    pub link_id: LinkId,
    pub direction: Direction,
    pub class: PeerClass,
    pub node_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    writer_tx: mpsc::UnboundedSender<Message>,
}

impl LinkHandle {
    /// Best-effort send; a closed link simply drops the frame; the reader
    /// task's EOF/error will already have (or soon will) notify the node
    /// actor to evict it.
    pub fn send(&self, msg: Message) -> bool {
        self.writer_tx.send(msg).is_ok()
    }
}

/// Events a peer link's background tasks deliver back to the node actor.
#[derive(Debug)]
pub enum LinkEvent {
    Inbound { link_id: LinkId, message: Message },
    Closed { link_id: LinkId },
}

/// Split `stream` into reader/writer tasks and return the handle the mesh
/// manager stores. `class`/`node_id` start as provisional values and are
/// updated in place once handshake completes.
pub fn spawn(
    stream: TcpStream,
    link_id: LinkId,
    direction: Direction,
    class: PeerClass,
    host: Option<String>,
    port: Option<u16>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
) -> LinkHandle {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            let bytes = match serde_json::to_vec(&msg) {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!(link_id, error = %e, "failed to encode outgoing frame");
                    continue;
                }
            };
            if sink.send(Bytes::from(bytes)).await.is_err() {
                break;
            }
        }
    });

    let reader_events = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => match serde_json::from_slice::<Message>(&frame) {
                    Ok(message) => {
                        if reader_events
                            .send(LinkEvent::Inbound { link_id, message })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(link_id, error = %e, "dropping malformed or unknown frame");
                    }
                },
                Some(Err(e)) => {
                    tracing::debug!(link_id, error = %e, "link read error");
                    break;
                }
                None => break,
            }
        }
        let _ = reader_events.send(LinkEvent::Closed { link_id });
    });

    LinkHandle {
        link_id,
        direction,
        class,
        node_id: None,
        host,
        port,
        writer_tx,
    }
}
