//! GUI fan-out: observers are just another peer link class (see the design
//! notes), so this module only holds the notification-shape helpers,
//! status snapshots and the `COMMAND` -> CLI command translation. Link
//! storage and delivery live in [`crate::mesh::MeshManager`].

use std::time::Duration;

use crate::cli::{self, Command};
use crate::codec::{Message, TallyEntry};
use crate::error::Result;
use crate::round::Phase;

pub const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Mirrored to every observer whenever the mesh broadcasts one of these.
pub fn is_mirrored(msg: &Message) -> bool {
    matches!(
        msg,
        Message::RoundStart { .. }
            | Message::ResultProposal { .. }
            | Message::EncryptedVote { .. }
            | Message::PhaseChange { .. }
            | Message::VoteReceived { .. }
            | Message::Results { .. }
    )
}

pub struct StatusInputs<'a> {
    pub node_id: &'a str,
    pub peers: usize,
    pub peers_list: Vec<String>,
    pub round_topic: Option<String>,
    pub phase: Option<Phase>,
    pub time_remaining_ms: Option<i64>,
    pub encrypted_votes: usize,
    pub decrypted_votes: usize,
}

pub fn build_status_update(inputs: StatusInputs<'_>) -> Message {
    Message::StatusUpdate {
        node_id: inputs.node_id.to_string(),
        peers: inputs.peers,
        peers_list: inputs.peers_list,
        round_topic: inputs.round_topic,
        phase: inputs.phase.map(|p| p.as_str().to_string()),
        time_remaining: inputs.time_remaining_ms,
        encrypted_votes: inputs.encrypted_votes,
        decrypted_votes: inputs.decrypted_votes,
    }
}

pub fn build_results_message(
    round_id: String,
    results: Vec<TallyEntry>,
    vote_count: u64,
    participating_nodes: usize,
    active_nodes: usize,
) -> Message {
    Message::Results {
        round_id,
        results,
        vote_count,
        participating_nodes,
        active_nodes,
    }
}

/// Translates an observer's `COMMAND{command, args}` into the same
/// `Command` the CLI loop parses, so both surfaces share one dispatcher.
pub fn translate_command(command: &str, args: &[String]) -> Result<Command> {
    cli::parse(command, args)
}
