//! Wire messages for the mesh. Every frame is a JSON record with a `type`
//! discriminant per the on-the-wire schema; unknown types are tolerated at
//! the deserialization boundary rather than treated as a hard error so a
//! newer peer's extra tags don't take a link down.

use serde::{Deserialize, Serialize};

/// One entry in a gossiped peer list or a handshake's `knownPeers`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

/// One `{anonymousVoteId, key}` pair released during a batch key reveal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyEntry {
    pub anonymous_vote_id: String,
    /// Hex-encoded 32-byte symmetric key.
    pub key: String,
}

/// One row of a tally, `{choice, count}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyEntry {
    pub choice: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Handshake {
        from: String,
        port: u16,
        #[serde(default)]
        known_peers: Vec<PeerInfo>,
        startup_time: i64,
        #[serde(default)]
        is_gui: bool,
    },
    HandshakeAck {
        from: String,
        port: u16,
        #[serde(default)]
        known_peers: Vec<PeerInfo>,
        startup_time: i64,
    },
    Heartbeat {
        from: String,
    },
    PeerExchangeRequest {
        from: String,
        #[serde(default)]
        is_validation: bool,
    },
    PeerExchangeResponse {
        peers: Vec<PeerInfo>,
    },
    DuplicateNodeRejection {
        reason: String,
        existing_node_id: String,
    },
    RoundStart {
        round_id: String,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: u64,
        start_time: i64,
        from: String,
    },
    /// Intentionally carries no `from` field: the whole point of the
    /// anonymity scheme is that a ciphertext cannot be traced to its
    /// originator.
    EncryptedVote {
        round_id: String,
        anonymous_vote_id: String,
        encrypted_data: String,
        iv: String,
        timestamp: i64,
        signature: String,
    },
    BatchVoteKeys {
        round_id: String,
        keys: Vec<KeyEntry>,
        from: String,
    },
    /// Accepted defensively on ingress; normal operation only ever sends
    /// `BatchVoteKeys`.
    VoteKey {
        round_id: String,
        anonymous_vote_id: String,
        key: String,
        from: String,
    },
    ResultProposal {
        round_id: String,
        results: Vec<TallyEntry>,
        vote_count: u64,
        from: String,
    },
    StatusUpdate {
        node_id: String,
        peers: usize,
        peers_list: Vec<String>,
        round_topic: Option<String>,
        phase: Option<String>,
        time_remaining: Option<i64>,
        encrypted_votes: usize,
        decrypted_votes: usize,
    },
    PhaseChange {
        round_id: String,
        phase: String,
    },
    VoteReceived {
        round_id: String,
        encrypted_vote_count: usize,
    },
    Results {
        round_id: String,
        results: Vec<TallyEntry>,
        vote_count: u64,
        participating_nodes: usize,
        active_nodes: usize,
    },
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    CommandResponse {
        response: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_vote_round_trips_and_omits_from() {
        let msg = Message::EncryptedVote {
            round_id: "round_1_alice".into(),
            anonymous_vote_id: "abcd1234".into(),
            encrypted_data: "deadbeef".into(),
            iv: "00".repeat(16),
            timestamp: 42,
            signature: "ff".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"from\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::EncryptedVote { anonymous_vote_id, .. } => {
                assert_eq!(anonymous_vote_id, "abcd1234");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected_not_panicking() {
        let raw = r#"{"type":"SOMETHING_NEW","foo":"bar"}"#;
        let result: std::result::Result<Message, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }
}
