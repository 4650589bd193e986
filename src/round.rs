//! The three-phase voting round state machine: VOTING -> CONSENSUS -> FINISHED.
//!
//! This module is deliberately free of any async/tokio dependency. It owns
//! round state and answers "what changed / what should be sent" questions;
//! the node actor (`crate::node`) is the single executor that calls these
//! methods and turns the answers into timers and broadcasts.

use std::collections::{HashMap, HashSet};

use crate::codec::{KeyEntry, Message, TallyEntry};
use crate::config::clamp_voting_seconds;
use crate::crypto::{self, BallotPlaintext};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Voting,
    Consensus,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Voting => "VOTING",
            Phase::Consensus => "CONSENSUS",
            Phase::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone)]
pub enum AllowedChoices {
    Any,
    Finite(HashSet<String>),
}

impl AllowedChoices {
    pub fn from_wire(choices: Option<Vec<String>>) -> Self {
        match choices {
            None => AllowedChoices::Any,
            Some(list) => {
                AllowedChoices::Finite(list.into_iter().map(|c| c.to_ascii_lowercase()).collect())
            }
        }
    }

    pub fn allows(&self, choice: &str) -> bool {
        match self {
            AllowedChoices::Any => true,
            AllowedChoices::Finite(set) => set.contains(&choice.to_ascii_lowercase()),
        }
    }

    pub fn to_wire(&self) -> Option<Vec<String>> {
        match self {
            AllowedChoices::Any => None,
            AllowedChoices::Finite(set) => Some(set.iter().cloned().collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedBallotRecord {
    pub iv: [u8; crypto::IV_LEN],
    pub ciphertext: Vec<u8>,
    pub signature: String,
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: [u8; crypto::KEY_LEN],
    pub key_provider: String,
}

#[derive(Debug, Clone)]
pub struct DecryptedBallot {
    pub choice: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct MyBallotTracking {
    pub anonymous_vote_id: String,
    pub choice: String,
    pub verified: bool,
}

#[derive(Debug, Clone)]
pub struct Round {
    pub round_id: String,
    pub topic: String,
    pub allowed_choices: AllowedChoices,
    pub start_time: i64,
    pub voting_time_seconds: u64,
    pub phase: Phase,
    pub encrypted_ballots: HashMap<String, EncryptedBallotRecord>,
    pub keys: HashMap<String, KeyRecord>,
    pub decrypted: HashMap<String, DecryptedBallot>,
    pub has_voted: bool,
    pub my_ballot_tracking: Option<MyBallotTracking>,
    pub consensus_nodes: HashSet<String>,
    pub result_proposed: bool,
    pub keys_sharing_complete: bool,
    pub consensus_achieved: bool,
    pub my_node_id: String,
}

impl Round {
    /// Wall-clock ms at which the CONSENSUS transition is due (80% of duration).
    pub fn consensus_due_at(&self) -> i64 {
        self.start_time + (self.voting_time_seconds as i64 * 800)
    }

    /// Wall-clock ms at which the hard FINISH deadline is due.
    pub fn finish_due_at(&self) -> i64 {
        self.start_time + (self.voting_time_seconds as i64 * 1000)
    }

    pub fn ordered_tally(&self) -> Vec<TallyEntry> {
        tally(&self.decrypted)
    }

    fn keys_we_produced(&self) -> Vec<(String, [u8; crypto::KEY_LEN])> {
        self.keys
            .iter()
            .filter(|(_, rec)| rec.key_provider == self.my_node_id)
            .map(|(id, rec)| (id.clone(), rec.key))
            .collect()
    }
}

/// Deterministic tally: lowercase, count, sort by count desc then choice asc.
pub fn tally(decrypted: &HashMap<String, DecryptedBallot>) -> Vec<TallyEntry> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for ballot in decrypted.values() {
        *counts.entry(ballot.choice.to_ascii_lowercase()).or_insert(0) += 1;
    }
    let mut rows: Vec<TallyEntry> = counts
        .into_iter()
        .map(|(choice, count)| TallyEntry { choice, count })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.choice.cmp(&b.choice)));
    rows
}

pub fn tallies_equal(a: &[TallyEntry], b: &[TallyEntry]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.choice == y.choice && x.count == y.count)
}

#[derive(Debug, Clone)]
pub struct FinishSummary {
    pub round_id: String,
    pub results: Vec<TallyEntry>,
    pub vote_count: u64,
    pub participating_nodes: usize,
    pub active_nodes: usize,
    pub verified: Option<bool>,
}

/// Owns every round this process has ever seen or started, keyed by
/// `roundId`. At most one entry is non-FINISHED at any time.
pub struct RoundEngine {
    pub my_node_id: String,
    pub rounds: HashMap<String, Round>,
    pub active_round_id: Option<String>,
}

impl RoundEngine {
    pub fn new(my_node_id: String) -> Self {
        Self {
            my_node_id,
            rounds: HashMap::new(),
            active_round_id: None,
        }
    }

    pub fn active(&self) -> Option<&Round> {
        self.active_round_id.as_ref().and_then(|id| self.rounds.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut Round> {
        let id = self.active_round_id.clone()?;
        self.rounds.get_mut(&id)
    }

    pub fn get(&self, round_id: &str) -> Option<&Round> {
        self.rounds.get(round_id)
    }

    /// `startVotingRound`. Mints the round id, stores the round, and
    /// returns the `ROUND_START` frame to broadcast.
    pub fn start_local_round(
        &mut self,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: Option<u64>,
        now_ms: i64,
    ) -> Message {
        let voting_time_seconds = clamp_voting_seconds(voting_time_seconds);
        let round_id = format!("round_{now_ms}_{}", self.my_node_id);
        let round = Round {
            round_id: round_id.clone(),
            topic: topic.clone(),
            allowed_choices: AllowedChoices::from_wire(allowed_choices.clone()),
            start_time: now_ms,
            voting_time_seconds,
            phase: Phase::Voting,
            encrypted_ballots: HashMap::new(),
            keys: HashMap::new(),
            decrypted: HashMap::new(),
            has_voted: false,
            my_ballot_tracking: None,
            consensus_nodes: HashSet::new(),
            result_proposed: false,
            keys_sharing_complete: false,
            consensus_achieved: false,
            my_node_id: self.my_node_id.clone(),
        };
        self.rounds.insert(round_id.clone(), round);
        self.active_round_id = Some(round_id.clone());

        Message::RoundStart {
            round_id,
            topic,
            allowed_choices,
            voting_time_seconds,
            start_time: now_ms,
            from: self.my_node_id.clone(),
        }
    }

    /// Accept or ignore an incoming `ROUND_START`. Returns `true` if it
    /// became (or replaced) the active round.
    pub fn accept_remote_round_start(
        &mut self,
        round_id: String,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: u64,
        start_time: i64,
    ) -> bool {
        let should_accept = match self.active() {
            None => true,
            Some(current) => start_time > current.start_time,
        };
        if !should_accept {
            return false;
        }
        let round = Round {
            round_id: round_id.clone(),
            topic,
            allowed_choices: AllowedChoices::from_wire(allowed_choices),
            start_time,
            voting_time_seconds,
            phase: Phase::Voting,
            encrypted_ballots: HashMap::new(),
            keys: HashMap::new(),
            decrypted: HashMap::new(),
            has_voted: false,
            my_ballot_tracking: None,
            consensus_nodes: HashSet::new(),
            result_proposed: false,
            keys_sharing_complete: false,
            consensus_achieved: false,
            my_node_id: self.my_node_id.clone(),
        };
        self.rounds.insert(round_id.clone(), round);
        self.active_round_id = Some(round_id);
        true
    }

    /// `castVote`. On success returns the `ENCRYPTED_VOTE` frame to
    /// broadcast; on policy failure the round is left untouched.
    pub fn cast_vote(&mut self, choice: &str, now_ms: i64) -> Result<Message> {
        let round = self
            .active_mut()
            .ok_or_else(|| Error::Policy("no active round".into()))?;

        if round.phase != Phase::Voting {
            return Err(Error::Policy("round is not accepting votes".into()));
        }
        if round.has_voted {
            return Err(Error::Policy("already voted in this round".into()));
        }
        if !round.allowed_choices.allows(choice) {
            return Err(Error::Policy(format!("'{choice}' is not an allowed choice")));
        }

        let key = crypto::random_key();
        let iv = crypto::random_iv();
        let anonymous_vote_id = crypto::random_anonymous_vote_id();
        let plaintext = BallotPlaintext {
            choice: choice.to_string(),
            anonymous_vote_id: anonymous_vote_id.clone(),
            timestamp: now_ms,
            round_id: round.round_id.clone(),
        };
        let ciphertext = crypto::encrypt_ballot(&key, &iv, &plaintext)?;
        let signature = crypto::ballot_signature(&anonymous_vote_id, &ciphertext);

        round.has_voted = true;
        round.my_ballot_tracking = Some(MyBallotTracking {
            anonymous_vote_id: anonymous_vote_id.clone(),
            choice: choice.to_string(),
            verified: false,
        });
        round.keys.insert(
            anonymous_vote_id.clone(),
            KeyRecord {
                key,
                key_provider: self.my_node_id.clone(),
            },
        );
        round.encrypted_ballots.insert(
            anonymous_vote_id.clone(),
            EncryptedBallotRecord {
                iv,
                ciphertext: ciphertext.clone(),
                signature: signature.clone(),
                received_at: now_ms,
            },
        );

        Ok(Message::EncryptedVote {
            round_id: round.round_id.clone(),
            anonymous_vote_id,
            encrypted_data: hex::encode(ciphertext),
            iv: hex::encode(iv),
            timestamp: now_ms,
            signature,
        })
    }

    /// Merge an inbound ballot. Idempotent: a repeat id is a no-op.
    pub fn ingest_encrypted_vote(
        &mut self,
        round_id: &str,
        anonymous_vote_id: String,
        encrypted_data_hex: &str,
        iv_hex: &str,
        received_at: i64,
        signature: String,
    ) {
        let Some(round) = self.rounds.get_mut(round_id) else {
            return;
        };
        if round.phase != Phase::Voting {
            return;
        }
        if round.encrypted_ballots.contains_key(&anonymous_vote_id) {
            return;
        }
        let (Ok(ciphertext), Ok(iv_bytes)) = (hex::decode(encrypted_data_hex), hex::decode(iv_hex))
        else {
            return;
        };
        let Ok(iv) = <[u8; crypto::IV_LEN]>::try_from(iv_bytes) else {
            return;
        };
        round.encrypted_ballots.insert(
            anonymous_vote_id,
            EncryptedBallotRecord {
                iv,
                ciphertext,
                signature,
                received_at,
            },
        );
    }

    /// Transition VOTING -> CONSENSUS. Returns the keys we produced,
    /// in the order they should be broadcast (shuffled by the caller, since
    /// shuffling needs an RNG the node actor already holds for the release
    /// delay roll).
    pub fn enter_consensus(&mut self, round_id: &str) -> Option<Vec<(String, [u8; crypto::KEY_LEN])>> {
        let round = self.rounds.get_mut(round_id)?;
        if round.phase != Phase::Voting {
            return None;
        }
        round.phase = Phase::Consensus;
        round.result_proposed = false;
        round.keys_sharing_complete = false;
        Some(round.keys_we_produced())
    }

    /// Merge a batch of released keys and run decryption over any ballot
    /// newly unlocked. Returns the number of keys that were new.
    pub fn ingest_keys(&mut self, round_id: &str, entries: &[KeyEntry], provider: &str) -> usize {
        let Some(round) = self.rounds.get_mut(round_id) else {
            return 0;
        };
        let mut new_count = 0;
        for entry in entries {
            if round.keys.contains_key(&entry.anonymous_vote_id) {
                continue;
            }
            let Ok(raw) = hex::decode(&entry.key) else {
                continue;
            };
            let Ok(key) = <[u8; crypto::KEY_LEN]>::try_from(raw) else {
                continue;
            };
            round.keys.insert(
                entry.anonymous_vote_id.clone(),
                KeyRecord {
                    key,
                    key_provider: provider.to_string(),
                },
            );
            new_count += 1;
        }
        if new_count > 0 {
            decrypt_pending(round);
        }
        new_count
    }

    /// `|keys| >= |ciphertexts|` and every active node has released a batch.
    pub fn is_ready_for_proposal(&self, round_id: &str, active_node_count: usize) -> bool {
        let Some(round) = self.rounds.get(round_id) else {
            return false;
        };
        if round.keys.len() < round.encrypted_ballots.len() {
            return false;
        }
        let providers: HashSet<&str> = round.keys.values().map(|k| k.key_provider.as_str()).collect();
        providers.len() >= active_node_count
    }

    pub fn mark_keys_sharing_complete(&mut self, round_id: &str) {
        if let Some(round) = self.rounds.get_mut(round_id) {
            round.keys_sharing_complete = true;
        }
    }

    /// Run a final decryption pass and, if not already proposed, build the
    /// `RESULT_PROPOSAL` frame. Adds ourselves to `consensusNodes`.
    pub fn propose_result(&mut self, round_id: &str) -> Option<Message> {
        let round = self.rounds.get_mut(round_id)?;
        decrypt_pending(round);
        if round.result_proposed {
            return None;
        }
        round.result_proposed = true;
        let results = round.ordered_tally();
        let vote_count = round.decrypted.len() as u64;
        round.consensus_nodes.insert(self.my_node_id.clone());
        Some(Message::ResultProposal {
            round_id: round.round_id.clone(),
            results,
            vote_count,
            from: self.my_node_id.clone(),
        })
    }

    /// Compare an incoming proposal to our own tally. Returns whether full
    /// consensus (every active node agreeing) was *just* reached.
    pub fn ingest_result_proposal(
        &mut self,
        round_id: &str,
        from: String,
        results: &[TallyEntry],
        active_node_count: usize,
    ) -> bool {
        let Some(round) = self.rounds.get_mut(round_id) else {
            return false;
        };
        let ours = round.ordered_tally();
        if !tallies_equal(&ours, results) {
            tracing::warn!(round_id, from = from.as_str(), "tally disagreement on RESULT_PROPOSAL");
            return false;
        }
        round.consensus_nodes.insert(from);
        round.consensus_nodes.insert(self.my_node_id.clone());
        if !round.consensus_achieved && round.consensus_nodes.len() >= active_node_count {
            round.consensus_achieved = true;
            return true;
        }
        false
    }

    /// Idempotent. Freezes the tally and runs self-verification.
    pub fn finish(&mut self, round_id: &str, active_node_count: usize) -> Option<FinishSummary> {
        let round = self.rounds.get_mut(round_id)?;
        let already_finished = round.phase == Phase::Finished;
        if !already_finished {
            decrypt_pending(round);
            round.phase = Phase::Finished;
        }

        let verified = round.my_ballot_tracking.as_ref().map(|tracking| {
            let verified = round
                .decrypted
                .get(&tracking.anonymous_vote_id)
                .map(|d| d.choice.eq_ignore_ascii_case(&tracking.choice))
                .unwrap_or(false);
            verified
        });
        if let (Some(v), Some(tracking)) = (verified, round.my_ballot_tracking.as_mut()) {
            tracking.verified = v;
        }

        if already_finished {
            return None;
        }

        Some(FinishSummary {
            round_id: round.round_id.clone(),
            results: round.ordered_tally(),
            vote_count: round.decrypted.len() as u64,
            participating_nodes: round.encrypted_ballots.len(),
            active_nodes: active_node_count,
            verified,
        })
    }
}

fn decrypt_pending(round: &mut Round) {
    let round_id = round.round_id.clone();
    for (id, ballot) in round.encrypted_ballots.iter() {
        if round.decrypted.contains_key(id) {
            continue;
        }
        let Some(key_record) = round.keys.get(id) else {
            continue;
        };
        match crypto::decrypt_ballot(&key_record.key, &ballot.iv, &ballot.ciphertext) {
            Ok(plaintext) => {
                if plaintext.round_id != round_id || plaintext.anonymous_vote_id != *id {
                    continue;
                }
                round.decrypted.insert(
                    id.clone(),
                    DecryptedBallot {
                        choice: plaintext.choice,
                        timestamp: plaintext.timestamp,
                    },
                );
            }
            Err(e) => {
                tracing::debug!(round_id = round_id.as_str(), vote_id = id.as_str(), error = %e, "dropping undecryptable ballot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(choice: &str, count: u64) -> TallyEntry {
        TallyEntry {
            choice: choice.to_string(),
            count,
        }
    }

    #[test]
    fn tally_sorts_by_count_desc_then_choice_asc() {
        let mut decrypted = HashMap::new();
        for (i, choice) in ["a", "a", "b", "b", "c"].iter().enumerate() {
            decrypted.insert(
                format!("id{i}"),
                DecryptedBallot {
                    choice: choice.to_string(),
                    timestamp: 0,
                },
            );
        }
        let rows = tally(&decrypted);
        assert_eq!(rows, vec![entry("a", 2), entry("b", 2), entry("c", 1)]);
    }

    #[test]
    fn tally_is_case_insensitive() {
        let mut decrypted = HashMap::new();
        decrypted.insert(
            "a".to_string(),
            DecryptedBallot {
                choice: "Yes".to_string(),
                timestamp: 0,
            },
        );
        decrypted.insert(
            "b".to_string(),
            DecryptedBallot {
                choice: "yes".to_string(),
                timestamp: 0,
            },
        );
        let rows = tally(&decrypted);
        assert_eq!(rows, vec![entry("yes", 2)]);
    }

    #[test]
    fn double_vote_is_rejected() {
        let mut engine = RoundEngine::new("alice".to_string());
        engine.start_local_round("Deploy?".to_string(), Some(vec!["yes".into(), "no".into()]), Some(60), 1000);
        assert!(engine.cast_vote("yes", 1001).is_ok());
        let err = engine.cast_vote("no", 1002).unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
        assert_eq!(engine.active().unwrap().encrypted_ballots.len(), 1);
    }

    #[test]
    fn disallowed_choice_is_rejected_and_state_untouched() {
        let mut engine = RoundEngine::new("alice".to_string());
        engine.start_local_round("Deploy?".to_string(), Some(vec!["yes".into(), "no".into()]), Some(60), 1000);
        let err = engine.cast_vote("maybe", 1001).unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
        assert!(!engine.active().unwrap().has_voted);
    }

    #[test]
    fn remote_round_only_replaces_when_strictly_newer() {
        let mut engine = RoundEngine::new("bob".to_string());
        assert!(engine.accept_remote_round_start(
            "round_1000_alice".into(),
            "Q".into(),
            None,
            60,
            1000
        ));
        assert!(!engine.accept_remote_round_start(
            "round_900_carol".into(),
            "R".into(),
            None,
            60,
            900
        ));
        assert_eq!(engine.active().unwrap().round_id, "round_1000_alice");
        assert!(engine.accept_remote_round_start(
            "round_2000_carol".into(),
            "S".into(),
            None,
            60,
            2000
        ));
        assert_eq!(engine.active().unwrap().round_id, "round_2000_carol");
    }

    #[test]
    fn full_round_trip_reaches_matching_tally_and_verifies_self() {
        let mut engine = RoundEngine::new("alice".to_string());
        engine.start_local_round("Deploy?".to_string(), Some(vec!["yes".into(), "no".into()]), Some(60), 1000);
        let round_id = engine.active().unwrap().round_id.clone();
        engine.cast_vote("yes", 1001).unwrap();

        let keys = engine.enter_consensus(&round_id).unwrap();
        assert_eq!(keys.len(), 1);
        let entries: Vec<KeyEntry> = keys
            .into_iter()
            .map(|(id, key)| KeyEntry {
                anonymous_vote_id: id,
                key: hex::encode(key),
            })
            .collect();
        engine.ingest_keys(&round_id, &entries, "alice");

        assert!(engine.is_ready_for_proposal(&round_id, 1));
        let proposal = engine.propose_result(&round_id).unwrap();
        match proposal {
            Message::ResultProposal { results, .. } => {
                assert_eq!(results, vec![entry("yes", 1)]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let summary = engine.finish(&round_id, 1).unwrap();
        assert_eq!(summary.results, vec![entry("yes", 1)]);
        assert_eq!(summary.verified, Some(true));

        assert!(engine.finish(&round_id, 1).is_none());
    }

    #[test]
    fn lost_key_batch_leaves_ballot_undecrypted_without_crashing() {
        let mut engine = RoundEngine::new("alice".to_string());
        engine.start_local_round("Deploy?".to_string(), None, Some(60), 1000);
        let round_id = engine.active().unwrap().round_id.clone();
        engine.cast_vote("yes", 1001).unwrap();
        engine.ingest_encrypted_vote(
            &round_id,
            "remote-ballot".into(),
            &hex::encode(vec![1, 2, 3, 4]),
            &hex::encode([0u8; 16]),
            1002,
            "sig".into(),
        );
        engine.enter_consensus(&round_id);
        assert!(!engine.is_ready_for_proposal(&round_id, 2));
        let summary = engine.finish(&round_id, 2).unwrap();
        assert_eq!(summary.participating_nodes, 2);
        assert_eq!(summary.vote_count, 1);
    }
}
