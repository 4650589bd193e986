//! The node actor: a single task that owns the mesh and round state and
//! drives every timer and inbound event through one `tokio::select!` loop,
//! per the single-executor rule in the concurrency model. Nothing else in
//! this crate mutates `MeshManager` or `RoundEngine` directly.

use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::cli::Command;
use crate::codec::{KeyEntry, Message, PeerInfo};
use crate::config::NodeConfig;
use crate::discovery::{self, DiscoveredBeacon};
use crate::error::Result;
use crate::gui::{self, StatusInputs};
use crate::mesh::MeshManager;
use crate::peer::{self, Direction, LinkEvent, LinkId, PeerClass};
use crate::round::{Phase, RoundEngine};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const KEY_RELEASE_DELAY_MIN_MS: u64 = 500;
const KEY_RELEASE_DELAY_MAX_MS: u64 = 1500;
const READINESS_PROBE_INTERVAL: Duration = Duration::from_secs(3);
const SETTLE_DELAY: Duration = Duration::from_secs(3);
const GOSSIP_CONNECT_STAGGER: Duration = Duration::from_secs(2);
const MAX_GOSSIP_CONNECTS_PER_RESPONSE: usize = 3;

pub enum NodeEvent {
    Link(LinkEvent),
    InboundConnection(TcpStream, SocketAddr),
    OutboundConnected(TcpStream, String, u16),
    ConnectFailed(String, u16),
    Beacon(DiscoveredBeacon),
    Cli {
        command: Command,
        reply: oneshot::Sender<String>,
    },
    HeartbeatTick,
    StatusTick,
    ConsensusDue(String),
    FinishDue(String),
    KeyReleaseDue(String, Vec<KeyEntry>),
    ConsensusProbeTick(String),
    SettleDue(String),
    Shutdown,
}

#[derive(Clone)]
pub struct NodeHandle {
    pub event_tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    pub async fn command(&self, command: Command) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.event_tx.send(NodeEvent::Cli {
            command,
            reply: reply_tx,
        });
        Ok(reply_rx
            .await
            .unwrap_or_else(|_| "node shut down before replying".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.event_tx.send(NodeEvent::Shutdown);
    }
}

pub struct Node {
    config: NodeConfig,
    mesh: MeshManager,
    round: RoundEngine,
    event_tx: mpsc::UnboundedSender<NodeEvent>,
    event_rx: mpsc::UnboundedReceiver<NodeEvent>,
    started_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Node {
    pub fn new(config: NodeConfig) -> (Self, NodeHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let configured_seeds: Vec<(String, u16)> = config
            .seeds
            .iter()
            .map(|addr| (crate::config::normalize_host(&addr.ip().to_string()), addr.port()))
            .collect();
        let mesh = MeshManager::new(config.node_id.clone(), config.port, configured_seeds);
        let round = RoundEngine::new(config.node_id.clone());
        let node = Self {
            config,
            mesh,
            round,
            event_tx: event_tx.clone(),
            event_rx,
            started_at_ms: now_ms(),
        };
        (node, NodeHandle { event_tx })
    }

    /// Binds the listener and discovery socket, connects to configured
    /// seeds, and runs the event loop until `shutdown()` is called. Must be
    /// called only after `startup::run` has cleared the duplicate probe.
    pub async fn run(mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        tracing::info!(node_id = %self.config.node_id, port = self.config.port, "listening");

        let accept_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if accept_tx
                            .send(NodeEvent::InboundConnection(stream, addr))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "accept failed");
                    }
                }
            }
        });

        if let Ok(socket) = discovery::bind().await {
            let (beacon_tx, mut beacon_rx) = mpsc::unbounded_channel();
            let node_id = self.config.node_id.clone();
            let port = self.config.port;
            tokio::spawn(discovery::run(
                socket,
                node_id,
                port,
                crate::config::DEFAULT_BROADCAST_ADDR.to_string(),
                beacon_tx,
            ));
            let forward_tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(beacon) = beacon_rx.recv().await {
                    if forward_tx.send(NodeEvent::Beacon(beacon)).is_err() {
                        return;
                    }
                }
            });
        } else {
            tracing::warn!("could not bind discovery socket; LAN beaconing disabled");
        }

        if !self.config.gui_only {
            for seed in self.config.seeds.clone() {
                self.begin_dial(seed.ip().to_string(), seed.port());
            }
            self.schedule_heartbeat();
        }
        if !self.config.no_gui {
            self.schedule_status_tick();
        }

        while let Some(event) = self.event_rx.recv().await {
            match event {
                NodeEvent::Shutdown => break,
                other => self.handle_event(other).await,
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Link(link_event) => self.handle_link_event(link_event),
            NodeEvent::InboundConnection(stream, addr) => self.accept_inbound(stream, addr),
            NodeEvent::OutboundConnected(stream, host, port) => {
                self.mesh.end_connect(&host, port);
                self.open_outbound(stream, host, port);
            }
            NodeEvent::ConnectFailed(host, port) => {
                self.mesh.end_connect(&host, port);
            }
            NodeEvent::Beacon(discovered) => self.handle_beacon(discovered),
            NodeEvent::Cli { command, reply } => {
                let response = self.handle_command(command);
                let _ = reply.send(response);
            }
            NodeEvent::HeartbeatTick => {
                self.broadcast_voting(Message::Heartbeat {
                    from: self.config.node_id.clone(),
                });
                self.schedule_heartbeat();
            }
            NodeEvent::StatusTick => {
                self.send_status_update();
                self.schedule_status_tick();
            }
            NodeEvent::ConsensusDue(round_id) => self.on_consensus_due(round_id),
            NodeEvent::FinishDue(round_id) => self.on_finish_due(round_id),
            NodeEvent::KeyReleaseDue(round_id, keys) => self.on_key_release_due(round_id, keys),
            NodeEvent::ConsensusProbeTick(round_id) => self.on_consensus_probe(round_id),
            NodeEvent::SettleDue(round_id) => self.on_settle_due(round_id),
            NodeEvent::Shutdown => unreachable!("handled in run()"),
        }
    }

    // ---- connection lifecycle -------------------------------------------------

    fn begin_dial(&mut self, host: String, port: u16) {
        if !self.mesh.begin_connect(&host, port) {
            return;
        }
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    let _ = tx.send(NodeEvent::OutboundConnected(stream, host, port));
                }
                Err(e) => {
                    tracing::debug!(%host, port, error = %e, "outbound connect failed");
                    let _ = tx.send(NodeEvent::ConnectFailed(host, port));
                }
            }
        });
    }

    fn accept_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let link_id = self.mesh.alloc_link_id();
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let forward = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = link_rx.recv().await {
                if forward.send(NodeEvent::Link(evt)).is_err() {
                    return;
                }
            }
        });
        let handle = peer::spawn(
            stream,
            link_id,
            Direction::Inbound,
            PeerClass::VotingNode,
            Some(addr.ip().to_string()),
            None,
            link_tx,
        );
        self.mesh.insert_link(handle);
    }

    fn open_outbound(&mut self, stream: TcpStream, host: String, port: u16) {
        let link_id = self.mesh.alloc_link_id();
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let forward = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = link_rx.recv().await {
                if forward.send(NodeEvent::Link(evt)).is_err() {
                    return;
                }
            }
        });
        let handle = peer::spawn(
            stream,
            link_id,
            Direction::Outbound,
            PeerClass::VotingNode,
            Some(host),
            Some(port),
            link_tx,
        );
        let known_peers = self.mesh.build_gossip_list();
        handle.send(Message::Handshake {
            from: self.config.node_id.clone(),
            port: self.config.port,
            known_peers,
            startup_time: self.started_at_ms,
            is_gui: false,
        });
        self.mesh.insert_link(handle);
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Inbound { link_id, message } => self.handle_message(link_id, message),
            LinkEvent::Closed { link_id } => {
                self.mesh.remove_link(link_id);
            }
        }
    }

    fn handle_beacon(&mut self, discovered: DiscoveredBeacon) {
        let DiscoveredBeacon { beacon, from } = discovered;
        if beacon.node_id == self.config.node_id {
            return;
        }
        let host = crate::config::normalize_host(&from.ip().to_string());
        if self.mesh.is_active(&beacon.node_id) {
            return;
        }
        if let Some(record) = self.mesh.address_book.get(&beacon.node_id) {
            if record.host == host && record.port == beacon.port {
                return;
            }
        }
        self.begin_dial(host, beacon.port);
    }

    // ---- mesh-plane message handling ------------------------------------------

    fn handle_message(&mut self, link_id: LinkId, message: Message) {
        match message {
            Message::Handshake {
                from,
                port,
                known_peers,
                startup_time: _,
                is_gui,
            } => self.on_handshake(link_id, from, port, known_peers, is_gui, false),
            Message::HandshakeAck {
                from,
                port,
                known_peers,
                startup_time: _,
            } => self.on_handshake(link_id, from, port, known_peers, false, true),
            Message::Heartbeat { from } => {
                self.mesh.record_peer(
                    &from,
                    self.mesh
                        .address_book
                        .get(&from)
                        .map(|r| r.host.clone())
                        .unwrap_or_default()
                        .as_str(),
                    self.mesh.address_book.get(&from).map(|r| r.port).unwrap_or(0),
                    now_ms(),
                );
            }
            Message::PeerExchangeRequest { from, is_validation } => {
                self.on_peer_exchange_request(link_id, from, is_validation)
            }
            Message::PeerExchangeResponse { peers } => self.on_peer_exchange_response(peers),
            Message::DuplicateNodeRejection {
                reason,
                existing_node_id,
            } => {
                tracing::error!(reason, existing_node_id, "duplicate node identity rejected by mesh, shutting down");
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    let _ = tx.send(NodeEvent::Shutdown);
                });
            }
            Message::RoundStart {
                round_id,
                topic,
                allowed_choices,
                voting_time_seconds,
                start_time,
                from: _,
            } => self.on_round_start(round_id, topic, allowed_choices, voting_time_seconds, start_time),
            Message::EncryptedVote {
                round_id,
                anonymous_vote_id,
                encrypted_data,
                iv,
                timestamp,
                signature,
            } => {
                self.round.ingest_encrypted_vote(
                    &round_id,
                    anonymous_vote_id,
                    &encrypted_data,
                    &iv,
                    timestamp,
                    signature,
                );
                let count = self
                    .round
                    .get(&round_id)
                    .map(|r| r.encrypted_ballots.len())
                    .unwrap_or(0);
                self.broadcast_observers(Message::VoteReceived {
                    round_id,
                    encrypted_vote_count: count,
                });
            }
            Message::BatchVoteKeys { round_id, keys, from } => self.on_keys_received(round_id, keys, from),
            Message::VoteKey {
                round_id,
                anonymous_vote_id,
                key,
                from,
            } => self.on_keys_received(
                round_id,
                vec![KeyEntry {
                    anonymous_vote_id,
                    key,
                }],
                from,
            ),
            Message::ResultProposal {
                round_id,
                results,
                vote_count: _,
                from,
            } => self.on_result_proposal(round_id, from, results),
            Message::Command { command, args } => {
                if let Ok(parsed) = gui::translate_command(&command, &args) {
                    let response = self.handle_command(parsed);
                    if let Some(link) = self.mesh.links.get(&link_id) {
                        link.send(Message::CommandResponse { response });
                    }
                }
            }
            // Observer-plane notifications and ACKs we only ever emit, never act on.
            Message::StatusUpdate { .. }
            | Message::PhaseChange { .. }
            | Message::VoteReceived { .. }
            | Message::Results { .. }
            | Message::CommandResponse { .. } => {}
        }
    }

    fn on_handshake(
        &mut self,
        link_id: LinkId,
        from: String,
        port: u16,
        known_peers: Vec<PeerInfo>,
        is_gui: bool,
        is_ack: bool,
    ) {
        if from == self.config.node_id {
            if let Some(link) = self.mesh.links.get(&link_id) {
                link.send(Message::DuplicateNodeRejection {
                    reason: "node id already in use on this mesh".to_string(),
                    existing_node_id: self.config.node_id.clone(),
                });
            }
            self.mesh.remove_link(link_id);
            return;
        }

        let class = if is_gui { PeerClass::Gui } else { PeerClass::VotingNode };
        let host = self
            .mesh
            .links
            .get(&link_id)
            .and_then(|l| l.host.clone())
            .unwrap_or_default();
        if !is_gui {
            self.mesh.record_peer(&from, &host, port, now_ms());
        }
        self.mesh.mark_active(link_id, &from, class);

        if !is_ack {
            let known_peers_ack = if is_gui { Vec::new() } else { self.mesh.build_gossip_list() };
            if let Some(link) = self.mesh.links.get(&link_id) {
                link.send(Message::HandshakeAck {
                    from: self.config.node_id.clone(),
                    port: self.config.port,
                    known_peers: known_peers_ack,
                    startup_time: self.started_at_ms,
                });
                if !is_gui {
                    link.send(Message::PeerExchangeRequest {
                        from: self.config.node_id.clone(),
                        is_validation: false,
                    });
                }
            }
        }

        if !is_gui {
            self.dial_candidates(known_peers);
        }
    }

    fn on_peer_exchange_request(&mut self, link_id: LinkId, from: String, is_validation: bool) {
        if is_validation {
            // Startup validation probes are answered the same way as a
            // normal request; the probing node decides what it means.
        }
        let _ = from;
        let peers = self.mesh.build_gossip_list();
        if let Some(link) = self.mesh.links.get(&link_id) {
            link.send(Message::PeerExchangeResponse { peers });
        }
    }

    fn on_peer_exchange_response(&mut self, peers: Vec<PeerInfo>) {
        self.dial_candidates(peers);
    }

    fn dial_candidates(&mut self, peers: Vec<PeerInfo>) {
        let candidates = self.mesh.candidates_to_dial(&peers);
        for (index, candidate) in candidates.into_iter().take(MAX_GOSSIP_CONNECTS_PER_RESPONSE).enumerate() {
            let host = candidate.host.clone();
            let port = candidate.port;
            if self.mesh.pending_connects.contains(&(crate::config::normalize_host(&host), port)) {
                continue;
            }
            let delay = GOSSIP_CONNECT_STAGGER * index as u32;
            let tx = self.event_tx.clone();
            self.mesh.begin_connect(&host, port);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => {
                        let _ = tx.send(NodeEvent::OutboundConnected(stream, host, port));
                    }
                    Err(e) => {
                        tracing::debug!(%host, port, error = %e, "gossip-driven connect failed");
                        let _ = tx.send(NodeEvent::ConnectFailed(host, port));
                    }
                }
            });
        }
    }

    // ---- broadcast helpers ------------------------------------------------

    fn broadcast_voting(&mut self, message: Message) {
        let mut dead = Vec::new();
        for link_id in self.mesh.voting_link_ids() {
            if let Some(link) = self.mesh.links.get(&link_id) {
                if !link.send(message.clone()) {
                    dead.push(link_id);
                }
            }
        }
        for link_id in dead {
            self.mesh.remove_link(link_id);
        }
        if gui::is_mirrored(&message) {
            self.broadcast_observers(message);
        }
    }

    fn broadcast_observers(&mut self, message: Message) {
        for link_id in self.mesh.observer_link_ids() {
            if let Some(link) = self.mesh.links.get(&link_id) {
                link.send(message.clone());
            }
        }
    }

    fn send_status_update(&mut self) {
        if self.mesh.observer_link_ids().is_empty() {
            return;
        }
        let active_round = self.round.active();
        let inputs = StatusInputs {
            node_id: &self.config.node_id,
            peers: self.mesh.active_peer_ids().len(),
            peers_list: self.mesh.active_peer_ids(),
            round_topic: active_round.map(|r| r.topic.clone()),
            phase: active_round.map(|r| r.phase),
            time_remaining_ms: active_round.map(|r| (r.finish_due_at() - now_ms()).max(0)),
            encrypted_votes: active_round.map(|r| r.encrypted_ballots.len()).unwrap_or(0),
            decrypted_votes: active_round.map(|r| r.decrypted.len()).unwrap_or(0),
        };
        let message = gui::build_status_update(inputs);
        self.broadcast_observers(message);
    }

    // ---- round lifecycle ---------------------------------------------------

    fn on_round_start(
        &mut self,
        round_id: String,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: u64,
        start_time: i64,
    ) {
        let previous = self.round.active_round_id.clone();
        let accepted = self.round.accept_remote_round_start(
            round_id.clone(),
            topic,
            allowed_choices,
            voting_time_seconds,
            start_time,
        );
        if !accepted {
            return;
        }
        if let Some(prev_id) = previous {
            if prev_id != round_id {
                self.round.finish(&prev_id, self.mesh.active_node_count());
            }
        }
        self.broadcast_observers(Message::PhaseChange {
            round_id: round_id.clone(),
            phase: Phase::Voting.as_str().to_string(),
        });
        self.arm_round_timers(&round_id);
    }

    fn arm_round_timers(&mut self, round_id: &str) {
        let Some(round) = self.round.get(round_id) else {
            return;
        };
        let now = now_ms();
        let consensus_delay = (round.consensus_due_at() - now).max(100) as u64;
        let finish_delay = (round.finish_due_at() - now).max(100) as u64;

        let tx = self.event_tx.clone();
        let id = round_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(consensus_delay)).await;
            let _ = tx.send(NodeEvent::ConsensusDue(id));
        });
        let tx = self.event_tx.clone();
        let id = round_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(finish_delay)).await;
            let _ = tx.send(NodeEvent::FinishDue(id));
        });
    }

    fn on_consensus_due(&mut self, round_id: String) {
        let Some(keys) = self.round.enter_consensus(&round_id) else {
            return;
        };
        self.broadcast_observers(Message::PhaseChange {
            round_id: round_id.clone(),
            phase: Phase::Consensus.as_str().to_string(),
        });

        let mut rng = rand::thread_rng();
        let mut shuffled = keys;
        shuffled.shuffle(&mut rng);
        let entries: Vec<KeyEntry> = shuffled
            .into_iter()
            .map(|(id, key)| KeyEntry {
                anonymous_vote_id: id,
                key: hex::encode(key),
            })
            .collect();

        let delay_ms = rng.gen_range(KEY_RELEASE_DELAY_MIN_MS..=KEY_RELEASE_DELAY_MAX_MS);
        let tx = self.event_tx.clone();
        let id = round_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(NodeEvent::KeyReleaseDue(id, entries));
        });

        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(READINESS_PROBE_INTERVAL).await;
            let _ = tx.send(NodeEvent::ConsensusProbeTick(round_id));
        });
    }

    fn on_key_release_due(&mut self, round_id: String, keys: Vec<KeyEntry>) {
        if self.round.get(&round_id).map(|r| r.phase) != Some(Phase::Consensus) {
            return;
        }
        self.broadcast_voting(Message::BatchVoteKeys {
            round_id,
            keys,
            from: self.config.node_id.clone(),
        });
    }

    fn on_keys_received(&mut self, round_id: String, keys: Vec<KeyEntry>, from: String) {
        self.round.ingest_keys(&round_id, &keys, &from);
        self.check_readiness(&round_id);
    }

    fn on_consensus_probe(&mut self, round_id: String) {
        let Some(round) = self.round.get(&round_id) else {
            return;
        };
        if round.phase != Phase::Consensus || round.result_proposed {
            return;
        }
        self.check_readiness(&round_id);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(READINESS_PROBE_INTERVAL).await;
            let _ = tx.send(NodeEvent::ConsensusProbeTick(round_id));
        });
    }

    fn check_readiness(&mut self, round_id: &str) {
        let Some(round) = self.round.get(round_id) else {
            return;
        };
        if round.phase != Phase::Consensus || round.keys_sharing_complete {
            return;
        }
        let active_count = self.mesh.active_node_count();
        if !self.round.is_ready_for_proposal(round_id, active_count) {
            return;
        }
        self.round.mark_keys_sharing_complete(round_id);
        let tx = self.event_tx.clone();
        let id = round_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            let _ = tx.send(NodeEvent::SettleDue(id));
        });
    }

    fn on_settle_due(&mut self, round_id: String) {
        let active_count = self.mesh.active_node_count();
        let Some(message) = self.round.propose_result(&round_id) else {
            return;
        };
        self.round.ingest_result_proposal(
            &round_id,
            self.config.node_id.clone(),
            match &message {
                Message::ResultProposal { results, .. } => results,
                _ => unreachable!(),
            },
            active_count,
        );
        self.broadcast_voting(message);
        self.maybe_schedule_early_finish(&round_id, active_count);
    }

    fn on_result_proposal(&mut self, round_id: String, from: String, results: Vec<crate::codec::TallyEntry>) {
        let active_count = self.mesh.active_node_count();
        let just_achieved =
            self.round
                .ingest_result_proposal(&round_id, from, &results, active_count);
        if just_achieved {
            self.maybe_schedule_early_finish(&round_id, active_count);
        }
    }

    fn maybe_schedule_early_finish(&mut self, round_id: &str, active_count: usize) {
        let Some(round) = self.round.get(round_id) else {
            return;
        };
        if !round.consensus_achieved {
            return;
        }
        let tx = self.event_tx.clone();
        let id = round_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tx.send(NodeEvent::FinishDue(id));
        });
        let _ = active_count;
    }

    fn on_finish_due(&mut self, round_id: String) {
        let active_count = self.mesh.active_node_count();
        let Some(summary) = self.round.finish(&round_id, active_count) else {
            return;
        };
        self.broadcast_observers(Message::PhaseChange {
            round_id: round_id.clone(),
            phase: Phase::Finished.as_str().to_string(),
        });
        let message = gui::build_results_message(
            round_id,
            summary.results,
            summary.vote_count,
            summary.participating_nodes,
            summary.active_nodes,
        );
        self.broadcast_observers(message);
    }

    // ---- timers -------------------------------------------------------------

    fn schedule_heartbeat(&self) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let _ = tx.send(NodeEvent::HeartbeatTick);
        });
    }

    fn schedule_status_tick(&self) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gui::STATUS_INTERVAL).await;
            let _ = tx.send(NodeEvent::StatusTick);
        });
    }

    // ---- CLI / command dispatch ----------------------------------------------

    fn handle_command(&mut self, command: Command) -> String {
        match command {
            Command::Help => crate::cli::HELP_TEXT.to_string(),
            Command::Whoami => format!(
                "node_id={} port={} started_at={}",
                self.config.node_id, self.config.port, self.started_at_ms
            ),
            Command::Status => self.status_text(),
            Command::Peers => self.peers_text(),
            Command::Network => format!(
                "active_peers={} observers={} address_book={}",
                self.mesh.active_peer_ids().len(),
                self.mesh.observer_link_ids().len(),
                self.mesh.address_book.len()
            ),
            Command::Discover => "discovery beacon runs continuously; no manual sweep needed".to_string(),
            Command::Start {
                topic,
                allowed_choices,
                voting_time_seconds,
            } => self.start_round_command(topic, allowed_choices, voting_time_seconds),
            Command::Vote { choice } => self.vote_command(choice),
            Command::Results => self.results_text(),
            Command::Verify => self.verify_text(),
            Command::Debug => self.debug_text(),
            Command::CheckDuplicates => {
                "duplicate check only runs at startup; restart the node to re-probe".to_string()
            }
            Command::GuiInfo => format!("observers connected: {}", self.mesh.observer_link_ids().len()),
            Command::Quit => {
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(NodeEvent::Shutdown);
                });
                "shutting down".to_string()
            }
        }
    }

    fn start_round_command(
        &mut self,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: Option<u64>,
    ) -> String {
        if self.config.gui_only {
            return "policy error: this node is gui-only and does not participate in rounds".to_string();
        }
        if topic.trim().is_empty() {
            return "policy error: start requires a topic".to_string();
        }
        let message = self
            .round
            .start_local_round(topic, allowed_choices, voting_time_seconds, now_ms());
        let (round_id, voting_time_seconds) = match &message {
            Message::RoundStart {
                round_id,
                voting_time_seconds,
                ..
            } => (round_id.clone(), *voting_time_seconds),
            _ => unreachable!(),
        };
        self.broadcast_voting(message);
        self.broadcast_observers(Message::PhaseChange {
            round_id: round_id.clone(),
            phase: Phase::Voting.as_str().to_string(),
        });
        self.arm_round_timers(&round_id);
        format!("started round {round_id} ({voting_time_seconds}s)")
    }

    fn vote_command(&mut self, choice: String) -> String {
        if self.config.gui_only {
            return "policy error: this node is gui-only and does not participate in rounds".to_string();
        }
        match self.round.cast_vote(&choice, now_ms()) {
            Ok(message) => {
                self.broadcast_voting(message);
                format!("vote for '{choice}' cast")
            }
            Err(e) => format!("policy error: {e}"),
        }
    }

    fn status_text(&self) -> String {
        match self.round.active() {
            None => format!("node={} no active round", self.config.node_id),
            Some(round) => format!(
                "node={} round={} topic='{}' phase={} ballots={} decrypted={} active_nodes={}",
                self.config.node_id,
                round.round_id,
                round.topic,
                round.phase.as_str(),
                round.encrypted_ballots.len(),
                round.decrypted.len(),
                self.mesh.active_node_count(),
            ),
        }
    }

    fn peers_text(&self) -> String {
        if self.mesh.address_book.is_empty() {
            return "no known peers".to_string();
        }
        self.mesh
            .address_book
            .iter()
            .map(|(id, record)| {
                let active = if self.mesh.is_active(id) { "active" } else { "inactive" };
                format!("{id} {}:{} [{active}]", record.host, record.port)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn results_text(&self) -> String {
        match self.round.active() {
            None => "no round has been run".to_string(),
            Some(round) => {
                let rows = round.ordered_tally();
                if rows.is_empty() {
                    format!("round {} ({}): no decrypted ballots yet", round.round_id, round.phase.as_str())
                } else {
                    let formatted = rows
                        .iter()
                        .map(|r| format!("{}: {}", r.choice, r.count))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("round {} ({}): {formatted}", round.round_id, round.phase.as_str())
                }
            }
        }
    }

    fn verify_text(&self) -> String {
        match self.round.active().and_then(|r| r.my_ballot_tracking.as_ref()) {
            None => "no local ballot tracked for the active round".to_string(),
            Some(tracking) => format!(
                "vote_id={} choice={} verified={}",
                tracking.anonymous_vote_id, tracking.choice, tracking.verified
            ),
        }
    }

    fn debug_text(&self) -> String {
        format!(
            "links={} active_peers={} address_book={} active_round={:?}",
            self.mesh.links.len(),
            self.mesh.active_peer_ids().len(),
            self.mesh.address_book.len(),
            self.round.active_round_id,
        )
    }
}
