//! The peer mesh: address book, link registry, handshake/gossip/heartbeat
//! bookkeeping and duplicate-identity detection. Owned exclusively by the
//! node actor; every method here is synchronous state manipulation, all
//! I/O (dialing, sending) happens in `crate::node`.

use std::collections::{HashMap, HashSet};

use crate::codec::PeerInfo;
use crate::config::normalize_host;
use crate::peer::{LinkHandle, LinkId, PeerClass};

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub host: String,
    pub port: u16,
    pub last_seen: i64,
}

pub struct MeshManager {
    pub my_node_id: String,
    pub my_port: u16,
    /// Every node ever learned of, keyed by node id. Survives disconnects.
    pub address_book: HashMap<String, PeerRecord>,
    /// Every currently open link, keyed by a locally-assigned id.
    pub links: HashMap<LinkId, LinkHandle>,
    /// `(host, port)` pairs with an outbound connect already in flight, so
    /// the beacon and gossip never double-dial the same address.
    pub pending_connects: HashSet<(String, u16)>,
    /// Addresses supplied on the command line, kept around so gossip can
    /// keep advertising them even if their link has since dropped.
    pub configured_seeds: Vec<(String, u16)>,
    next_link_id: LinkId,
}

impl MeshManager {
    pub fn new(my_node_id: String, my_port: u16, configured_seeds: Vec<(String, u16)>) -> Self {
        Self {
            my_node_id,
            my_port,
            address_book: HashMap::new(),
            links: HashMap::new(),
            pending_connects: HashSet::new(),
            configured_seeds,
            next_link_id: 0,
        }
    }

    pub fn alloc_link_id(&mut self) -> LinkId {
        let id = self.next_link_id;
        self.next_link_id += 1;
        id
    }

    pub fn insert_link(&mut self, handle: LinkHandle) {
        self.links.insert(handle.link_id, handle);
    }

    pub fn remove_link(&mut self, link_id: LinkId) -> Option<LinkHandle> {
        self.links.remove(&link_id)
    }

    pub fn link_node_id(&self, link_id: LinkId) -> Option<&str> {
        self.links.get(&link_id).and_then(|l| l.node_id.as_deref())
    }

    /// Records or refreshes an address-book entry. Returns `true` if this
    /// is new evidence (wasn't already recorded with this address).
    pub fn record_peer(&mut self, node_id: &str, host: &str, port: u16, now_ms: i64) -> bool {
        let host = normalize_host(host);
        let is_new = match self.address_book.get(node_id) {
            Some(existing) => existing.host != host || existing.port != port,
            None => true,
        };
        self.address_book.insert(
            node_id.to_string(),
            PeerRecord {
                host,
                port,
                last_seen: now_ms,
            },
        );
        is_new
    }

    /// Marks a link as handshake-complete for `node_id`. If another link
    /// is already active for the same node id, the new one wins (the
    /// caller is expected to have already run the duplicate-identity check
    /// before calling this for a *different* remote).
    pub fn mark_active(&mut self, link_id: LinkId, node_id: &str, class: PeerClass) {
        // Deactivate any previous link for this node id (stale handshake).
        let stale: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(id, l)| **id != link_id && l.node_id.as_deref() == Some(node_id))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.links.remove(&id);
        }
        if let Some(link) = self.links.get_mut(&link_id) {
            link.node_id = Some(node_id.to_string());
            link.class = class;
        }
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        self.links
            .values()
            .any(|l| l.node_id.as_deref() == Some(node_id) && l.class == PeerClass::VotingNode)
    }

    /// Node ids with a currently open, handshake-complete voting-plane link.
    pub fn active_peer_ids(&self) -> Vec<String> {
        self.links
            .values()
            .filter(|l| l.class == PeerClass::VotingNode)
            .filter_map(|l| l.node_id.clone())
            .collect()
    }

    /// Peers plus self: the consensus threshold denominator.
    pub fn active_node_count(&self) -> usize {
        self.active_peer_ids().len() + 1
    }

    pub fn observer_link_ids(&self) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|(_, l)| l.class == PeerClass::Gui)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn voting_link_ids(&self) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|(_, l)| l.class == PeerClass::VotingNode && l.node_id.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Peer list to hand out in a handshake ack or gossip response: the
    /// configured seeds (by whatever node id we've since learned for them)
    /// plus every currently-active peer's recorded address.
    pub fn build_gossip_list(&self) -> Vec<PeerInfo> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (seed_host, seed_port) in &self.configured_seeds {
            let seed_host = normalize_host(seed_host);
            if let Some((node_id, record)) = self
                .address_book
                .iter()
                .find(|(_, r)| r.host == seed_host && r.port == *seed_port)
            {
                if seen.insert(node_id.clone()) {
                    out.push(PeerInfo {
                        node_id: node_id.clone(),
                        host: record.host.clone(),
                        port: record.port,
                    });
                }
            }
        }
        for node_id in self.active_peer_ids() {
            if !seen.insert(node_id.clone()) {
                continue;
            }
            if let Some(record) = self.address_book.get(&node_id) {
                out.push(PeerInfo {
                    node_id,
                    host: record.host.clone(),
                    port: record.port,
                });
            }
        }
        out
    }

    /// Filters a gossiped/handshaked peer list down to addresses worth
    /// dialing: not self, not already connected, not already being dialed,
    /// not our own loopback address.
    pub fn candidates_to_dial(&self, peers: &[PeerInfo]) -> Vec<PeerInfo> {
        peers
            .iter()
            .filter(|p| {
                if p.node_id == self.my_node_id {
                    return false;
                }
                if p.host.is_empty() || p.port == 0 {
                    return false;
                }
                if normalize_host(&p.host) == "localhost" && p.port == self.my_port {
                    return false;
                }
                if self.is_active(&p.node_id) {
                    return false;
                }
                let key = (normalize_host(&p.host), p.port);
                if self.pending_connects.contains(&key) {
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    pub fn begin_connect(&mut self, host: &str, port: u16) -> bool {
        self.pending_connects.insert((normalize_host(host), port))
    }

    pub fn end_connect(&mut self, host: &str, port: u16) {
        self.pending_connects.remove(&(normalize_host(host), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_node_count_includes_self() {
        let mesh = MeshManager::new("alice".into(), 3001, Vec::new());
        assert_eq!(mesh.active_node_count(), 1);
    }

    #[test]
    fn candidates_to_dial_filters_self_and_own_loopback() {
        let mesh = MeshManager::new("alice".into(), 3001, Vec::new());
        let peers = vec![
            PeerInfo {
                node_id: "alice".into(),
                host: "localhost".into(),
                port: 3002,
            },
            PeerInfo {
                node_id: "bob".into(),
                host: "127.0.0.1".into(),
                port: 3001,
            },
            PeerInfo {
                node_id: "carol".into(),
                host: "localhost".into(),
                port: 3003,
            },
        ];
        let candidates = mesh.candidates_to_dial(&peers);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "carol");
    }

    #[test]
    fn pending_connect_is_deduplicated() {
        let mut mesh = MeshManager::new("alice".into(), 3001, Vec::new());
        assert!(mesh.begin_connect("bob-host", 3002));
        assert!(!mesh.begin_connect("bob-host", 3002));
        mesh.end_connect("bob-host", 3002);
        assert!(mesh.begin_connect("bob-host", 3002));
    }
}
