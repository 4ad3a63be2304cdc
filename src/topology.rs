//! Round-keyed peer topology for notary and DKG traffic.
//!
//! Each consensus round assigns governance-chosen node sets: one notary set
//! per chain and one DKG set. A node connects directly to every other
//! member of the sets it belongs to. For sets it does not belong to it
//! joins a small sampled overlay ("group") of [`GROUP_NODE_NUM`] peers
//! instead of a full mesh; a node in no DKG set but at least one notary set
//! also keeps a group toward the DKG set to receive DKG results.
//!
//! Every connection carries a label `(set kind, chain, round)`. A peer
//! stays a direct connection while it has at least one label; dropping the
//! last label drops the peer. Forgetting a round inverts the matching build
//! exactly, and the round histories are pruned so memory stays bounded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error};

use crate::crypto::PublicKeyBytes;
use crate::governance::Governance;
use crate::types::{ChainId, Round};

/// Size of the sampled overlay toward a set the node is not a member of.
pub const GROUP_NODE_NUM: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetKind {
    Notary,
    Dkg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerLabel {
    pub set: SetKind,
    /// Zero for DKG labels; the DKG set is round-wide.
    pub chain_id: ChainId,
    pub round: Round,
}

/// The transport seam: direct-peer and group membership management exposed
/// by the P2P server.
pub trait PeerTransport: Send + Sync {
    fn add_direct_peer(&self, peer: &PublicKeyBytes);
    fn remove_direct_peer(&self, peer: &PublicKeyBytes);
    fn add_group(&self, name: &str, nodes: &BTreeSet<PublicKeyBytes>, sample: usize);
    fn remove_group(&self, name: &str);
}

fn notary_set_name(chain_id: ChainId, round: Round) -> String {
    format!("{chain_id}-{round}-notaryset")
}

fn dkg_set_name(round: Round) -> String {
    format!("{round}-dkgset")
}

#[derive(Clone, Debug, Default)]
pub struct TopologyMetrics {
    pub direct_added: u64,
    pub direct_removed: u64,
    pub groups_added: u64,
    pub groups_removed: u64,
}

#[derive(Default)]
struct TopoState {
    history: BTreeSet<Round>,
    notary_history: BTreeSet<Round>,
    dkg_history: BTreeSet<Round>,
    peer_labels: HashMap<PublicKeyBytes, HashSet<PeerLabel>>,
    label_peers: HashMap<PeerLabel, HashSet<PublicKeyBytes>>,
    metrics: TopologyMetrics,
}

impl TopoState {
    fn add_label(&mut self, peer: &PublicKeyBytes, label: PeerLabel) {
        self.peer_labels.entry(peer.clone()).or_default().insert(label);
        self.label_peers.entry(label).or_default().insert(peer.clone());
    }

    /// Returns true when the peer lost its last label.
    fn remove_label(&mut self, peer: &PublicKeyBytes, label: PeerLabel) -> bool {
        let mut unlabeled = false;
        if let Some(labels) = self.peer_labels.get_mut(peer) {
            labels.remove(&label);
            if labels.is_empty() {
                self.peer_labels.remove(peer);
                unlabeled = true;
            }
        }
        if let Some(peers) = self.label_peers.get_mut(&label) {
            peers.remove(peer);
            if peers.is_empty() {
                self.label_peers.remove(&label);
            }
        }
        unlabeled
    }
}

pub struct Topology<T, G> {
    transport: T,
    gov: G,
    self_key: PublicKeyBytes,
    state: Mutex<TopoState>,
}

impl<T, G> Topology<T, G>
where
    T: PeerTransport,
    G: Governance,
{
    pub fn new(transport: T, gov: G, self_key: PublicKeyBytes) -> Self {
        Self { transport, gov, self_key, state: Mutex::new(TopoState::default()) }
    }

    pub fn metrics(&self) -> TopologyMetrics {
        self.state.lock().metrics.clone()
    }

    /// Peers currently carrying the given label.
    pub fn peers_with_label(&self, label: &PeerLabel) -> BTreeSet<PublicKeyBytes> {
        self.state
            .lock()
            .label_peers
            .get(label)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn labels_of(&self, peer: &PublicKeyBytes) -> HashSet<PeerLabel> {
        self.state.lock().peer_labels.get(peer).cloned().unwrap_or_default()
    }

    fn add_direct_peer(&self, state: &mut TopoState, peer: &PublicKeyBytes, label: PeerLabel) {
        state.add_label(peer, label);
        state.metrics.direct_added += 1;
        self.transport.add_direct_peer(peer);
    }

    fn remove_direct_peer(&self, state: &mut TopoState, peer: &PublicKeyBytes, label: PeerLabel) {
        if state.remove_label(peer, label) {
            state.metrics.direct_removed += 1;
            self.transport.remove_direct_peer(peer);
        }
    }

    /// Build the full topology for a round: direct connections within the
    /// sets the node belongs to, group fallbacks toward the ones it does
    /// not.
    pub fn build_connection(&self, round: Round) {
        let mut state = self.state.lock();
        state.history.insert(round);

        let mut dkg_peers = match self.gov.dkg_set(round) {
            Ok(set) => set,
            Err(e) => {
                error!(round, "get dkg set fail: {e}");
                BTreeSet::new()
            }
        };

        let in_dkg_set = dkg_peers.remove(&self.self_key);
        if in_dkg_set {
            let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
            for pk in &dkg_peers {
                self.add_direct_peer(&mut state, pk, label);
            }
        }

        let mut in_one_notary_set = false;
        for chain_id in 0..self.gov.num_chains(round) {
            let mut notary_peers = match self.gov.notary_set(round, chain_id) {
                Ok(set) => set,
                Err(e) => {
                    error!(round, chain_id, "get notary set fail: {e}");
                    continue;
                }
            };

            let label = PeerLabel { set: SetKind::Notary, chain_id, round };
            if !notary_peers.contains(&self.self_key) {
                for pk in &notary_peers {
                    state.add_label(pk, label);
                }
                state.metrics.groups_added += 1;
                self.transport.add_group(&notary_set_name(chain_id, round), &notary_peers, GROUP_NODE_NUM);
                continue;
            }

            notary_peers.remove(&self.self_key);
            for pk in &notary_peers {
                self.add_direct_peer(&mut state, pk, label);
            }
            in_one_notary_set = true;
        }

        // A notary that is not in the DKG set still needs to hear DKG
        // results; keep a small group toward the DKG nodes.
        if !in_dkg_set && in_one_notary_set {
            let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
            for pk in &dkg_peers {
                state.add_label(pk, label);
            }
            state.metrics.groups_added += 1;
            self.transport.add_group(&dkg_set_name(round), &dkg_peers, GROUP_NODE_NUM);
        }

        self.dump_peer_labels(&state, "build connection", round);
    }

    /// Invert `build_connection` for every recorded round up to and
    /// including `round`.
    pub fn forget_connection(&self, round: Round) {
        let mut state = self.state.lock();
        let stale: Vec<Round> = state.history.range(..=round).copied().collect();
        for r in stale {
            self.forget_connection_round(&mut state, r);
            state.history.remove(&r);
        }
        self.dump_peer_labels(&state, "forget connection", round);
    }

    fn forget_connection_round(&self, state: &mut TopoState, round: Round) {
        let mut dkg_peers = match self.gov.dkg_set(round) {
            Ok(set) => set,
            Err(e) => {
                error!(round, "get dkg set fail: {e}");
                BTreeSet::new()
            }
        };

        let in_dkg_set = dkg_peers.remove(&self.self_key);
        if in_dkg_set {
            let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
            for pk in &dkg_peers {
                self.remove_direct_peer(state, pk, label);
            }
        }

        let mut in_one_notary_set = false;
        for chain_id in 0..self.gov.num_chains(round) {
            let mut notary_peers = match self.gov.notary_set(round, chain_id) {
                Ok(set) => set,
                Err(e) => {
                    error!(round, chain_id, "get notary set fail: {e}");
                    continue;
                }
            };

            let label = PeerLabel { set: SetKind::Notary, chain_id, round };
            if !notary_peers.contains(&self.self_key) {
                for pk in &notary_peers {
                    state.remove_label(pk, label);
                }
                state.metrics.groups_removed += 1;
                self.transport.remove_group(&notary_set_name(chain_id, round));
                continue;
            }

            notary_peers.remove(&self.self_key);
            for pk in &notary_peers {
                self.remove_direct_peer(state, pk, label);
            }
            in_one_notary_set = true;
        }

        if !in_dkg_set && in_one_notary_set {
            let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
            for pk in &dkg_peers {
                state.remove_label(pk, label);
            }
            state.metrics.groups_removed += 1;
            self.transport.remove_group(&dkg_set_name(round));
        }
    }

    /// Notary-only build; idempotent per round.
    pub fn build_notary_conn(&self, round: Round) {
        let mut state = self.state.lock();
        if state.notary_history.contains(&round) {
            return;
        }
        state.notary_history.insert(round);

        for chain_id in 0..self.gov.num_chains(round) {
            let mut notary_peers = match self.gov.notary_set(round, chain_id) {
                Ok(set) => set,
                Err(e) => {
                    error!(round, chain_id, "get notary set fail: {e}");
                    continue;
                }
            };

            if !notary_peers.contains(&self.self_key) {
                state.metrics.groups_added += 1;
                self.transport.add_group(&notary_set_name(chain_id, round), &notary_peers, GROUP_NODE_NUM);
                continue;
            }

            let label = PeerLabel { set: SetKind::Notary, chain_id, round };
            notary_peers.remove(&self.self_key);
            for pk in &notary_peers {
                self.add_direct_peer(&mut state, pk, label);
            }
        }
        self.dump_peer_labels(&state, "build notary conn", round);
    }

    /// Forget notary connections for every recorded round `<= round`.
    pub fn forget_notary_conn(&self, round: Round) {
        let mut state = self.state.lock();
        let stale: Vec<Round> = state.notary_history.range(..=round).copied().collect();
        for r in stale {
            self.forget_notary_round(&mut state, r);
            state.notary_history.remove(&r);
        }
        self.dump_peer_labels(&state, "forget notary conn", round);
    }

    fn forget_notary_round(&self, state: &mut TopoState, round: Round) {
        for chain_id in 0..self.gov.num_chains(round) {
            let mut notary_peers = match self.gov.notary_set(round, chain_id) {
                Ok(set) => set,
                Err(e) => {
                    error!(round, chain_id, "get notary set fail: {e}");
                    continue;
                }
            };

            if !notary_peers.contains(&self.self_key) {
                state.metrics.groups_removed += 1;
                self.transport.remove_group(&notary_set_name(chain_id, round));
                continue;
            }

            let label = PeerLabel { set: SetKind::Notary, chain_id, round };
            notary_peers.remove(&self.self_key);
            for pk in &notary_peers {
                self.remove_direct_peer(state, pk, label);
            }
        }
    }

    /// DKG-only build; a no-op unless the node is in the round's DKG set.
    pub fn build_dkg_conn(&self, round: Round) {
        let mut state = self.state.lock();
        let mut dkg_peers = match self.gov.dkg_set(round) {
            Ok(set) => set,
            Err(e) => {
                error!(round, "get dkg set fail: {e}");
                return;
            }
        };

        if !dkg_peers.remove(&self.self_key) {
            return;
        }
        state.dkg_history.insert(round);

        let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
        for pk in &dkg_peers {
            self.add_direct_peer(&mut state, pk, label);
        }
        self.dump_peer_labels(&state, "build dkg conn", round);
    }

    /// Forget DKG connections for every recorded round `<= round`.
    pub fn forget_dkg_conn(&self, round: Round) {
        let mut state = self.state.lock();
        let stale: Vec<Round> = state.dkg_history.range(..=round).copied().collect();
        for r in stale {
            self.forget_dkg_round(&mut state, r);
            state.dkg_history.remove(&r);
        }
        self.dump_peer_labels(&state, "forget dkg conn", round);
    }

    fn forget_dkg_round(&self, state: &mut TopoState, round: Round) {
        let mut dkg_peers = match self.gov.dkg_set(round) {
            Ok(set) => set,
            Err(e) => {
                error!(round, "get dkg set fail: {e}");
                return;
            }
        };
        if !dkg_peers.remove(&self.self_key) {
            return;
        }

        let label = PeerLabel { set: SetKind::Dkg, chain_id: 0, round };
        for pk in &dkg_peers {
            self.remove_direct_peer(state, pk, label);
        }
    }

    fn dump_peer_labels(&self, state: &TopoState, op: &str, round: Round) {
        debug!(op, round, peers = state.peer_labels.len(), "topology updated");
        for (peer, labels) in &state.peer_labels {
            for label in labels {
                debug!(
                    op,
                    peer = %hex::encode(&peer.0[..peer.0.len().min(8)]),
                    round = label.round,
                    chain = label.chain_id,
                    set = ?label.set,
                    "peer label"
                );
            }
        }
    }
}
