//! An iterative closest-node search.
//!
//! A [`Lookup`] keeps the set of peers closest to a target id, ordered by XOR distance, and
//! walks towards the target by querying a bounded number of them in parallel. Using a lookup
//! involves repeating two steps:
//!
//! 1. Draining [`Lookup::next_event`]. A [`LookupEvent::Peer`] asks the driver to issue a
//!    FINDNODE request to that peer.
//!
//! 2. Reporting request outcomes back through [`Lookup::on_success`] and [`Lookup::on_failure`].
//!
//! While the search yields closer peers it queries `parallelism` peers at a time. A search that
//! stops making progress becomes stalled and widens its parallelism to `num_results` in an
//! attempt to finish. Once `num_results` of the closest peers have responded, or no queryable
//! peer remains, the lookup emits [`LookupEvent::Finished`] with the closest responsive node ids
//! in ascending distance.
//!
//! Peers respond to FINDNODE with nodes at a requested distance, so a single peer may be queried
//! several times, up to `iterations_per_peer`, to accumulate its neighbours.

use crate::config::Config;
use crate::Enr;
use enr::NodeId;
use fnv::FnvHashMap;
use std::collections::{btree_map::Entry, BTreeMap, VecDeque};
use tracing::trace;

/// The XOR metric distance between two node ids, ordered as a 256-bit big-endian integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    pub fn between(a: &NodeId, b: &NodeId) -> Distance {
        let (a, b) = (a.raw(), b.raw());
        let mut distance = [0u8; 32];
        for i in 0..32 {
            distance[i] = a[i] ^ b[i];
        }
        Distance(distance)
    }
}

/// A record describing a peer a lookup has learnt about. The service instantiates lookups over
/// ENRs, tests may use bare node ids.
pub trait PeerRecord: Clone {
    /// The node id the record belongs to.
    fn peer_id(&self) -> NodeId;
}

impl PeerRecord for Enr {
    fn peer_id(&self) -> NodeId {
        self.node_id()
    }
}

impl PeerRecord for NodeId {
    fn peer_id(&self) -> NodeId {
        self.clone()
    }
}

/// Configuration for a [`Lookup`].
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// The number of peers queried in parallel while the lookup makes progress. The `alpha`
    /// parameter in the Kademlia paper.
    pub parallelism: usize,

    /// The number of closest peers the lookup must obtain successful responses from before it
    /// terminates. The `k` parameter in the Kademlia paper.
    pub num_results: usize,

    /// The number of times a single peer may be queried before its result is final.
    pub iterations_per_peer: usize,
}

impl LookupConfig {
    pub fn new_from_config(config: &Config) -> Self {
        LookupConfig {
            parallelism: config.lookup_parallelism,
            num_results: config.lookup_num_results,
            iterations_per_peer: config.lookup_iterations_per_peer,
        }
    }
}

/// The events produced by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEvent {
    /// The driver should issue a FINDNODE request to this peer.
    Peer(NodeId),
    /// The lookup terminated. Carries the closest responsive node ids, nearest first.
    Finished(Vec<NodeId>),
}

/// The overall stage of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupState {
    /// The lookup is iterating towards the target, querying up to `parallelism` peers at a
    /// time.
    Iterating {
        /// The number of consecutive responses that yielded no peer closer to the target. Once
        /// this reaches `parallelism * iterations_per_peer` the lookup is considered stalled.
        no_progress: usize,
    },

    /// The lookup stopped making progress. The allowed parallelism is raised to `num_results`
    /// because the closest known peers may still respond and revive the search.
    Stalled,

    /// The lookup terminated.
    Finished,
}

/// The query state of a single peer within a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// The peer has not been queried yet.
    NotContacted,
    /// The peer answered with fewer peers than requested and waits to be queried again.
    PendingIteration,
    /// A request to the peer is outstanding.
    Waiting,
    /// The peer delivered results. A final state.
    Succeeded,
    /// The peer failed to deliver any result. A final state.
    Failed,
}

/// A peer participating in a lookup.
#[derive(Debug, Clone)]
struct LookupPeer {
    node_id: NodeId,
    /// Which query iteration the peer is on, starting at 1.
    iteration: usize,
    /// The total number of peers this peer has returned across its iterations.
    peers_returned: usize,
    state: PeerState,
}

impl LookupPeer {
    fn new(node_id: NodeId) -> Self {
        LookupPeer {
            node_id,
            iteration: 1,
            peers_returned: 0,
            state: PeerState::NotContacted,
        }
    }
}

/// A single iterative closest-node search.
pub struct Lookup<TRecord: PeerRecord = Enr> {
    /// The id being searched for.
    target: NodeId,

    /// The stage of the search.
    state: LookupState,

    /// The closest peers known to the lookup, ordered by ascending distance to the target.
    closest_peers: BTreeMap<Distance, LookupPeer>,

    /// The number of peers with outstanding requests.
    num_waiting: usize,

    /// Records discovered through the search. They have not been contacted or verified, the
    /// driver uses them to address its requests.
    untrusted_enrs: FnvHashMap<NodeId, TRecord>,

    /// Events awaiting collection by the driver.
    events: VecDeque<LookupEvent>,

    /// The configuration of the lookup.
    config: LookupConfig,
}

impl<TRecord: PeerRecord> Lookup<TRecord> {
    /// Creates a lookup seeded with up to `num_results` of the closest peers known to the
    /// caller. Call [`Lookup::start`] to begin emitting events.
    pub fn with_config<I>(config: LookupConfig, target: NodeId, known_closest_peers: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let closest_peers: BTreeMap<Distance, LookupPeer> = known_closest_peers
            .into_iter()
            .map(|node_id| {
                let distance = Distance::between(&target, &node_id);
                (distance, LookupPeer::new(node_id))
            })
            .take(config.num_results)
            .collect();

        Lookup {
            target,
            state: LookupState::Iterating { no_progress: 0 },
            closest_peers,
            num_waiting: 0,
            untrusted_enrs: FnvHashMap::default(),
            events: VecDeque::new(),
            config,
        }
    }

    /// The target of the lookup.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// The record of a peer discovered during the search, if any.
    pub fn untrusted_enr(&self, node_id: &NodeId) -> Option<&TRecord> {
        self.untrusted_enrs.get(node_id)
    }

    /// The next event produced by the lookup, if any.
    pub fn next_event(&mut self) -> Option<LookupEvent> {
        self.events.pop_front()
    }

    /// Begins the search, scheduling requests up to the permitted parallelism.
    pub fn start(&mut self) {
        self.next_peer();
    }

    /// Terminates the lookup. The finished event fires once, with whatever results have been
    /// delivered so far.
    pub fn stop(&mut self) {
        self.finish();
    }

    /// Delivers the result of a successful request to a peer the lookup is waiting on.
    ///
    /// The lookup makes progress when `closer_peers` contains a peer closer to the target than
    /// any seen so far, or while fewer than `num_results` peers are known at all. Results for
    /// peers the lookup is not waiting on are ignored.
    pub fn on_success(&mut self, node_id: &NodeId, closer_peers: &[TRecord]) {
        if let LookupState::Finished = self.state {
            return;
        }

        let distance = Distance::between(&self.target, node_id);

        // mark the peer's progress, it either delivered enough, gets another iteration or is
        // done
        match self.closest_peers.entry(distance) {
            Entry::Vacant(..) => return,
            Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                if peer.state != PeerState::Waiting {
                    return;
                }
                debug_assert!(self.num_waiting > 0);
                self.num_waiting -= 1;
                peer.peers_returned += closer_peers.len();
                if peer.peers_returned >= self.config.num_results {
                    peer.state = PeerState::Succeeded;
                } else if peer.iteration >= self.config.iterations_per_peer {
                    // the peer is out of iterations, it succeeded if it ever returned anything
                    peer.state = if peer.peers_returned > 0 {
                        PeerState::Succeeded
                    } else {
                        PeerState::Failed
                    };
                } else {
                    peer.iteration += 1;
                    peer.state = PeerState::PendingIteration;
                }
            }
        }

        // incorporate the reported peers
        let mut progress = false;
        let num_closest = self.closest_peers.len();
        for record in closer_peers {
            let peer_id = record.peer_id();
            let distance = Distance::between(&self.target, &peer_id);
            self.closest_peers
                .entry(distance.clone())
                .or_insert_with(|| LookupPeer::new(peer_id.clone()));
            self.untrusted_enrs
                .entry(peer_id)
                .or_insert_with(|| record.clone());
            // progress is re-evaluated after every insertion
            progress = self.closest_peers.keys().next() == Some(&distance)
                || num_closest < self.config.num_results;
        }

        self.state = match self.state {
            LookupState::Iterating { no_progress } => {
                let no_progress = if progress { 0 } else { no_progress + 1 };
                if no_progress >= self.config.parallelism * self.config.iterations_per_peer {
                    trace!(lookup = %self.target, "Lookup stalled");
                    LookupState::Stalled
                } else {
                    LookupState::Iterating { no_progress }
                }
            }
            LookupState::Stalled => {
                if progress {
                    trace!(lookup = %self.target, "Lookup recovered from a stall");
                    LookupState::Iterating { no_progress: 0 }
                } else {
                    LookupState::Stalled
                }
            }
            LookupState::Finished => LookupState::Finished,
        };

        self.next_peer();
    }

    /// Reports a failed request for a peer the lookup is waiting on. Failures for peers the
    /// lookup is not waiting on are ignored.
    pub fn on_failure(&mut self, node_id: &NodeId) {
        if let LookupState::Finished = self.state {
            return;
        }

        let distance = Distance::between(&self.target, node_id);
        if let Some(peer) = self.closest_peers.get_mut(&distance) {
            if peer.state == PeerState::Waiting {
                debug_assert!(self.num_waiting > 0);
                self.num_waiting -= 1;
                peer.state = PeerState::Failed;
            }
        }

        self.next_peer();
    }

    /// Walks the peers in ascending distance, scheduling requests while below the permitted
    /// parallelism and terminating the lookup when enough of the closest peers have responded
    /// or nothing queryable remains.
    fn next_peer(&mut self) {
        if let LookupState::Finished = self.state {
            return;
        }

        let capacity = self.capacity();

        // The number of responded peers among the closest. Counting stops once a request to a
        // closer peer is outstanding, the lookup cannot terminate before that peer answers.
        let mut result_counter = Some(0);
        let mut num_waiting = self.num_waiting;
        let mut scheduled = Vec::new();
        let mut finished = false;
        let mut at_capacity = false;

        for peer in self.closest_peers.values_mut() {
            match peer.state {
                PeerState::NotContacted | PeerState::PendingIteration => {
                    if num_waiting >= capacity {
                        at_capacity = true;
                        break;
                    }
                    peer.state = PeerState::Waiting;
                    num_waiting += 1;
                    scheduled.push(peer.node_id.clone());
                    result_counter = None;
                }
                PeerState::Waiting => {
                    result_counter = None;
                }
                PeerState::Succeeded => {
                    if let Some(count) = result_counter.as_mut() {
                        *count += 1;
                        if *count >= self.config.num_results {
                            finished = true;
                            break;
                        }
                    }
                }
                PeerState::Failed => {}
            }
        }

        self.num_waiting = num_waiting;
        for node_id in scheduled {
            trace!(lookup = %self.target, peer = %node_id, "Lookup querying peer");
            self.events.push_back(LookupEvent::Peer(node_id));
        }

        if finished || (self.num_waiting == 0 && !at_capacity) {
            self.finish();
        }
    }

    /// The number of requests the lookup may have outstanding. While stalled, up to
    /// `num_results` parallel requests are allowed, a slightly more permissive variant of
    /// re-querying all closest unqueried peers at once.
    fn capacity(&self) -> usize {
        match self.state {
            LookupState::Iterating { .. } => self.config.parallelism,
            LookupState::Stalled => self.config.num_results,
            LookupState::Finished => 0,
        }
    }

    /// Terminates the lookup and emits the ordered results. Has no effect on a finished lookup.
    fn finish(&mut self) {
        if let LookupState::Finished = self.state {
            return;
        }
        self.state = LookupState::Finished;

        let found: Vec<NodeId> = self
            .closest_peers
            .values()
            .filter(|peer| peer.state == PeerState::Succeeded)
            .map(|peer| peer.node_id.clone())
            .take(self.config.num_results)
            .collect();

        trace!(lookup = %self.target, results = found.len(), "Lookup finished");
        self.events.push_back(LookupEvent::Finished(found));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(index: u8) -> NodeId {
        let mut raw = [0u8; 32];
        raw[31] = index;
        NodeId::new(&raw)
    }

    fn config(parallelism: usize, num_results: usize, iterations_per_peer: usize) -> LookupConfig {
        LookupConfig {
            parallelism,
            num_results,
            iterations_per_peer,
        }
    }

    fn drain(lookup: &mut Lookup<NodeId>) -> Vec<LookupEvent> {
        let mut events = Vec::new();
        while let Some(event) = lookup.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn schedules_closest_peers_first_and_finishes_in_order() {
        let mut lookup =
            Lookup::with_config(config(2, 3, 1), node_id(0), (1..=5).map(node_id));
        // seeds are capped at num_results
        assert_eq!(lookup.closest_peers.len(), 3);

        lookup.start();
        assert_eq!(
            drain(&mut lookup),
            vec![
                LookupEvent::Peer(node_id(1)),
                LookupEvent::Peer(node_id(2))
            ]
        );
        assert_eq!(lookup.num_waiting, 2);

        // the closest peer returns an even closer one, which is scheduled immediately
        lookup.on_success(&node_id(1), &[node_id(0)]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(0))]);
        assert!(matches!(
            lookup.state,
            LookupState::Iterating { no_progress: 0 }
        ));

        // a response with nothing closer is no progress, the next seed is scheduled
        lookup.on_success(&node_id(2), &[node_id(4)]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(3))]);
        assert!(matches!(
            lookup.state,
            LookupState::Iterating { no_progress: 1 }
        ));

        // once the closest num_results peers responded the lookup finishes nearest first,
        // without waiting for the farther outstanding request
        lookup.on_success(&node_id(0), &[node_id(1)]);
        assert_eq!(
            drain(&mut lookup),
            vec![LookupEvent::Finished(vec![
                node_id(0),
                node_id(1),
                node_id(2)
            ])]
        );

        // late responses are ignored
        lookup.on_success(&node_id(3), &[node_id(7)]);
        assert!(drain(&mut lookup).is_empty());
    }

    #[test]
    fn stalls_without_progress_and_recovers() {
        let mut lookup = Lookup::with_config(
            config(2, 3, 1),
            node_id(0),
            vec![node_id(10), node_id(11), node_id(12)],
        );
        lookup.start();
        assert_eq!(
            drain(&mut lookup),
            vec![
                LookupEvent::Peer(node_id(10)),
                LookupEvent::Peer(node_id(11))
            ]
        );

        // responses without anything closer
        lookup.on_success(&node_id(10), &[node_id(12)]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(12))]);
        lookup.on_success(&node_id(11), &[node_id(13), node_id(14)]);
        assert!(matches!(lookup.state, LookupState::Stalled));

        // while stalled the permitted parallelism widens to num_results
        assert_eq!(
            drain(&mut lookup),
            vec![
                LookupEvent::Peer(node_id(13)),
                LookupEvent::Peer(node_id(14))
            ]
        );
        assert_eq!(lookup.num_waiting, 3);

        // a closer peer revives the search
        lookup.on_success(&node_id(12), &[node_id(1)]);
        assert!(matches!(
            lookup.state,
            LookupState::Iterating { no_progress: 0 }
        ));
    }

    #[test]
    fn parallelism_is_bounded() {
        let mut lookup: Lookup<NodeId> =
            Lookup::with_config(config(2, 16, 1), node_id(0), (1..=10).map(node_id));
        lookup.start();
        assert_eq!(lookup.num_waiting, 2);

        // a freed slot is refilled but the bound holds
        lookup.on_success(&node_id(1), &[]);
        assert_eq!(lookup.num_waiting, 2);
    }

    #[test]
    fn finishes_when_no_peers_remain() {
        let mut lookup = Lookup::with_config(
            config(3, 16, 1),
            node_id(0),
            vec![node_id(1), node_id(2)],
        );
        lookup.start();
        assert_eq!(
            drain(&mut lookup),
            vec![
                LookupEvent::Peer(node_id(1)),
                LookupEvent::Peer(node_id(2))
            ]
        );

        lookup.on_failure(&node_id(1));
        assert!(drain(&mut lookup).is_empty());
        lookup.on_failure(&node_id(2));
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Finished(vec![])]);

        // further input is ignored, finished fires exactly once
        lookup.on_failure(&node_id(2));
        lookup.on_success(&node_id(1), &[node_id(3)]);
        assert!(drain(&mut lookup).is_empty());
    }

    #[test]
    fn peers_are_iterated_up_to_the_configured_limit() {
        let mut lookup =
            Lookup::with_config(config(1, 16, 2), node_id(0), vec![node_id(5)]);
        lookup.start();
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(5))]);

        // fewer than num_results peers returned, the peer gets another iteration before the
        // newly discovered peer is contacted
        lookup.on_success(&node_id(5), &[node_id(6)]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(5))]);

        // out of iterations, the peer succeeded since it returned something
        lookup.on_success(&node_id(5), &[]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(6))]);

        // a peer that never returns anything ends up failed
        lookup.on_success(&node_id(6), &[]);
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Peer(node_id(6))]);
        lookup.on_success(&node_id(6), &[]);
        assert_eq!(
            drain(&mut lookup),
            vec![LookupEvent::Finished(vec![node_id(5)])]
        );
    }

    #[test]
    fn discovered_records_are_retained() {
        let mut lookup =
            Lookup::with_config(config(1, 16, 1), node_id(0), vec![node_id(5)]);
        lookup.start();
        drain(&mut lookup);

        lookup.on_success(&node_id(5), &[node_id(6)]);
        assert_eq!(lookup.untrusted_enr(&node_id(6)), Some(&node_id(6)));
        assert_eq!(lookup.untrusted_enr(&node_id(7)), None);
    }

    #[test]
    fn stop_finishes_once() {
        let mut lookup =
            Lookup::with_config(config(2, 3, 1), node_id(0), (1..=5).map(node_id));
        lookup.start();
        drain(&mut lookup);

        lookup.stop();
        assert_eq!(drain(&mut lookup), vec![LookupEvent::Finished(vec![])]);
        lookup.stop();
        assert!(drain(&mut lookup).is_empty());
    }
}
