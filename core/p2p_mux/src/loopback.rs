//! In-memory loopback substrate
//!
//! A [`LoopbackNetwork`] connects any number of endpoints inside one
//! process. It behaves like a session-oriented P2P service:
//!
//! - sending to a peer opens an outgoing session on the sender's side
//! - the first packet from a peer without a session raises a
//!   [`SessionEvent::SessionRequest`] on the receiver, and that peer's
//!   packets are held until the session is accepted
//! - sending to a peer id with no endpoint raises
//!   [`SessionError::DestinationNotLoggedIn`] on the sender
//!
//! Everything is single-threaded (`Rc<RefCell<..>>`), matching the
//! cooperative model of the engine. Test hooks let callers inject packets
//! and events, reject sends, and inspect what was sent or closed.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::channel::SendMode;
use crate::substrate::{PeerId, SessionError, SessionEvent, Substrate};

/// Record of a packet accepted by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub to: PeerId,
    pub channel: u8,
    pub mode: SendMode,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Node {
    /// Delivered packets per channel
    queues: HashMap<u8, VecDeque<(PeerId, Vec<u8>)>>,
    /// Pending session events
    events: VecDeque<SessionEvent>,
    /// Peers with an open session (accepted or initiated)
    sessions: HashSet<PeerId>,
    /// Peers that raised a session request we haven't answered
    requested: HashSet<PeerId>,
    /// Packets held until the session is accepted
    pending: HashMap<PeerId, Vec<(u8, Vec<u8>)>>,
    reject_sends: bool,
    sent: Vec<SentPacket>,
    closed: Vec<PeerId>,
}

impl Node {
    fn deliver(&mut self, from: PeerId, channel: u8, data: Vec<u8>) {
        self.queues.entry(channel).or_default().push_back((from, data));
    }
}

/// Shared in-memory network
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Rc<RefCell<HashMap<PeerId, Node>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reattach to) the endpoint for `id`
    pub fn endpoint(&self, id: PeerId) -> LoopbackSubstrate {
        self.nodes.borrow_mut().entry(id).or_default();
        LoopbackSubstrate {
            id,
            nodes: Rc::clone(&self.nodes),
        }
    }

    /// Queue a packet directly on `to`'s channel, bypassing sessions
    pub fn inject_packet(&self, to: PeerId, from: PeerId, channel: u8, data: Vec<u8>) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&to) {
            node.deliver(from, channel, data);
        }
    }

    /// Queue a session event on `to`
    pub fn inject_event(&self, to: PeerId, event: SessionEvent) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&to) {
            node.events.push_back(event);
        }
    }

    /// Make every send from `id` fail (or succeed again)
    pub fn set_reject_sends(&self, id: PeerId, reject: bool) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(&id) {
            node.reject_sends = reject;
        }
    }

    /// Packets accepted from `id`, oldest first
    pub fn sent_packets(&self, id: PeerId) -> Vec<SentPacket> {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.sent.clone())
            .unwrap_or_default()
    }

    /// Sessions `id` has closed, in order
    pub fn closed_sessions(&self, id: PeerId) -> Vec<PeerId> {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.closed.clone())
            .unwrap_or_default()
    }

    /// Whether `id` has an open session with `peer`
    pub fn has_session(&self, id: PeerId, peer: PeerId) -> bool {
        self.nodes
            .borrow()
            .get(&id)
            .map(|n| n.sessions.contains(&peer))
            .unwrap_or(false)
    }

    /// Number of packets queued on `channel` at `id`
    pub fn queued(&self, id: PeerId, channel: u8) -> usize {
        self.nodes
            .borrow()
            .get(&id)
            .and_then(|n| n.queues.get(&channel).map(|q| q.len()))
            .unwrap_or(0)
    }
}

/// One endpoint's view of a [`LoopbackNetwork`]
#[derive(Debug, Clone)]
pub struct LoopbackSubstrate {
    id: PeerId,
    nodes: Rc<RefCell<HashMap<PeerId, Node>>>,
}

impl LoopbackSubstrate {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl Substrate for LoopbackSubstrate {
    fn send_packet(&mut self, peer: PeerId, data: &[u8], mode: SendMode, channel: u8) -> bool {
        let mut nodes = self.nodes.borrow_mut();

        let peer_exists = nodes.contains_key(&peer);

        if let Some(me) = nodes.get_mut(&self.id) {
            if me.reject_sends {
                return false;
            }
            me.sent.push(SentPacket {
                to: peer,
                channel,
                mode,
                data: data.to_vec(),
            });
            me.sessions.insert(peer);

            if !peer_exists {
                me.events.push_back(SessionEvent::ConnectFailed {
                    peer,
                    error: SessionError::DestinationNotLoggedIn,
                });
                return true;
            }
        } else {
            return false;
        }

        if let Some(remote) = nodes.get_mut(&peer) {
            if remote.sessions.contains(&self.id) {
                remote.deliver(self.id, channel, data.to_vec());
            } else {
                remote
                    .pending
                    .entry(self.id)
                    .or_default()
                    .push((channel, data.to_vec()));
                if remote.requested.insert(self.id) {
                    remote
                        .events
                        .push_back(SessionEvent::SessionRequest { peer: self.id });
                }
            }
        }

        true
    }

    fn read_packet(&mut self, channel: u8) -> Option<(PeerId, Vec<u8>)> {
        self.nodes
            .borrow_mut()
            .get_mut(&self.id)
            .and_then(|n| n.queues.get_mut(&channel))
            .and_then(|q| q.pop_front())
    }

    fn accept_session(&mut self, peer: PeerId) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let Some(me) = nodes.get_mut(&self.id) else {
            return false;
        };

        me.sessions.insert(peer);
        me.requested.remove(&peer);
        if let Some(held) = me.pending.remove(&peer) {
            for (channel, data) in held {
                me.deliver(peer, channel, data);
            }
        }
        true
    }

    fn close_session(&mut self, peer: PeerId) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let Some(me) = nodes.get_mut(&self.id) else {
            return false;
        };

        let had_session = me.sessions.remove(&peer);
        me.requested.remove(&peer);
        me.pending.remove(&peer);
        me.closed.push(peer);
        had_session
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.nodes
            .borrow_mut()
            .get_mut(&self.id)
            .and_then(|n| n.events.pop_front())
    }
}
