//! The store of per-node sessions with individual expiry.
//!
//! Sessions are inserted with the establishment timeout and moved to the full session lifetime
//! once the handshake completes. Expired sessions are handed back to the service, which may
//! re-insert them with a shortened timeout while requests are still outstanding.

use crate::session::Session;
use enr::NodeId;
use fnv::FnvHashMap;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::time::delay_queue::{self, DelayQueue};

pub(crate) struct SessionStore {
    /// The sessions for each node, paired with their expiry timer handle.
    sessions: FnvHashMap<NodeId, (Session, delay_queue::Key)>,
    /// Fires when a session expires.
    expirations: DelayQueue<NodeId>,
    /// The timeout applied to sessions that have not completed their handshake.
    establish_timeout: Duration,
}

impl SessionStore {
    pub fn new(establish_timeout: Duration) -> Self {
        SessionStore {
            sessions: FnvHashMap::default(),
            expirations: DelayQueue::new(),
            establish_timeout,
        }
    }

    /// Inserts a session with the establishment timeout.
    pub fn insert(&mut self, node_id: NodeId, session: Session) {
        self.insert_at(node_id, session, self.establish_timeout);
    }

    /// Inserts a session with an explicit timeout. An existing session for the node is replaced
    /// and its timer cancelled.
    pub fn insert_at(&mut self, node_id: NodeId, session: Session, timeout: Duration) {
        let delay_key = self.expirations.insert(node_id.clone(), timeout);
        if let Some((_, old_key)) = self.sessions.insert(node_id, (session, delay_key)) {
            self.expirations.try_remove(&old_key);
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&Session> {
        self.sessions.get(node_id).map(|(session, _)| session)
    }

    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut Session> {
        self.sessions.get_mut(node_id).map(|(session, _)| session)
    }

    /// Re-arms the session's expiry with a new timeout.
    pub fn update_timeout(&mut self, node_id: &NodeId, timeout: Duration) {
        if let Some((_, delay_key)) = self.sessions.get(node_id) {
            self.expirations.reset(delay_key, timeout);
        }
    }

    /// Removes the session and cancels its timer.
    pub fn remove(&mut self, node_id: &NodeId) {
        if let Some((_, delay_key)) = self.sessions.remove(node_id) {
            self.expirations.try_remove(&delay_key);
        }
    }

    /// Removes every session and cancels all timers.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.expirations.clear();
    }

    /// Polls for the next expired session. Expired sessions are removed from the store.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<(NodeId, Session)>> {
        loop {
            match self.expirations.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let node_id = expired.into_inner();
                    if let Some((session, _)) = self.sessions.remove(&node_id) {
                        return Poll::Ready(Some((node_id, session)));
                    }
                    // the session was replaced before its timer could be cancelled
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
