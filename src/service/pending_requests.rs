//! The table of outstanding requests awaiting a response.
//!
//! Requests are indexed by destination `SocketAddr` rather than node id because a WHOAREYOU
//! response carries no source node id and can only be correlated by the address it arrives
//! from. Each entry owns an individual timeout which is cancelled when the entry is removed,
//! expired entries are handed back to the service for retransmission or failure reporting.

use crate::packet::Packet;
use crate::rpc::ProtocolMessage;
use enr::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request that was sent on the transport and awaits a response.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    /// The node the request was sent to.
    pub dst_id: NodeId,
    /// The packet that was sent, kept for retransmission.
    pub packet: Packet,
    /// The plaintext message, kept so it can be re-encrypted when a WHOAREYOU arrives.
    /// Handshake packets carry no message.
    pub message: Option<ProtocolMessage>,
    /// The number of times the packet has been transmitted.
    pub retries: u8,
}

impl PendingRequest {
    pub fn new(dst_id: NodeId, packet: Packet, message: Option<ProtocolMessage>) -> Self {
        PendingRequest {
            dst_id,
            packet,
            message,
            retries: 1,
        }
    }

    /// The request id, if the request carries a message.
    pub fn id(&self) -> Option<u64> {
        self.message.as_ref().map(|message| message.id)
    }
}

/// An entry of the table, pairing the request with its timer handle.
struct Entry {
    request: PendingRequest,
    delay_key: delay_queue::Key,
    seq: usize,
}

/// Identifies a single entry when its timer fires.
struct TimeoutIndex {
    dst: SocketAddr,
    seq: usize,
}

/// Outstanding requests with per-entry timeouts, keyed by destination address.
pub(crate) struct PendingRequests {
    /// Pending requests for each destination address.
    requests: HashMap<SocketAddr, Vec<Entry>>,
    /// Fires when a request times out.
    timeouts: DelayQueue<TimeoutIndex>,
    /// A sequence number disambiguating entries for the same address.
    next_seq: usize,
    /// The timeout applied to every entry.
    request_timeout: Duration,
}

impl PendingRequests {
    pub fn new(request_timeout: Duration) -> Self {
        PendingRequests {
            requests: HashMap::new(),
            timeouts: DelayQueue::new(),
            next_seq: 0,
            request_timeout,
        }
    }

    /// Inserts a request and arms its timeout.
    pub fn insert(&mut self, dst: SocketAddr, request: PendingRequest) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let delay_key = self
            .timeouts
            .insert(TimeoutIndex { dst, seq }, self.request_timeout);
        self.requests.entry(dst).or_default().push(Entry {
            request,
            delay_key,
            seq,
        });
    }

    /// Removes the first request at `dst` matching the filter, cancelling its timeout.
    pub fn remove<F>(&mut self, dst: &SocketAddr, mut filter: F) -> Option<PendingRequest>
    where
        F: FnMut(&PendingRequest) -> bool,
    {
        let entries = self.requests.get_mut(dst)?;
        let position = entries.iter().position(|entry| filter(&entry.request))?;
        let entry = entries.remove(position);
        self.timeouts.try_remove(&entry.delay_key);
        if entries.is_empty() {
            self.requests.remove(dst);
        }
        Some(entry.request)
    }

    /// True if any pending request matches the filter.
    pub fn exists<F>(&self, mut filter: F) -> bool
    where
        F: FnMut(&PendingRequest) -> bool,
    {
        self.requests
            .values()
            .any(|entries| entries.iter().any(|entry| filter(&entry.request)))
    }

    /// The total number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.values().map(|entries| entries.len()).sum()
    }

    /// Removes every entry and cancels all timers.
    pub fn clear(&mut self) {
        self.requests.clear();
        self.timeouts.clear();
    }

    /// Polls for the next expired request. Expired entries are removed from the table.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<(SocketAddr, PendingRequest)>> {
        loop {
            match self.timeouts.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let TimeoutIndex { dst, seq } = expired.into_inner();
                    if let Some(entries) = self.requests.get_mut(&dst) {
                        if let Some(position) = entries.iter().position(|entry| entry.seq == seq) {
                            let request = entries.remove(position).request;
                            if entries.is_empty() {
                                self.requests.remove(&dst);
                            }
                            return Poll::Ready(Some((dst, request)));
                        }
                    }
                    // the entry was removed before its timer could be cancelled
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
