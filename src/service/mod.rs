//! Session management for the discovery node.
//!
//! The [`SessionService`] is responsible for establishing and maintaining sessions with
//! connected and discovered nodes. Each node, identified by its [`NodeId`], is associated with a
//! `Session`. The service drives the handshakes that establish those sessions and the logic for
//! contacting unknown nodes.
//!
//! The service also manages the timeouts of every outstanding request, retransmits unanswered
//! packets and reports RPC failures, and it buffers outbound requests until a session is ready
//! to carry them. Messages are encrypted and decrypted with the keys of the session they belong
//! to.
//!
//! A node that provides an ENR with an IP address and port that does not match the address its
//! packets arrive from is considered untrusted. Once the advertised endpoint matches the
//! observed source address the session is promoted and an [`SessionEvent::Established`] event is
//! emitted. RPC requests are not sent on untrusted sessions, only responses.
//!
//! The service is a single-threaded reactor. It implements [`Stream`] and every state
//! transition, timer and packet is processed while the owning task polls it.

use crate::config::Config;
use crate::error::Error;
use crate::packet::{self, AuthHeader, AuthTag, IdNonce, Packet, Tag};
use crate::rpc::ProtocolMessage;
use crate::session::Session;
use crate::transport::Transport;
use crate::Enr;
use enr::{CombinedKey, EnrKey, NodeId};
use fnv::FnvHashMap;
use futures::Stream;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, trace, warn};

mod pending_requests;
mod session_store;
mod tests;

use pending_requests::{PendingRequest, PendingRequests};
use session_store::SessionStore;

/// The events emitted by the session service for the protocol layer above.
#[derive(Debug)]
pub enum SessionEvent {
    /// A trusted session has been established or promoted with this node.
    Established(Enr),

    /// A message was decoded on an inbound packet.
    Message {
        src_id: NodeId,
        src: SocketAddr,
        message: Box<ProtocolMessage>,
    },

    /// An unknown node must be challenged. The protocol layer looks up the highest known ENR
    /// sequence number for the node and calls [`SessionService::send_whoareyou`].
    WhoAreYouRequest {
        src: SocketAddr,
        src_id: NodeId,
        auth_tag: AuthTag,
    },

    /// A request could not be completed. Either its retries were exhausted or the handshake it
    /// was queued behind was abandoned. Carries the node id and the request id.
    RequestFailed(NodeId, u64),
}

/// The session core of a discovery node.
pub struct SessionService<T: Transport> {
    /// Events ready to be returned to the protocol layer.
    events: VecDeque<SessionEvent>,

    /// Configuration parameters.
    config: Config,

    /// The local ENR.
    enr: Enr,

    /// The local keypair. Signs WHOAREYOU id-nonces and derives session keys.
    key: CombinedKey,

    /// Requests awaiting a response, keyed by destination address. WHOAREYOU responses carry no
    /// source node id and are correlated by address.
    pending_requests: PendingRequests,

    /// Requests queued per node until a trusted session can carry them, in submission order.
    pending_messages: FnvHashMap<NodeId, VecDeque<ProtocolMessage>>,

    /// The sessions for each contacted node.
    sessions: SessionStore,

    /// The datagram transport.
    transport: T,
}

impl<T: Transport> SessionService<T> {
    /* Public functions */

    /// Creates a new session service. Fails if the keypair does not match the public key of the
    /// given ENR.
    pub fn new(enr: Enr, key: CombinedKey, transport: T, config: Config) -> Result<Self, Error> {
        if enr.public_key() != key.public() {
            return Err(Error::InvalidEnr);
        }

        Ok(SessionService {
            events: VecDeque::new(),
            enr,
            key,
            pending_requests: PendingRequests::new(config.request_timeout),
            pending_messages: FnvHashMap::default(),
            sessions: SessionStore::new(config.session_establish_timeout),
            transport,
            config,
        })
    }

    /// The local ENR of the service.
    pub fn enr(&self) -> &Enr {
        &self.enr
    }

    /// Updates the cached ENR of a node if the given record is newer. A session promoted to
    /// trusted by the update emits [`SessionEvent::Established`].
    pub fn update_enr(&mut self, enr: Enr) {
        if let Some(session) = self.sessions.get_mut(&enr.node_id()) {
            if session.update_enr(enr.clone()) {
                self.events.push_back(SessionEvent::Established(enr));
            }
        }
    }

    /// Sends a request to a node with a known ENR.
    ///
    /// If no session exists the message is queued and a handshake is initiated with a random
    /// packet. While a handshake is in flight further requests are queued behind it and flushed
    /// in order once the session is trusted. Requests to an established but untrusted node fail
    /// with [`Error::UntrustedPeer`].
    pub fn send_request(&mut self, dst_enr: &Enr, message: ProtocolMessage) -> Result<(), Error> {
        let dst_id = dst_enr.node_id();
        let dst = dst_enr
            .udp4_socket()
            .map(SocketAddr::V4)
            .ok_or_else(|| {
                warn!(node_id = %dst_id, "Request failed, the ENR has no IP and UDP port");
                Error::InvalidEnr
            })?;

        match self.sessions.get(&dst_id) {
            None => {
                debug!(node_id = %dst_id, "No session established, sending a random packet");
                self.pending_messages
                    .entry(dst_id.clone())
                    .or_default()
                    .push_back(message);
                let (session, packet) = Session::new_random(self.tag(&dst_id), dst_enr.clone());
                self.sessions.insert(dst_id.clone(), session);
                self.process_request(dst, dst_id, packet, None);
                Ok(())
            }
            Some(session) if !session.is_established() => {
                // a handshake is already in flight, queue behind it
                debug!(node_id = %dst_id, "Session being established, queueing the request");
                self.pending_messages
                    .entry(dst_id)
                    .or_default()
                    .push_back(message);
                Ok(())
            }
            Some(session) if !session.is_trusted() => {
                debug!(node_id = %dst_id, "Tried to send a request to an untrusted node, ignoring");
                Err(Error::UntrustedPeer)
            }
            Some(session) => {
                let packet = session
                    .encrypt_message(self.tag(&dst_id), &message.clone().encode())
                    .map_err(|e| {
                        error!(error = ?e, "Failed to encrypt message");
                        e
                    })?;
                self.process_request(dst, dst_id, packet, Some(message));
                Ok(())
            }
        }
    }

    /// Sends a request to a node whose ENR is unknown. A session must already exist, typically
    /// this is used to request an up-to-date ENR from an endpoint that answered us.
    pub fn send_request_unknown_enr(
        &mut self,
        dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), Error> {
        let session = self.sessions.get(dst_id).ok_or_else(|| {
            warn!("Request without an ENR could not be sent, no session exists");
            Error::SessionNotReady
        })?;

        let packet = session
            .encrypt_message(self.tag(dst_id), &message.clone().encode())
            .map_err(|e| {
                error!(error = ?e, "Failed to encrypt message");
                e
            })?;

        self.process_request(dst, dst_id.clone(), packet, Some(message));
        Ok(())
    }

    /// Sends a response on an established session. Responses are not tracked for retransmission
    /// and may be sent on untrusted sessions.
    pub fn send_response(
        &mut self,
        dst: SocketAddr,
        dst_id: &NodeId,
        message: ProtocolMessage,
    ) -> Result<(), Error> {
        let session = self.sessions.get(dst_id).ok_or_else(|| {
            warn!("Response could not be sent, no session exists");
            Error::SessionNotReady
        })?;

        let packet = session
            .encrypt_message(self.tag(dst_id), &message.encode())
            .map_err(|e| {
                error!(error = ?e, "Failed to encrypt response");
                e
            })?;

        self.transport.send(dst, packet);
        Ok(())
    }

    /// Sends a WHOAREYOU challenge to a node, called in response to a
    /// [`SessionEvent::WhoAreYouRequest`]. If a trusted session exists or a challenge is already
    /// in flight the call is a no-op.
    pub fn send_whoareyou(
        &mut self,
        dst: SocketAddr,
        node_id: &NodeId,
        enr_seq: u64,
        remote_enr: Option<Enr>,
        auth_tag: AuthTag,
    ) {
        let mut remote_enr = remote_enr;
        if let Some(previous_session) = self.sessions.get(node_id) {
            if previous_session.trusted_established() || previous_session.is_whoareyou_sent() {
                warn!("Session exists, WHOAREYOU packet not sent");
                return;
            }
            // a previous half-session may know the ENR even if the caller does not
            if remote_enr.is_none() {
                remote_enr = previous_session.remote_enr().cloned();
            }
        }

        debug!(node_id = %node_id, "Sending WHOAREYOU packet");
        let (session, packet) = Session::new_whoareyou(node_id, enr_seq, remote_enr, auth_tag);
        self.sessions.insert(node_id.clone(), session);
        self.process_request(dst, node_id.clone(), packet, None);
    }

    /// Clears every session, pending request and queued message. No event is emitted after this
    /// returns.
    pub fn stop(&mut self) {
        self.pending_requests.clear();
        self.pending_messages.clear();
        self.sessions.clear();
        self.events.clear();
    }

    /* Internal helpers */

    /// The tag placed on packets we send to `dst_id`.
    fn tag(&self, dst_id: &NodeId) -> Tag {
        packet::tag(&self.enr.node_id(), dst_id)
    }

    /// Recovers the sender of an inbound packet from its tag.
    fn src_id(&self, tag: &Tag) -> NodeId {
        packet::src_id(&self.enr.node_id(), tag)
    }

    /* Packet handling */

    fn handle_packet(&mut self, src: SocketAddr, packet: Packet) {
        match packet {
            Packet::WhoAreYou {
                token,
                id_nonce,
                enr_seq,
                ..
            } => self.handle_whoareyou(src, token, id_nonce, enr_seq),
            Packet::AuthMessage {
                tag,
                auth_header,
                message,
            } => self.handle_auth_message(src, tag, auth_header, &message),
            Packet::Message {
                tag,
                auth_tag,
                message,
            } => {
                let src_id = self.src_id(&tag);
                self.handle_message(src, src_id, auth_tag, &message, tag);
            }
            // random packets are indistinguishable from messages on the wire and never decode
            // to this variant
            Packet::Random { .. } => {}
        }
    }

    /// Handles a WHOAREYOU challenge. The challenge must reference a request we have in flight
    /// to the source address, anything else is stale or adversarial and is dropped.
    fn handle_whoareyou(
        &mut self,
        src: SocketAddr,
        token: AuthTag,
        id_nonce: IdNonce,
        enr_seq: u64,
    ) {
        let request = match self
            .pending_requests
            .remove(&src, |request| request.packet.auth_tag() == Some(&token))
        {
            Some(request) => request,
            None => {
                debug!(
                    %src,
                    token = %hex::encode(token),
                    "WHOAREYOU packet references an unknown or expired request"
                );
                return;
            }
        };

        debug!(%src, "Received a WHOAREYOU packet");

        // We sent the referenced request to this node id. The id cannot be verified beyond the
        // originating address, so it is assumed.
        let src_id = request.dst_id.clone();
        let tag = self.tag(&src_id);
        let local_id = self.enr.node_id();

        let session = match self.sessions.get_mut(&src_id) {
            Some(session) => session,
            None => {
                warn!("Received a WHOAREYOU packet without an associated session");
                return;
            }
        };

        // Two nodes challenging each other at once cannot both answer, drop ours.
        if session.is_whoareyou_sent() {
            error!(%src, node_id = %src_id, "Received a WHOAREYOU whilst challenging the same node");
            return;
        }

        // Determine which message the handshake will carry. A WHOAREYOU either answers the
        // random packet of a new handshake, or a message the remote could no longer decrypt
        // after dropping its session state.
        let message = match request.packet {
            Packet::Random { .. } => {
                match self.pending_messages.get_mut(&src_id) {
                    Some(messages) => match messages.pop_front() {
                        Some(message) => message,
                        None => {
                            // another node at the same address may have answered our random
                            // packet, leave the session to expire
                            debug!("No pending messages found for WHOAREYOU request");
                            return;
                        }
                    },
                    None => {
                        debug!("No pending messages found for WHOAREYOU request");
                        return;
                    }
                }
            }
            Packet::WhoAreYou { .. } => {
                warn!("A WHOAREYOU packet was received in response to a WHOAREYOU, dropping");
                return;
            }
            _ => match request.message {
                Some(message) => message,
                None => {
                    warn!("A WHOAREYOU references a non-handshake request without a message, dropping");
                    return;
                }
            },
        };

        // this is the socket we sent the referenced request to
        session.set_last_seen_socket(src);

        // attach our ENR if the challenger's copy is outdated
        let updated_enr = if enr_seq < self.enr.seq() {
            Some(self.enr.clone())
        } else {
            None
        };

        let auth_packet = match session.encrypt_with_header(
            tag,
            &self.key,
            updated_enr,
            &local_id,
            &id_nonce,
            &message.clone().encode(),
        ) {
            Ok(packet) => packet,
            Err(e) => {
                // the message is placed back at the front of the queue for the next attempt
                self.pending_messages
                    .entry(src_id)
                    .or_default()
                    .push_front(message);
                error!(error = ?e, "Could not generate a session from a WHOAREYOU challenge");
                return;
            }
        };

        debug!(node_id = %src_id, "Sending authentication message");
        self.process_request(src, src_id.clone(), auth_packet, Some(message));

        // anything further queued can only flow once the session is confirmed
        self.flush_messages(src, &src_id);
    }

    /// Handles a packet carrying an authentication header. The header must answer a WHOAREYOU we
    /// have in flight to this node, otherwise the packet is dropped.
    fn handle_auth_message(
        &mut self,
        src: SocketAddr,
        tag: Tag,
        auth_header: AuthHeader,
        message: &[u8],
    ) {
        let src_id = self.src_id(&tag);
        let local_id = self.enr.node_id();
        debug!(node_id = %src_id, "Received an authentication message");

        match self.sessions.get(&src_id) {
            Some(session) if session.is_whoareyou_sent() => {}
            Some(_) => {
                warn!("Received an authentication message without a WHOAREYOU in flight, dropping");
                return;
            }
            None => {
                warn!("Received an authentication message without a known session, dropping");
                return;
            }
        }

        let request = match self.pending_requests.remove(&src, |request| {
            request.packet.is_whoareyou() && request.dst_id == src_id
        }) {
            Some(request) => request,
            None => {
                warn!("Received an authentication message without a matching WHOAREYOU request");
                return;
            }
        };

        // the id-nonce the remote signed is the one stored in the challenge we sent
        let id_nonce = match request.packet {
            Packet::WhoAreYou { id_nonce, .. } => id_nonce,
            _ => return,
        };

        let session = match self.sessions.get_mut(&src_id) {
            Some(session) => session,
            None => return,
        };
        session.set_last_seen_socket(src);

        match session.establish_from_header(&self.key, &local_id, &src_id, &id_nonce, &auth_header)
        {
            Ok(true) => {
                trace!(node_id = %src_id, "Session established");
                if let Some(enr) = session.remote_enr().cloned() {
                    self.events.push_back(SessionEvent::Established(enr));
                }
                self.flush_messages(src, &src_id);
            }
            // the session is established but untrusted, the protocol is not notified
            Ok(false) => {}
            Err(e) => {
                warn!(error = ?e, "Invalid authentication header, dropping session");
                self.sessions.remove(&src_id);
                self.pending_messages.remove(&src_id);
                return;
            }
        }

        // the handshake completed, move the session to its full lifetime
        self.sessions
            .update_timeout(&src_id, self.config.session_timeout);

        // the embedded message completes processing as a standard message
        self.handle_message(src, src_id, auth_header.auth_tag, message, tag);
    }

    /// Handles a standard message packet.
    fn handle_message(
        &mut self,
        src: SocketAddr,
        src_id: NodeId,
        auth_tag: AuthTag,
        message: &[u8],
        tag: Tag,
    ) {
        let session = match self.sessions.get_mut(&src_id) {
            Some(session) => session,
            None => {
                // no session, challenge the node to establish one
                debug!(%src, node_id = %src_id, "Received a message without a session");
                self.events.push_back(SessionEvent::WhoAreYouRequest {
                    src,
                    src_id,
                    auth_tag,
                });
                return;
            }
        };

        if session.is_random_sent() {
            // We initiated a handshake but the remote wrote to us first. It holds no session for
            // us either, so drop our random packet and challenge it instead.
            debug!(%src, node_id = %src_id, "Message received for a non-established session, upgrading to a challenge");
            if self
                .pending_requests
                .remove(&src, |request| request.packet.is_random())
                .is_none()
            {
                warn!(%src, node_id = %src_id, "No random packet pending for the session");
            }
            self.events.push_back(SessionEvent::WhoAreYouRequest {
                src,
                src_id,
                auth_tag,
            });
            return;
        } else if session.is_whoareyou_sent() {
            // the handshake is incomplete, nothing can be decrypted yet
            debug!("Waiting for a session to be generated, dropping the message");
            return;
        }

        // A decrypt under unconfirmed keys establishes the session. Remember whether this packet
        // could be the one doing so.
        let was_awaiting = session.is_awaiting_response();

        let message = match session.decrypt_message(auth_tag, message, &tag) {
            Ok(plaintext) => match ProtocolMessage::decode(&plaintext) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = ?e, "Failed to decode message");
                    return;
                }
            },
            Err(_) => {
                // The message is not encrypted with the keys we hold, the node has most likely
                // dropped its session. Drop ours and re-handshake.
                debug!(node_id = %src_id, "Message not encrypted with known session keys, requesting a WHOAREYOU");
                self.sessions.remove(&src_id);
                self.events.push_back(SessionEvent::WhoAreYouRequest {
                    src,
                    src_id,
                    auth_tag,
                });
                return;
            }
        };

        // correlate responses with their pending request
        if self
            .pending_requests
            .remove(&src, |request| request.id() == Some(message.id))
            .is_some()
        {
            trace!(id = message.id, "Removing pending request");
        }

        trace!(node_id = %src_id, id = message.id, "Message received");
        self.events.push_back(SessionEvent::Message {
            src_id: src_id.clone(),
            src,
            message: Box::new(message),
        });

        // The session may have become trusted-established with this packet. Either the observed
        // address now matches the ENR, or unconfirmed keys were just confirmed. Both notify the
        // protocol and flush the queue.
        if let Some(session) = self.sessions.get_mut(&src_id) {
            session.set_last_seen_socket(src);
            let promoted = session.update_trusted();
            let trusted_established = session.trusted_established();
            let remote_enr = session.remote_enr().cloned();
            if (promoted && trusted_established) || (trusted_established && was_awaiting) {
                trace!(node_id = %src_id, "Session has been promoted to established");
                if let Some(enr) = remote_enr {
                    self.events.push_back(SessionEvent::Established(enr));
                }
                self.flush_messages(src, &src_id);
            }
        }
    }

    /// Encrypts and sends the messages queued for a node, provided its session is trusted and
    /// established.
    fn flush_messages(&mut self, dst: SocketAddr, dst_id: &NodeId) {
        let tag = self.tag(dst_id);
        let mut packets = Vec::new();
        let mut failed = Vec::new();
        {
            let session = match self.sessions.get(dst_id) {
                Some(session) if session.trusted_established() => session,
                _ => return,
            };

            let messages = match self.pending_messages.remove(dst_id) {
                Some(messages) => messages,
                None => return,
            };

            for message in messages {
                match session.encrypt_message(tag, &message.clone().encode()) {
                    Ok(packet) => packets.push((packet, message)),
                    Err(e) => {
                        warn!(error = ?e, "Failed to encrypt a queued message");
                        failed.push(message.id);
                    }
                }
            }
        }

        for id in failed {
            self.events
                .push_back(SessionEvent::RequestFailed(dst_id.clone(), id));
        }
        for (packet, message) in packets {
            debug!(node_id = %dst_id, "Sending queued message");
            self.process_request(dst, dst_id.clone(), packet, Some(message));
        }
    }

    /// Sends a packet on the transport and tracks it for retransmission.
    fn process_request(
        &mut self,
        dst: SocketAddr,
        dst_id: NodeId,
        packet: Packet,
        message: Option<ProtocolMessage>,
    ) {
        let request = PendingRequest::new(dst_id, packet, message);
        self.transport.send(dst, request.packet.clone());
        self.pending_requests.insert(dst, request);
    }

    /* Timeouts */

    /// Called when a pending request spends its timeout unanswered. The packet is retransmitted
    /// until its transmissions are exhausted, after which the request has failed. A failed
    /// handshake packet abandons the session and everything queued behind it.
    fn handle_request_timeout(&mut self, dst: SocketAddr, mut request: PendingRequest) {
        let node_id = request.dst_id.clone();
        if request.retries >= self.config.request_retries {
            match request.packet {
                Packet::Random { .. } | Packet::WhoAreYou { .. } => {
                    debug!(node_id = %node_id, "Session could not be established, node unreachable");
                    self.fail_pending_messages(&node_id);
                    self.sessions.remove(&node_id);
                }
                Packet::AuthMessage { .. } | Packet::Message { .. } => {
                    debug!(node_id = %node_id, "Request timed out");
                    if let Some(id) = request.id() {
                        self.events.push_back(SessionEvent::RequestFailed(node_id, id));
                    }
                }
            }
        } else {
            debug!(node_id = %node_id, retry = request.retries, "Resending packet");
            self.transport.send(dst, request.packet.clone());
            request.retries += 1;
            self.pending_requests.insert(dst, request);
        }
    }

    /// Called when a session reaches its expiry. A session with requests still in flight is kept
    /// for another request window, an idle one is dropped along with its queued messages.
    fn handle_session_expiry(&mut self, node_id: NodeId, session: Session) {
        if self
            .pending_requests
            .exists(|request| request.dst_id == node_id)
        {
            self.sessions
                .insert_at(node_id, session, self.config.request_timeout);
        } else {
            debug!(node_id = %node_id, "Session timed out");
            self.fail_pending_messages(&node_id);
        }
    }

    /// Reports every message queued for a node as failed.
    fn fail_pending_messages(&mut self, node_id: &NodeId) {
        if let Some(messages) = self.pending_messages.remove(node_id) {
            for message in messages {
                self.events
                    .push_back(SessionEvent::RequestFailed(node_id.clone(), message.id));
            }
        }
    }
}

impl<T: Transport> Stream for SessionService<T> {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            // return any event produced by a previous iteration
            if let Some(event) = this.events.pop_front() {
                return Poll::Ready(Some(event));
            }

            match this.transport.poll_packet(cx) {
                Poll::Ready((src, packet)) => {
                    this.handle_packet(src, packet);
                    continue;
                }
                Poll::Pending => {}
            }

            match this.pending_requests.poll_expired(cx) {
                Poll::Ready(Some((dst, request))) => {
                    this.handle_request_timeout(dst, request);
                    continue;
                }
                Poll::Ready(None) | Poll::Pending => {}
            }

            match this.sessions.poll_expired(cx) {
                Poll::Ready(Some((node_id, session))) => {
                    this.handle_session_expiry(node_id, session);
                    continue;
                }
                Poll::Ready(None) | Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}
