//! A [`Session`] tracks the handshake and key state for a single remote node.
//!
//! Sessions are created in one of two ways. An outbound request to an unknown node sends a
//! random packet and leaves the session in [`SessionState::RandomSent`], awaiting the node's
//! WHOAREYOU challenge. An inbound packet from an unknown node triggers our own challenge and
//! leaves the session in [`SessionState::WhoAreYouSent`].
//!
//! Once keys are derived they remain unconfirmed ([`SessionState::AwaitingResponse`]) until a
//! packet decrypts under them, at which point the session is established. Separately from key
//! state, a session is only *trusted* while the remote's ENR advertises the socket address its
//! packets are observed to come from. Requests may only be sent on trusted established sessions.

pub(crate) mod crypto;

use crate::error::Error;
use crate::packet::{AuthHeader, AuthResponse, AuthTag, IdNonce, Packet, Tag};
use crate::Enr;
use enr::{CombinedKey, NodeId};
use std::net::SocketAddr;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) use crypto::KEY_LENGTH;

/// The directional session keys together with the key sealing the authentication response.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct Keys {
    pub auth_resp_key: [u8; KEY_LENGTH],
    pub encryption_key: [u8; KEY_LENGTH],
    pub decryption_key: [u8; KEY_LENGTH],
}

/// The handshake state of a session.
enum SessionState {
    /// A random packet has been sent, awaiting a WHOAREYOU challenge.
    RandomSent,
    /// A WHOAREYOU challenge has been sent, awaiting a packet with an authentication header.
    WhoAreYouSent,
    /// Keys have been derived and sent in an authentication header, but no packet has decrypted
    /// under them yet.
    AwaitingResponse(Keys),
    /// Keys are confirmed.
    Established(Keys),
    /// An intermediate state during key transitions. Observing it is a bug.
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrustedState {
    /// The ENR endpoint matches the observed source address.
    Trusted,
    /// The ENR endpoint is unknown or does not match the observed source address.
    Untrusted,
}

pub(crate) struct Session {
    /// The current handshake state.
    state: SessionState,
    /// The most recent ENR known for the remote node, if any.
    remote_enr: Option<Enr>,
    /// The source address of the last packet received from this node.
    last_seen_socket: Option<SocketAddr>,
    /// Whether the ENR endpoint matches `last_seen_socket`.
    trusted: TrustedState,
}

impl Session {
    /* Session generation */

    /// Creates a session for a node we are initiating contact with, along with the random packet
    /// to send.
    pub(crate) fn new_random(tag: Tag, remote_enr: Enr) -> (Self, Packet) {
        let session = Session {
            state: SessionState::RandomSent,
            remote_enr: Some(remote_enr),
            last_seen_socket: None,
            trusted: TrustedState::Untrusted,
        };
        (session, Packet::random(tag))
    }

    /// Creates a session for a node we are challenging, along with the WHOAREYOU packet to send.
    pub(crate) fn new_whoareyou(
        dst_id: &NodeId,
        enr_seq: u64,
        remote_enr: Option<Enr>,
        auth_tag: AuthTag,
    ) -> (Self, Packet) {
        let session = Session {
            state: SessionState::WhoAreYouSent,
            remote_enr,
            last_seen_socket: None,
            trusted: TrustedState::Untrusted,
        };
        (session, Packet::whoareyou(dst_id, enr_seq, auth_tag))
    }

    /* Handshake */

    /// Responds to a WHOAREYOU challenge. Generates fresh session keys and seals `message` into
    /// an authentication packet. The keys remain unconfirmed until a packet decrypts under them.
    /// On error the session state is left untouched.
    pub(crate) fn encrypt_with_header(
        &mut self,
        tag: Tag,
        local_key: &CombinedKey,
        updated_enr: Option<Enr>,
        local_id: &NodeId,
        id_nonce: &IdNonce,
        message: &[u8],
    ) -> Result<Packet, Error> {
        let remote_enr = self.remote_enr.as_ref().ok_or(Error::InvalidEnr)?;
        let (encryption_key, decryption_key, auth_resp_key, ephem_pubkey) =
            crypto::generate_session_keys(local_id, remote_enr, id_nonce)?;
        let keys = Keys {
            auth_resp_key,
            encryption_key,
            decryption_key,
        };

        let signature = crypto::sign_nonce(local_key, id_nonce, &ephem_pubkey)?;
        let auth_plaintext = AuthResponse::new(&signature, updated_enr).encode();
        let auth_response =
            crypto::encrypt_message(&keys.auth_resp_key, [0u8; 12], &auth_plaintext, &[])?;

        let auth_tag: AuthTag = rand::random();
        let auth_header = AuthHeader::new(auth_tag, *id_nonce, ephem_pubkey, auth_response);

        let message = crypto::encrypt_message(&keys.encryption_key, auth_tag, message, &tag)?;

        self.state = SessionState::AwaitingResponse(keys);

        Ok(Packet::AuthMessage {
            tag,
            auth_header,
            message,
        })
    }

    /// Establishes the session from a received authentication header. Verifies the signature of
    /// the id-nonce we challenged with under the remote's identity key. Returns whether the
    /// session is trusted.
    pub(crate) fn establish_from_header(
        &mut self,
        local_key: &CombinedKey,
        local_id: &NodeId,
        remote_id: &NodeId,
        id_nonce: &IdNonce,
        auth_header: &AuthHeader,
    ) -> Result<bool, Error> {
        let (decryption_key, encryption_key, auth_resp_key) = crypto::derive_keys_from_pubkey(
            local_key,
            local_id,
            remote_id,
            id_nonce,
            &auth_header.ephemeral_pubkey,
        )?;

        let auth_response = crypto::decrypt_authentication_header(&auth_resp_key, auth_header)?;

        // keep whichever ENR carries the highest sequence number
        match (auth_response.node_record, self.remote_enr.take()) {
            (Some(new_enr), Some(known_enr)) => {
                self.remote_enr = Some(if new_enr.seq() > known_enr.seq() {
                    new_enr
                } else {
                    known_enr
                });
            }
            (Some(new_enr), None) => self.remote_enr = Some(new_enr),
            (None, Some(known_enr)) => self.remote_enr = Some(known_enr),
            (None, None) => {
                debug!(node_id = %remote_id, "Node did not respond with an ENR");
                return Err(Error::InvalidEnr);
            }
        }

        let remote_public_key = self
            .remote_enr
            .as_ref()
            .ok_or(Error::InvalidEnr)?
            .public_key();

        if !crypto::verify_authentication_nonce(
            &remote_public_key,
            &auth_header.ephemeral_pubkey,
            id_nonce,
            &auth_response.signature,
        ) {
            return Err(Error::InvalidSignature);
        }

        self.state = SessionState::Established(Keys {
            auth_resp_key,
            encryption_key,
            decryption_key,
        });

        Ok(self.update_trusted())
    }

    /* Sealing */

    /// Encrypts a message with the confirmed session keys.
    pub(crate) fn encrypt_message(&self, tag: Tag, message: &[u8]) -> Result<Packet, Error> {
        let keys = match &self.state {
            SessionState::Established(keys) => keys,
            _ => return Err(Error::SessionNotReady),
        };

        let auth_tag: AuthTag = rand::random();
        let message = crypto::encrypt_message(&keys.encryption_key, auth_tag, message, &tag)?;
        Ok(Packet::Message {
            tag,
            auth_tag,
            message,
        })
    }

    /// Decrypts a message with the session keys. A successful decrypt with unconfirmed keys
    /// confirms them and establishes the session.
    pub(crate) fn decrypt_message(
        &mut self,
        nonce: AuthTag,
        message: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match std::mem::replace(&mut self.state, SessionState::Poisoned) {
            SessionState::Established(keys) => {
                let result = crypto::decrypt_message(&keys.decryption_key, nonce, message, aad);
                self.state = SessionState::Established(keys);
                result
            }
            SessionState::AwaitingResponse(keys) => {
                match crypto::decrypt_message(&keys.decryption_key, nonce, message, aad) {
                    Ok(plaintext) => {
                        self.state = SessionState::Established(keys);
                        Ok(plaintext)
                    }
                    Err(e) => {
                        self.state = SessionState::AwaitingResponse(keys);
                        Err(e)
                    }
                }
            }
            SessionState::Poisoned => unreachable!("session state poisoned"),
            handshake_state => {
                // no keys have been negotiated yet
                self.state = handshake_state;
                Err(Error::SessionNotReady)
            }
        }
    }

    /* State management */

    /// Updates the remote ENR if the given record is newer. Returns true if the session got
    /// promoted to trusted by the update.
    pub(crate) fn update_enr(&mut self, enr: Enr) -> bool {
        if let Some(remote_enr) = &self.remote_enr {
            if remote_enr.seq() < enr.seq() {
                self.remote_enr = Some(enr);
                return self.update_trusted();
            }
        }
        false
    }

    /// Re-evaluates the trusted state against the last seen socket address. A session can be
    /// promoted as well as demoted. Returns true on promotion.
    pub(crate) fn update_trusted(&mut self) -> bool {
        match self.trusted {
            TrustedState::Untrusted => {
                if self.socket_matches_enr() {
                    self.trusted = TrustedState::Trusted;
                    return true;
                }
            }
            TrustedState::Trusted => {
                if !self.socket_matches_enr() {
                    self.trusted = TrustedState::Untrusted;
                }
            }
        }
        false
    }

    fn socket_matches_enr(&self) -> bool {
        match (&self.remote_enr, &self.last_seen_socket) {
            (Some(enr), Some(socket)) => {
                enr.udp4_socket().map(SocketAddr::V4).as_ref() == Some(socket)
            }
            _ => false,
        }
    }

    /// Records the source address of the last packet received from this node.
    pub(crate) fn set_last_seen_socket(&mut self, socket: SocketAddr) {
        self.last_seen_socket = Some(socket);
    }

    pub(crate) fn remote_enr(&self) -> Option<&Enr> {
        self.remote_enr.as_ref()
    }

    pub(crate) fn is_random_sent(&self) -> bool {
        matches!(self.state, SessionState::RandomSent)
    }

    pub(crate) fn is_whoareyou_sent(&self) -> bool {
        matches!(self.state, SessionState::WhoAreYouSent)
    }

    pub(crate) fn is_awaiting_response(&self) -> bool {
        matches!(self.state, SessionState::AwaitingResponse(_))
    }

    pub(crate) fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established(_))
    }

    pub(crate) fn is_trusted(&self) -> bool {
        matches!(self.trusted, TrustedState::Trusted)
    }

    /// True if the session has confirmed keys and the node's address matches its ENR. Only such
    /// sessions may carry requests.
    pub(crate) fn trusted_established(&self) -> bool {
        self.is_trusted() && self.is_established()
    }

    #[cfg(test)]
    pub(crate) fn new_established(remote_enr: Option<Enr>, keys: Keys) -> Self {
        Session {
            state: SessionState::Established(keys),
            remote_enr,
            last_seen_socket: None,
            trusted: TrustedState::Untrusted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::EnrBuilder;
    use std::net::Ipv4Addr;

    fn random_keys() -> Keys {
        Keys {
            auth_resp_key: rand::random(),
            encryption_key: rand::random(),
            decryption_key: rand::random(),
        }
    }

    fn enr_with_udp(port: u16) -> Enr {
        let key = CombinedKey::generate_secp256k1();
        EnrBuilder::new("v4")
            .ip4(Ipv4Addr::LOCALHOST)
            .udp4(port)
            .build(&key)
            .unwrap()
    }

    #[test]
    fn trust_follows_the_observed_address() {
        let mut session = Session::new_established(Some(enr_with_udp(9000)), random_keys());
        assert!(!session.is_trusted());
        assert!(!session.trusted_established());

        // a packet from the advertised endpoint promotes the session
        session.set_last_seen_socket("127.0.0.1:9000".parse().unwrap());
        assert!(session.update_trusted());
        assert!(session.trusted_established());

        // promotion is only reported once
        assert!(!session.update_trusted());

        // a packet from elsewhere demotes it again
        session.set_last_seen_socket("127.0.0.1:9001".parse().unwrap());
        assert!(!session.update_trusted());
        assert!(!session.is_trusted());
    }

    #[test]
    fn decrypt_confirms_unconfirmed_keys() {
        let encryption_key: [u8; KEY_LENGTH] = rand::random();
        let decryption_key: [u8; KEY_LENGTH] = rand::random();

        let sender = Session::new_established(
            None,
            Keys {
                auth_resp_key: rand::random(),
                encryption_key,
                decryption_key: rand::random(),
            },
        );
        let mut receiver = Session {
            state: SessionState::AwaitingResponse(Keys {
                auth_resp_key: rand::random(),
                encryption_key: decryption_key,
                decryption_key: encryption_key,
            }),
            remote_enr: None,
            last_seen_socket: None,
            trusted: TrustedState::Untrusted,
        };

        let tag: Tag = rand::random();
        let packet = sender.encrypt_message(tag, b"hello").unwrap();
        let (auth_tag, message) = match packet {
            Packet::Message {
                auth_tag, message, ..
            } => (auth_tag, message),
            _ => unreachable!(),
        };

        let plaintext = receiver.decrypt_message(auth_tag, &message, &tag).unwrap();
        assert_eq!(plaintext, b"hello".to_vec());
        assert!(receiver.is_established());
    }

    #[test]
    fn decrypt_failure_keeps_unconfirmed_keys() {
        let mut session = Session {
            state: SessionState::AwaitingResponse(random_keys()),
            remote_enr: None,
            last_seen_socket: None,
            trusted: TrustedState::Untrusted,
        };

        let tag: Tag = rand::random();
        assert!(session
            .decrypt_message(rand::random(), &[0u8; 32], &tag)
            .is_err());
        assert!(session.is_awaiting_response());
    }

    #[test]
    fn encrypt_requires_confirmed_keys() {
        let (session, _packet) = Session::new_random(rand::random(), enr_with_udp(9000));
        assert!(matches!(
            session.encrypt_message(rand::random(), b"hello"),
            Err(Error::SessionNotReady)
        ));
    }
}
