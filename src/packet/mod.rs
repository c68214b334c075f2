//! The raw UDP packets of the discovery protocol.
//!
//! A [`Packet`] defines all raw packet variants together with their wire encoding and decoding.
//! Message encryption and decryption happen outside of this module, the `message` fields here
//! always carry ciphertext.
//!
//! A standard message packet and a random packet share the same wire shape. An unsolicited random
//! packet is deliberately indistinguishable from a message encrypted under unknown keys, both
//! make the recipient issue a WHOAREYOU challenge. Inbound datagrams therefore never decode to
//! [`Packet::Random`], that variant is only constructed locally.

mod auth_header;

pub use auth_header::{AuthHeader, AuthResponse};

use crate::error::PacketError;
use enr::NodeId;
use rlp::{Rlp, RlpStream};
use sha2::{Digest, Sha256};

/// The length of the packet tag.
pub const TAG_LENGTH: usize = 32;
/// The length of the per-packet authentication nonce.
pub const AUTH_TAG_LENGTH: usize = 12;
/// The length of the WHOAREYOU id-nonce.
pub const ID_NONCE_LENGTH: usize = 32;
/// The length of the WHOAREYOU magic prefix.
pub const MAGIC_LENGTH: usize = 32;
/// Discovery packets must fit in a single datagram.
pub const MAX_PACKET_SIZE: usize = 1280;

/// The amount of random data carried by a random packet.
const RANDOM_DATA_LENGTH: usize = 44;
const WHOAREYOU_STRING: &str = "WHOAREYOU";

/// The tag binding a packet to its (sender, receiver) pair.
pub type Tag = [u8; TAG_LENGTH];
/// The per-packet nonce, also the correlator a WHOAREYOU challenges.
pub type AuthTag = [u8; AUTH_TAG_LENGTH];
/// The challenge value of a WHOAREYOU packet, signed by the responder.
pub type IdNonce = [u8; ID_NONCE_LENGTH];
/// The fixed prefix identifying WHOAREYOU packets addressed to a node.
pub type Magic = [u8; MAGIC_LENGTH];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// An unsolicited packet of random data, sent to provoke a WHOAREYOU challenge from a node
    /// we have no session with.
    Random {
        /// XOR(SHA256(dest-node-id), src-node-id).
        tag: Tag,
        /// A random nonce. The WHOAREYOU response references this value.
        auth_tag: AuthTag,
        /// Random filler data.
        data: Vec<u8>,
    },
    /// The handshake challenge.
    WhoAreYou {
        /// SHA256(dest-node-id || "WHOAREYOU").
        magic: Magic,
        /// The auth-tag of the packet being challenged.
        token: AuthTag,
        /// The challenge to be signed by the recipient.
        id_nonce: IdNonce,
        /// The highest ENR sequence number known for the recipient.
        enr_seq: u64,
    },
    /// A message carrying an authentication header, completing the handshake.
    AuthMessage {
        /// XOR(SHA256(dest-node-id), src-node-id).
        tag: Tag,
        /// The authentication header.
        auth_header: AuthHeader,
        /// The encrypted message.
        message: Vec<u8>,
    },
    /// A standard encrypted message.
    Message {
        /// XOR(SHA256(dest-node-id), src-node-id).
        tag: Tag,
        /// The nonce used to encrypt the message.
        auth_tag: AuthTag,
        /// The encrypted message.
        message: Vec<u8>,
    },
}

impl Packet {
    /// Generates a random packet for the given tag.
    pub fn random(tag: Tag) -> Packet {
        let data: Vec<u8> = (0..RANDOM_DATA_LENGTH).map(|_| rand::random::<u8>()).collect();
        Packet::Random {
            tag,
            auth_tag: rand::random(),
            data,
        }
    }

    /// Generates a WHOAREYOU packet challenging `auth_tag`, with a fresh id-nonce.
    pub fn whoareyou(dst_id: &NodeId, enr_seq: u64, auth_tag: AuthTag) -> Packet {
        Packet::WhoAreYou {
            magic: magic(dst_id),
            token: auth_tag,
            id_nonce: rand::random(),
            enr_seq,
        }
    }

    /// The authentication tag of the packet. WHOAREYOU packets carry no tag of their own, only
    /// the token of the packet they challenge.
    pub fn auth_tag(&self) -> Option<&AuthTag> {
        match self {
            Packet::Random { auth_tag, .. } => Some(auth_tag),
            Packet::WhoAreYou { .. } => None,
            Packet::AuthMessage { auth_header, .. } => Some(&auth_header.auth_tag),
            Packet::Message { auth_tag, .. } => Some(auth_tag),
        }
    }

    pub fn is_whoareyou(&self) -> bool {
        matches!(self, Packet::WhoAreYou { .. })
    }

    pub fn is_random(&self) -> bool {
        matches!(self, Packet::Random { .. })
    }

    /// Encodes the packet for the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Random { tag, auth_tag, data } => {
                let mut buf = Vec::with_capacity(TAG_LENGTH + AUTH_TAG_LENGTH + 1 + data.len());
                buf.extend_from_slice(tag);
                buf.extend_from_slice(&rlp::encode(&auth_tag.to_vec()));
                buf.extend_from_slice(data);
                buf
            }
            Packet::WhoAreYou {
                magic,
                token,
                id_nonce,
                enr_seq,
            } => {
                let list = {
                    let mut s = RlpStream::new();
                    s.begin_list(3);
                    s.append(&token.to_vec());
                    s.append(&id_nonce.to_vec());
                    s.append(enr_seq);
                    s.out()
                };
                let mut buf = Vec::with_capacity(MAGIC_LENGTH + list.len());
                buf.extend_from_slice(magic);
                buf.extend_from_slice(&list);
                buf
            }
            Packet::AuthMessage {
                tag,
                auth_header,
                message,
            } => {
                let header = rlp::encode(auth_header);
                let mut buf = Vec::with_capacity(TAG_LENGTH + header.len() + message.len());
                buf.extend_from_slice(tag);
                buf.extend_from_slice(&header);
                buf.extend_from_slice(message);
                buf
            }
            Packet::Message {
                tag,
                auth_tag,
                message,
            } => {
                let mut buf =
                    Vec::with_capacity(TAG_LENGTH + AUTH_TAG_LENGTH + 1 + message.len());
                buf.extend_from_slice(tag);
                buf.extend_from_slice(&rlp::encode(&auth_tag.to_vec()));
                buf.extend_from_slice(message);
                buf
            }
        }
    }

    /// Decodes an inbound datagram. `local_magic` is the WHOAREYOU magic of the local node, used
    /// to recognise challenges addressed to us.
    pub fn decode(data: &[u8], local_magic: &Magic) -> Result<Packet, PacketError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge);
        }
        if data.len() < TAG_LENGTH + 1 {
            return Err(PacketError::TooSmall);
        }

        if data[..MAGIC_LENGTH] == local_magic[..] {
            return Self::decode_whoareyou(data);
        }

        let mut tag: Tag = Default::default();
        tag.copy_from_slice(&data[..TAG_LENGTH]);

        let rlp = Rlp::new(&data[TAG_LENGTH..]);
        if rlp.is_list() {
            // an rlp list after the tag is an authentication header
            let header_length = rlp.payload_info()?.total();
            if TAG_LENGTH + header_length > data.len() {
                return Err(PacketError::TooSmall);
            }
            let auth_header: AuthHeader =
                rlp::decode(&data[TAG_LENGTH..TAG_LENGTH + header_length])?;
            let message = data[TAG_LENGTH + header_length..].to_vec();
            if message.is_empty() {
                return Err(PacketError::UnknownFormat);
            }
            Ok(Packet::AuthMessage {
                tag,
                auth_header,
                message,
            })
        } else {
            // otherwise the tag is followed by the rlp-encoded auth-tag and the ciphertext
            let auth_tag_length = rlp.payload_info()?.total();
            if TAG_LENGTH + auth_tag_length > data.len() {
                return Err(PacketError::TooSmall);
            }
            let auth_tag_bytes: Vec<u8> =
                rlp::decode(&data[TAG_LENGTH..TAG_LENGTH + auth_tag_length])?;
            if auth_tag_bytes.len() != AUTH_TAG_LENGTH {
                return Err(PacketError::UnknownFormat);
            }
            let mut auth_tag: AuthTag = Default::default();
            auth_tag.copy_from_slice(&auth_tag_bytes);

            let message = data[TAG_LENGTH + auth_tag_length..].to_vec();
            if message.is_empty() {
                return Err(PacketError::UnknownFormat);
            }
            Ok(Packet::Message {
                tag,
                auth_tag,
                message,
            })
        }
    }

    fn decode_whoareyou(data: &[u8]) -> Result<Packet, PacketError> {
        let mut magic: Magic = Default::default();
        magic.copy_from_slice(&data[..MAGIC_LENGTH]);

        let rlp = Rlp::new(&data[MAGIC_LENGTH..]);
        if !rlp.is_list() || rlp.item_count()? != 3 {
            return Err(PacketError::UnknownFormat);
        }

        let token_bytes: Vec<u8> = rlp.val_at(0)?;
        if token_bytes.len() > AUTH_TAG_LENGTH {
            return Err(PacketError::UnknownFormat);
        }
        // leading zero bytes of fixed-width fields are stripped by rlp
        let mut token: AuthTag = Default::default();
        token[AUTH_TAG_LENGTH - token_bytes.len()..].copy_from_slice(&token_bytes);

        let id_nonce_bytes: Vec<u8> = rlp.val_at(1)?;
        if id_nonce_bytes.len() > ID_NONCE_LENGTH {
            return Err(PacketError::UnknownFormat);
        }
        let mut id_nonce: IdNonce = Default::default();
        id_nonce[ID_NONCE_LENGTH - id_nonce_bytes.len()..].copy_from_slice(&id_nonce_bytes);

        let enr_seq: u64 = rlp.val_at(2)?;

        Ok(Packet::WhoAreYou {
            magic,
            token,
            id_nonce,
            enr_seq,
        })
    }
}

/// The WHOAREYOU magic for packets addressed to `node_id`.
pub fn magic(node_id: &NodeId) -> Magic {
    let mut hasher = Sha256::new();
    hasher.update(node_id.raw());
    hasher.update(WHOAREYOU_STRING.as_bytes());
    let mut magic: Magic = Default::default();
    magic.copy_from_slice(&hasher.finalize());
    magic
}

/// The tag placed on packets from `src_id` to `dst_id`.
pub fn tag(src_id: &NodeId, dst_id: &NodeId) -> Tag {
    let hash = Sha256::digest(dst_id.raw());
    let src_raw = src_id.raw();
    let mut tag: Tag = Default::default();
    for i in 0..TAG_LENGTH {
        tag[i] = hash[i] ^ src_raw[i];
    }
    tag
}

/// Recovers the sender of a packet addressed to `local_id` from its tag.
pub fn src_id(local_id: &NodeId, tag: &Tag) -> NodeId {
    let hash = Sha256::digest(local_id.raw());
    let mut raw = [0u8; TAG_LENGTH];
    for i in 0..TAG_LENGTH {
        raw[i] = hash[i] ^ tag[i];
    }
    NodeId::new(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_magic() -> (NodeId, Magic) {
        let node_id = NodeId::random();
        let magic = magic(&node_id);
        (node_id, magic)
    }

    #[test]
    fn tag_recovers_src_id() {
        let src = NodeId::random();
        let dst = NodeId::random();
        let tag = tag(&src, &dst);
        assert_eq!(src_id(&dst, &tag), src);
    }

    #[test]
    fn encode_decode_whoareyou() {
        let (node_id, magic) = local_magic();
        let packet = Packet::whoareyou(&node_id, 1, rand::random());
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded, &magic).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn encode_decode_auth_message() {
        let (_, magic) = local_magic();
        let auth_header = AuthHeader::new(
            rand::random(),
            rand::random(),
            vec![3; 33],
            vec![8; 32],
        );
        let packet = Packet::AuthMessage {
            tag: rand::random(),
            auth_header,
            message: vec![17; 32],
        };
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded, &magic).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn encode_decode_message() {
        let (_, magic) = local_magic();
        let packet = Packet::Message {
            tag: rand::random(),
            auth_tag: rand::random(),
            message: vec![21; 16],
        };
        let encoded = packet.encode();
        let decoded = Packet::decode(&encoded, &magic).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn random_packet_decodes_as_message() {
        // a random packet is indistinguishable from an undecryptable message
        let (_, magic) = local_magic();
        let packet = Packet::random(rand::random());
        let encoded = packet.encode();
        match Packet::decode(&encoded, &magic).unwrap() {
            Packet::Message { auth_tag, .. } => {
                assert_eq!(Some(&auth_tag), packet.auth_tag());
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }
}
