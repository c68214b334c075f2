//! The protocol messages exchanged over established sessions.
//!
//! The session layer only interprets the message id, everything else is passed through to the
//! protocol layer. Each request carries an application-chosen id and responses echo the id of
//! the request that triggered them, which is how inbound responses are correlated with pending
//! requests.

use crate::Enr;
use rlp::{DecoderError, Rlp, RlpStream};
use std::net::IpAddr;

/// A protocol message, either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    /// The id of the request this message belongs to.
    pub id: u64,
    /// The body of the message.
    pub body: RpcType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcType {
    Request(Request),
    Response(Response),
}

/// A request sent to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A PING request, reporting our current ENR sequence number.
    Ping { enr_seq: u64 },
    /// A FINDNODE request for nodes at the given log2 distance.
    FindNode { distance: u64 },
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A PONG response, echoing the responder's ENR sequence number and the requester's external
    /// endpoint as observed by the responder.
    Pong { enr_seq: u64, ip: IpAddr, port: u16 },
    /// A NODES response carrying ENRs close to the requested distance.
    Nodes { total: u64, nodes: Vec<Enr> },
}

impl ProtocolMessage {
    fn msg_type(&self) -> u8 {
        match &self.body {
            RpcType::Request(Request::Ping { .. }) => 1,
            RpcType::Response(Response::Pong { .. }) => 2,
            RpcType::Request(Request::FindNode { .. }) => 3,
            RpcType::Response(Response::Nodes { .. }) => 4,
        }
    }

    /// Encodes the message as a type byte followed by an rlp list.
    pub fn encode(self) -> Vec<u8> {
        let msg_type = self.msg_type();
        let id = self.id;
        let mut s = RlpStream::new();
        match self.body {
            RpcType::Request(Request::Ping { enr_seq }) => {
                s.begin_list(2);
                s.append(&id);
                s.append(&enr_seq);
            }
            RpcType::Request(Request::FindNode { distance }) => {
                s.begin_list(2);
                s.append(&id);
                s.append(&distance);
            }
            RpcType::Response(Response::Pong { enr_seq, ip, port }) => {
                let ip_bytes: Vec<u8> = match ip {
                    IpAddr::V4(addr) => addr.octets().to_vec(),
                    IpAddr::V6(addr) => addr.octets().to_vec(),
                };
                s.begin_list(4);
                s.append(&id);
                s.append(&enr_seq);
                s.append(&ip_bytes);
                s.append(&port);
            }
            RpcType::Response(Response::Nodes { total, nodes }) => {
                s.begin_list(3);
                s.append(&id);
                s.append(&total);
                s.append_list(&nodes);
            }
        }

        let body = s.out();
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.push(msg_type);
        buf.extend_from_slice(&body);
        buf
    }

    /// Decodes a message from its wire form.
    pub fn decode(data: &[u8]) -> Result<Self, DecoderError> {
        if data.len() < 3 {
            return Err(DecoderError::RlpIsTooShort);
        }
        let msg_type = data[0];
        let rlp = Rlp::new(&data[1..]);
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        let id: u64 = rlp.val_at(0)?;

        let body = match msg_type {
            1 => {
                if rlp.item_count()? != 2 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                RpcType::Request(Request::Ping {
                    enr_seq: rlp.val_at(1)?,
                })
            }
            2 => {
                if rlp.item_count()? != 4 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                let ip_bytes: Vec<u8> = rlp.val_at(2)?;
                let ip: IpAddr = match ip_bytes.len() {
                    4 => {
                        let mut octets = [0u8; 4];
                        octets.copy_from_slice(&ip_bytes);
                        IpAddr::from(octets)
                    }
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&ip_bytes);
                        IpAddr::from(octets)
                    }
                    _ => return Err(DecoderError::Custom("invalid ip address")),
                };
                RpcType::Response(Response::Pong {
                    enr_seq: rlp.val_at(1)?,
                    ip,
                    port: rlp.val_at(3)?,
                })
            }
            3 => {
                if rlp.item_count()? != 2 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                RpcType::Request(Request::FindNode {
                    distance: rlp.val_at(1)?,
                })
            }
            4 => {
                if rlp.item_count()? != 3 {
                    return Err(DecoderError::RlpIncorrectListLen);
                }
                let nodes: Vec<Enr> = rlp.list_at(2)?;
                RpcType::Response(Response::Nodes {
                    total: rlp.val_at(1)?,
                    nodes,
                })
            }
            _ => return Err(DecoderError::Custom("unknown message type")),
        };

        Ok(ProtocolMessage { id, body })
    }

    /// True if the message is a request.
    pub fn is_request(&self) -> bool {
        matches!(self.body, RpcType::Request(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::{CombinedKey, EnrBuilder};

    #[test]
    fn encode_decode_ping() {
        let message = ProtocolMessage {
            id: 10,
            body: RpcType::Request(Request::Ping { enr_seq: 15 }),
        };
        let decoded = ProtocolMessage::decode(&message.clone().encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn encode_decode_pong() {
        let message = ProtocolMessage {
            id: 10,
            body: RpcType::Response(Response::Pong {
                enr_seq: 15,
                ip: "127.0.0.1".parse().unwrap(),
                port: 9000,
            }),
        };
        let decoded = ProtocolMessage::decode(&message.clone().encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn encode_decode_nodes() {
        let key = CombinedKey::generate_secp256k1();
        let enr = EnrBuilder::new("v4")
            .ip4("192.168.0.1".parse().unwrap())
            .udp4(9000)
            .build(&key)
            .unwrap();

        let message = ProtocolMessage {
            id: 32,
            body: RpcType::Response(Response::Nodes {
                total: 1,
                nodes: vec![enr],
            }),
        };
        let decoded = ProtocolMessage::decode(&message.clone().encode()).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn encode_decode_find_node() {
        let message = ProtocolMessage {
            id: 7,
            body: RpcType::Request(Request::FindNode { distance: 256 }),
        };
        let decoded = ProtocolMessage::decode(&message.clone().encode()).unwrap();
        assert_eq!(message, decoded);
    }
}
