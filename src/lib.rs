#![deny(rustdoc::broken_intra_doc_links)]
//! The session and lookup cores of a [Discovery V5](https://github.com/ethereum/devp2p/blob/master/discv5/discv5.md) node.
//!
//! # Overview
//!
//! Discovery v5 identifies each peer by an ENR ([Ethereum Node
//! Record](https://eips.ethereum.org/EIPS/eip-778)), a signed key-value store carrying the node's
//! public key and optionally an IP address and port. All communication between nodes is encrypted
//! with session keys negotiated through a three-packet handshake (a random packet, a WHOAREYOU
//! challenge and an authenticated response).
//!
//! This crate implements the two stateful cores of such a node and leaves the routing table and
//! application protocol to the layer above:
//!
//! - [`service::SessionService`]: establishes and maintains encrypted sessions with remote nodes.
//!   It drives the handshake, tracks outstanding requests for retransmission, buffers messages
//!   until a session exists and reports decoded messages, failures and WHOAREYOU requests as
//!   [`service::SessionEvent`]s. A node whose ENR advertises an address that does not match the
//!   address its packets arrive from is considered untrusted. Requests are only sent to trusted
//!   sessions, responses to any established session.
//! - [`lookup::Lookup`]: a Kademlia-style iterative closest-node search. The lookup is seeded
//!   with peers from a routing table and emits [`lookup::LookupEvent::Peer`] whenever the caller
//!   should issue a FINDNODE request, applying a bounded parallelism that widens while the search
//!   is stalled.
//!
//! The supporting layers are:
//!
//! - [`transport`]: the datagram contract the session service drives, along with a UDP
//!   implementation. Datagram semantics are assumed, packets may be lost, reordered or
//!   duplicated.
//! - [`packet`]: the raw packet variants and their wire encoding.
//! - [`rpc`]: the protocol messages exchanged once a session is established. Only the
//!   request-id correlation is interpreted by this crate.
//!
//! The session service is a single-threaded reactor. It implements [`futures::Stream`] and every
//! state transition happens while the owning task polls it, so none of the internal containers
//! take locks.

mod config;
mod error;
pub mod lookup;
pub mod packet;
pub mod rpc;
pub mod service;
mod session;
pub mod transport;

/// The ENR type used throughout this crate.
pub type Enr = enr::Enr<enr::CombinedKey>;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, PacketError};
pub use lookup::{Lookup, LookupConfig, LookupEvent};
pub use service::{SessionEvent, SessionService};
pub use transport::{Transport, UdpTransport};

// re-export the ENR crate
pub use enr;
