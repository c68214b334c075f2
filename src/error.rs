use rlp::DecoderError;
use thiserror::Error;

/// Errors produced by the session layer.
///
/// Only precondition failures are returned to the caller of the send functions. Failures that
/// happen after a packet has left the host are reported asynchronously through
/// [`crate::service::SessionEvent::RequestFailed`].
#[derive(Debug, Error)]
pub enum Error {
    /// The ENR is unusable. Either it carries no UDP endpoint or it does not match the local
    /// keypair.
    #[error("invalid ENR")]
    InvalidEnr,
    /// No session exists for this node, or the session has not yet confirmed its keys.
    #[error("session is not established")]
    SessionNotReady,
    /// The session is established but the node's ENR endpoint does not match the address its
    /// packets arrive from. Requests are not sent to untrusted nodes.
    #[error("node is untrusted")]
    UntrustedPeer,
    /// The key type is not supported for session establishment.
    #[error("key type not supported: {0}")]
    KeyTypeNotSupported(&'static str),
    /// Deriving session keys from the key agreement failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,
    /// The remote's public key could not be parsed.
    #[error("invalid remote public key")]
    InvalidRemotePublicKey,
    /// The id-nonce signature in an authentication header did not verify.
    #[error("invalid id-nonce signature")]
    InvalidSignature,
    /// A payload could not be RLP decoded.
    #[error("rlp decoding failed: {0:?}")]
    Rlp(DecoderError),
    /// AEAD encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    /// AEAD decryption failed.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    /// A custom error.
    #[error("{0}")]
    Custom(&'static str),
}

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        Error::Rlp(error)
    }
}

/// Errors produced when decoding a raw inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The datagram is too small to hold a packet.
    #[error("packet too small")]
    TooSmall,
    /// The datagram exceeds the maximum packet size.
    #[error("packet too large")]
    TooLarge,
    /// The packet structure does not match any known packet kind.
    #[error("unknown packet format")]
    UnknownFormat,
    /// A packet field failed to RLP decode.
    #[error("invalid rlp: {0:?}")]
    Rlp(DecoderError),
}

impl From<DecoderError> for PacketError {
    fn from(error: DecoderError) -> Self {
        PacketError::Rlp(error)
    }
}
