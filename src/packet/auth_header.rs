//! The authentication header attached to the handshake response packet.

use super::{AuthTag, IdNonce, AUTH_TAG_LENGTH, ID_NONCE_LENGTH};
use crate::Enr;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// Only AES-GCM sealing is defined for the handshake.
const AUTH_SCHEME_NAME: &str = "gcm";
const AUTH_RESPONSE_VERSION: u8 = 5;

/// The authentication header sent alongside the first encrypted message of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    /// The nonce the message of this packet is encrypted with.
    pub auth_tag: AuthTag,
    /// The id-nonce of the WHOAREYOU packet this header responds to.
    pub id_nonce: IdNonce,
    /// The authentication scheme.
    pub auth_scheme_name: &'static str,
    /// The ephemeral public key of the key agreement, SEC1 encoded.
    pub ephemeral_pubkey: Vec<u8>,
    /// The encrypted authentication response.
    pub auth_response: Vec<u8>,
}

impl AuthHeader {
    pub fn new(
        auth_tag: AuthTag,
        id_nonce: IdNonce,
        ephemeral_pubkey: Vec<u8>,
        auth_response: Vec<u8>,
    ) -> Self {
        AuthHeader {
            auth_tag,
            id_nonce,
            auth_scheme_name: AUTH_SCHEME_NAME,
            ephemeral_pubkey,
            auth_response,
        }
    }
}

impl Encodable for AuthHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.auth_tag.to_vec());
        s.append(&self.id_nonce.to_vec());
        s.append(&self.auth_scheme_name);
        s.append(&self.ephemeral_pubkey);
        s.append(&self.auth_response);
    }
}

impl Decodable for AuthHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        let auth_tag_bytes: Vec<u8> = rlp.val_at(0)?;
        if auth_tag_bytes.len() > AUTH_TAG_LENGTH {
            return Err(DecoderError::Custom("invalid auth-tag length"));
        }
        let mut auth_tag: AuthTag = Default::default();
        auth_tag[AUTH_TAG_LENGTH - auth_tag_bytes.len()..].copy_from_slice(&auth_tag_bytes);

        let id_nonce_bytes: Vec<u8> = rlp.val_at(1)?;
        if id_nonce_bytes.len() > ID_NONCE_LENGTH {
            return Err(DecoderError::Custom("invalid id-nonce length"));
        }
        let mut id_nonce: IdNonce = Default::default();
        id_nonce[ID_NONCE_LENGTH - id_nonce_bytes.len()..].copy_from_slice(&id_nonce_bytes);

        let auth_scheme_bytes: Vec<u8> = rlp.val_at(2)?;
        if auth_scheme_bytes != AUTH_SCHEME_NAME.as_bytes() {
            return Err(DecoderError::Custom("unknown authentication scheme"));
        }

        let ephemeral_pubkey: Vec<u8> = rlp.val_at(3)?;
        let auth_response: Vec<u8> = rlp.val_at(4)?;

        Ok(AuthHeader {
            auth_tag,
            id_nonce,
            auth_scheme_name: AUTH_SCHEME_NAME,
            ephemeral_pubkey,
            auth_response,
        })
    }
}

/// The plaintext of the encrypted authentication response. Carries the signed id-nonce and, if
/// the challenger advertised an outdated sequence number, the responder's current ENR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// The version of the authentication response.
    pub version: u8,
    /// The signature over the id-nonce.
    pub signature: Vec<u8>,
    /// The responder's ENR, included when the challenger's copy is outdated.
    pub node_record: Option<Enr>,
}

impl AuthResponse {
    pub fn new(signature: &[u8], node_record: Option<Enr>) -> Self {
        AuthResponse {
            version: AUTH_RESPONSE_VERSION,
            signature: signature.to_vec(),
            node_record,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        s.append(self);
        s.out().to_vec()
    }
}

impl Encodable for AuthResponse {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.version);
        s.append(&self.signature);
        // an absent ENR is encoded as an empty list
        match &self.node_record {
            Some(node_record) => s.append(node_record),
            None => s.begin_list(0),
        };
    }
}

impl Decodable for AuthResponse {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        let version: u8 = rlp.val_at(0)?;
        let signature: Vec<u8> = rlp.val_at(1)?;
        let node_record_rlp = rlp.at(2)?;
        let node_record = if node_record_rlp.is_empty() {
            None
        } else {
            Some(node_record_rlp.as_val::<Enr>()?)
        };

        Ok(AuthResponse {
            version,
            signature,
            node_record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enr::{CombinedKey, EnrBuilder};

    #[test]
    fn encode_decode_auth_response() {
        let signature: [u8; 64] = [4; 64];
        let key = CombinedKey::generate_secp256k1();
        let enr = EnrBuilder::new("v4").tcp4(30303).build(&key).unwrap();

        let auth_response = AuthResponse::new(&signature, Some(enr.clone()));
        let encoded = auth_response.encode();
        let decoded: AuthResponse = rlp::decode(&encoded).unwrap();

        assert_eq!(decoded.signature, signature.to_vec());
        assert_eq!(decoded.node_record, Some(enr));
    }

    #[test]
    fn encode_decode_auth_response_no_enr() {
        let signature: [u8; 64] = [7; 64];
        let auth_response = AuthResponse::new(&signature, None);
        let encoded = auth_response.encode();
        let decoded: AuthResponse = rlp::decode(&encoded).unwrap();

        assert_eq!(decoded.signature, signature.to_vec());
        assert_eq!(decoded.node_record, None);
    }

    #[test]
    fn encode_decode_auth_header() {
        let header = AuthHeader::new([1; 12], [2; 32], vec![3; 33], vec![5; 48]);
        let encoded = rlp::encode(&header);
        let decoded: AuthHeader = rlp::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }
}
