//! Session key generation for the handshake.
//!
//! Key agreement is Diffie-Hellman over secp256k1 followed by HKDF (SHA2-256) expansion into the
//! two directional session keys and the auth-response key. Messages are sealed with AES-128-GCM.
//! There is no abstraction over the algorithms, the handshake defines exactly one suite.

use crate::error::Error;
use crate::packet::{AuthHeader, AuthResponse, AuthTag, IdNonce};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, Payload},
    Aes128Gcm, KeyInit,
};
use enr::{
    k256::{
        self,
        ecdsa::{
            signature::{DigestSigner, DigestVerifier},
            Signature, SigningKey, VerifyingKey,
        },
        elliptic_curve::sec1::ToEncodedPoint,
    },
    CombinedKey, CombinedPublicKey, NodeId,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::Enr;

pub(crate) const KEY_LENGTH: usize = 16;
const NODE_ID_LENGTH: usize = 32;
const INFO_LENGTH: usize = 26 + 2 * NODE_ID_LENGTH;
const KEY_AGREEMENT_STRING: &str = "discovery v5 key agreement";
const NONCE_PREFIX: &str = "discovery-id-nonce";

pub(crate) type Key = [u8; KEY_LENGTH];

/* Session key generation */

/// Generates session keys and an ephemeral public key for the responder side of a WHOAREYOU
/// challenge. Only secp256k1-signed ENRs are supported. Returns our encryption key, our
/// decryption key, the auth-response key and the SEC1-encoded ephemeral public key.
pub(crate) fn generate_session_keys(
    local_id: &NodeId,
    remote_enr: &Enr,
    id_nonce: &IdNonce,
) -> Result<(Key, Key, Key, Vec<u8>), Error> {
    let (secret, ephem_pubkey) = match remote_enr.public_key() {
        CombinedPublicKey::Secp256k1(remote_pk) => {
            let ephem_sk = SigningKey::random(&mut rand::thread_rng());
            let secret = ecdh(&remote_pk, &ephem_sk)?;
            let ephem_pubkey = ephem_sk
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec();
            (secret, ephem_pubkey)
        }
        CombinedPublicKey::Ed25519(_) => return Err(Error::KeyTypeNotSupported("Ed25519")),
    };

    let (encryption_key, decryption_key, auth_resp_key) =
        derive_keys(&secret, local_id, &remote_enr.node_id(), id_nonce)?;

    Ok((encryption_key, decryption_key, auth_resp_key, ephem_pubkey))
}

/// Derives the session keys on the challenger side, given the ephemeral public key delivered in
/// an authentication header. Returns our decryption key, our encryption key and the
/// auth-response key.
pub(crate) fn derive_keys_from_pubkey(
    local_key: &CombinedKey,
    local_id: &NodeId,
    remote_id: &NodeId,
    id_nonce: &IdNonce,
    ephem_pubkey: &[u8],
) -> Result<(Key, Key, Key), Error> {
    let secret = match local_key {
        CombinedKey::Secp256k1(key) => {
            // the remote's ephemeral key type must match our own identity key
            let remote_pk = VerifyingKey::from_sec1_bytes(ephem_pubkey)
                .map_err(|_| Error::InvalidRemotePublicKey)?;
            ecdh(&remote_pk, key)?
        }
        CombinedKey::Ed25519(_) => return Err(Error::KeyTypeNotSupported("Ed25519")),
    };

    // the initiator of the key agreement is the remote node
    derive_keys(&secret, remote_id, local_id, id_nonce)
}

/// The shared secret is the full SEC1-compressed point of the scalar multiplication.
fn ecdh(public_key: &VerifyingKey, secret_key: &SigningKey) -> Result<Vec<u8>, Error> {
    let public_key = k256::PublicKey::from_sec1_bytes(public_key.to_encoded_point(true).as_bytes())
        .map_err(|_| Error::InvalidRemotePublicKey)?;
    let scalar = *secret_key.as_nonzero_scalar().as_ref();
    let shared = k256::PublicKey::from_affine((public_key.to_projective() * scalar).to_affine())
        .map_err(|_| Error::KeyDerivationFailed)?;
    Ok(shared.to_encoded_point(true).as_bytes().to_vec())
}

fn derive_keys(
    secret: &[u8],
    initiator_id: &NodeId,
    recipient_id: &NodeId,
    id_nonce: &IdNonce,
) -> Result<(Key, Key, Key), Error> {
    let mut info = [0u8; INFO_LENGTH];
    info[0..26].copy_from_slice(KEY_AGREEMENT_STRING.as_bytes());
    info[26..26 + NODE_ID_LENGTH].copy_from_slice(&initiator_id.raw());
    info[26 + NODE_ID_LENGTH..].copy_from_slice(&recipient_id.raw());

    let hkdf = Hkdf::<Sha256>::new(Some(id_nonce.as_ref()), secret);
    let mut okm = [0u8; 3 * KEY_LENGTH];
    hkdf.expand(&info, &mut okm)
        .map_err(|_| Error::KeyDerivationFailed)?;

    let mut initiator_key: Key = Default::default();
    let mut recipient_key: Key = Default::default();
    let mut auth_resp_key: Key = Default::default();
    initiator_key.copy_from_slice(&okm[0..KEY_LENGTH]);
    recipient_key.copy_from_slice(&okm[KEY_LENGTH..2 * KEY_LENGTH]);
    auth_resp_key.copy_from_slice(&okm[2 * KEY_LENGTH..]);

    Ok((initiator_key, recipient_key, auth_resp_key))
}

/* Nonce signing */

/// Signs the WHOAREYOU id-nonce together with the ephemeral public key.
pub(crate) fn sign_nonce(
    signing_key: &CombinedKey,
    id_nonce: &IdNonce,
    ephem_pubkey: &[u8],
) -> Result<Vec<u8>, Error> {
    match signing_key {
        CombinedKey::Secp256k1(key) => {
            let digest = Sha256::new().chain_update(signing_nonce(id_nonce, ephem_pubkey));
            let signature: Signature = key
                .try_sign_digest(digest)
                .map_err(|_| Error::Custom("failed to sign id-nonce"))?;
            Ok(signature.to_bytes().to_vec())
        }
        CombinedKey::Ed25519(_) => Err(Error::KeyTypeNotSupported("Ed25519")),
    }
}

/// Verifies an id-nonce signature from an authentication header.
pub(crate) fn verify_authentication_nonce(
    remote_pubkey: &CombinedPublicKey,
    remote_ephem_pubkey: &[u8],
    id_nonce: &IdNonce,
    signature: &[u8],
) -> bool {
    match remote_pubkey {
        CombinedPublicKey::Secp256k1(key) => {
            let digest = Sha256::new().chain_update(signing_nonce(id_nonce, remote_ephem_pubkey));
            match Signature::from_slice(signature) {
                Ok(signature) => key.verify_digest(digest, &signature).is_ok(),
                Err(_) => false,
            }
        }
        CombinedPublicKey::Ed25519(_) => false,
    }
}

fn signing_nonce(id_nonce: &IdNonce, ephem_pubkey: &[u8]) -> Vec<u8> {
    let mut data = NONCE_PREFIX.as_bytes().to_vec();
    data.extend_from_slice(id_nonce);
    data.extend_from_slice(ephem_pubkey);
    data
}

/* Sealing */

/// Decrypts the authentication response of a header with the auth-response key.
pub(crate) fn decrypt_authentication_header(
    auth_resp_key: &Key,
    header: &AuthHeader,
) -> Result<AuthResponse, Error> {
    // the auth response is sealed with a zero nonce and no associated data
    let plaintext = decrypt_message(auth_resp_key, [0u8; 12], &header.auth_response, &[])?;
    rlp::decode::<AuthResponse>(&plaintext).map_err(Error::Rlp)
}

/// Decrypts a message that is post-fixed with its authentication MAC.
pub(crate) fn decrypt_message(
    key: &Key,
    nonce: AuthTag,
    message: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    if message.len() < 16 {
        return Err(Error::DecryptionFailed(
            "message not long enough to contain a MAC".into(),
        ));
    }

    let aead = Aes128Gcm::new(GenericArray::from_slice(key));
    let payload = Payload { msg: message, aad };
    aead.decrypt(GenericArray::from_slice(&nonce), payload)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))
}

/// Encrypts a message, appending the authentication MAC.
pub(crate) fn encrypt_message(
    key: &Key,
    nonce: AuthTag,
    message: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    let aead = Aes128Gcm::new(GenericArray::from_slice(key));
    let payload = Payload { msg: message, aad };
    aead.encrypt(GenericArray::from_slice(&nonce), payload)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))
}
