//! Ballot confidentiality and mesh-plane message signatures.
//!
//! A ballot is encrypted with a fresh 256-bit key under AES-256-GCM using a
//! non-standard 128-bit nonce (the protocol calls it an IV) instead of the
//! crate default 96-bit one. GCM's construction supports any nonce length,
//! and using the full 16 bytes matches the protocol's field sizes.
//! The "signature" used on mesh-plane messages is a tagged hash, not a MAC:
//! ballots are never signed, so a revealed key can't be tied back to the
//! node that produced the ciphertext via the signature channel.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::AesGcm;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const VOTE_ID_LEN: usize = 16;

type Aes256Gcm128Nonce = AesGcm<aes_gcm::aes::Aes256, aes_gcm::aead::consts::U16>;

/// The plaintext record carried inside every ciphertext. Deliberately has
/// no field naming the voter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BallotPlaintext {
    pub choice: String,
    pub anonymous_vote_id: String,
    pub timestamp: i64,
    pub round_id: String,
}

pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// 16 random bytes rendered as hex, per the anonymous vote id format.
pub fn random_anonymous_vote_id() -> String {
    let mut raw = [0u8; VOTE_ID_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

pub fn encrypt_ballot(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    plaintext: &BallotPlaintext,
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm128Nonce::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(iv);
    let bytes = serde_json::to_vec(plaintext)?;
    cipher
        .encrypt(nonce, bytes.as_ref())
        .map_err(|e| Error::Crypto(format!("ballot encryption failed: {e}")))
}

pub fn decrypt_ballot(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<BallotPlaintext> {
    let cipher = Aes256Gcm128Nonce::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(iv);
    let bytes = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Crypto(format!("ballot decryption failed: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Tagged hash `H("quorumvote-mesh" || nodeId || payload)`, used only to
/// authenticate mesh-plane frames (handshakes, gossip). Never applied to
/// ballots: signing a ciphertext would link it to its signer.
pub fn sign_mesh_payload(node_id: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"quorumvote-mesh");
    hasher.update(node_id.as_bytes());
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Also used, unchanged, as the best-effort per-ballot "signature" field
/// the wire schema carries. It is never checked against the caster's
/// identity (there is none to check against); see the unlinkability
/// caveat in the design notes.
pub fn ballot_signature(anonymous_vote_id: &str, ciphertext: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"quorumvote-ballot");
    hasher.update(anonymous_vote_id.as_bytes());
    hasher.update(ciphertext);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext_exactly() {
        let key = random_key();
        let iv = random_iv();
        let plaintext = BallotPlaintext {
            choice: "yes".into(),
            anonymous_vote_id: random_anonymous_vote_id(),
            timestamp: 1_700_000_000,
            round_id: "round_1_alice".into(),
        };
        let ciphertext = encrypt_ballot(&key, &iv, &plaintext).unwrap();
        let recovered = decrypt_ballot(&key, &iv, &ciphertext).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key = random_key();
        let iv = random_iv();
        let plaintext = BallotPlaintext {
            choice: "no".into(),
            anonymous_vote_id: random_anonymous_vote_id(),
            timestamp: 1,
            round_id: "round_1_alice".into(),
        };
        let ciphertext = encrypt_ballot(&key, &iv, &plaintext).unwrap();
        let wrong_key = random_key();
        assert!(decrypt_ballot(&wrong_key, &iv, &ciphertext).is_err());
    }

    #[test]
    fn anonymous_vote_ids_are_16_bytes_of_hex() {
        let id = random_anonymous_vote_id();
        assert_eq!(id.len(), VOTE_ID_LEN * 2);
        assert!(hex::decode(&id).is_ok());
    }
}
