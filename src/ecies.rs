//! ECIES Codec
//!
//! Encrypts and decrypts messages to a recipient public key per the
//! Ethereum ECIES profile used for RLPx handshake messages:
//!
//! ```text
//! R(65, uncompressed) ‖ iv(16) ‖ AES-128-CTR(kE, iv, m) ‖ HMAC-SHA256(kM', iv ‖ c ‖ ad)
//! ```
//!
//! where `kE ‖ kM = KDF(ECDH(r, recipient), 32)` and `kM' = SHA-256(kM)`.
//! The associated data `ad` is empty for legacy messages and the two-byte
//! EIP-8 size prefix for framed handshake messages.

use crate::crypto::{self, Aes128Ctr, CryptoError};
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::Rng;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Bytes added around the plaintext: ephemeral key, IV, and tag.
pub const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// Errors from ECIES operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EciesError {
    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("malformed ecies message")]
    Malformed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Derive the AES and MAC keys for one message from an ECDH x coordinate.
fn message_keys(shared_x: &[u8; 32]) -> Result<([u8; 16], [u8; 32]), EciesError> {
    let mut derived = [0u8; 32];
    crypto::kdf(shared_x, &mut derived)?;
    let mut enc_key = [0u8; 16];
    enc_key.copy_from_slice(&derived[..16]);
    let mac_key = crypto::sha256(&derived[16..]);
    Ok((enc_key, mac_key))
}

/// Encrypt `plaintext` to `recipient`, authenticating `shared_mac_data`.
pub fn encrypt(
    recipient: &PublicKey,
    plaintext: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, EciesError> {
    let mut rng = rand::thread_rng();

    // Fresh key pair for this message only.
    let message_secret = SecretKey::new(&mut rng);
    let message_public = PublicKey::from_secret_key(SECP256K1, &message_secret);

    let shared_x = crypto::ecdh_x(recipient, &message_secret);
    let (enc_key, mac_key) = message_keys(&shared_x)?;

    let iv: [u8; 16] = rng.gen();
    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new(&enc_key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let tag = crypto::hmac_sha256(&mac_key, &[&iv, &ciphertext], shared_mac_data)?;

    let mut out = Vec::with_capacity(ECIES_OVERHEAD + plaintext.len());
    out.extend_from_slice(&message_public.serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt a message addressed to `secret`, verifying `shared_mac_data`.
///
/// The tag comparison is constant time; any mismatch reports `TagMismatch`
/// without revealing which byte differed.
pub fn decrypt(
    secret: &SecretKey,
    message: &[u8],
    shared_mac_data: &[u8],
) -> Result<Vec<u8>, EciesError> {
    if message.len() < ECIES_OVERHEAD {
        return Err(EciesError::Malformed);
    }

    // Layout: public key (65) ‖ iv (16) ‖ ciphertext ‖ tag (32).
    let (public_bytes, rest) = message.split_at(65);
    let (iv, rest) = rest.split_at(16);
    let (ciphertext, tag) = rest.split_at(rest.len() - 32);

    let message_public =
        PublicKey::from_slice(public_bytes).map_err(|_| CryptoError::InvalidPoint)?;
    let shared_x = crypto::ecdh_x(&message_public, secret);
    let (enc_key, mac_key) = message_keys(&shared_x)?;

    let expected = crypto::hmac_sha256(&mac_key, &[iv, ciphertext], shared_mac_data)?;
    if !bool::from(expected[..].ct_eq(tag)) {
        return Err(EciesError::TagMismatch);
    }

    let mut plaintext = ciphertext.to_vec();
    let iv: [u8; 16] = iv.try_into().map_err(|_| EciesError::Malformed)?;
    let mut cipher = Aes128Ctr::new(&enc_key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

// ============================================================================
// Tests
// ============================================================================
