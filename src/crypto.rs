//! Cryptographic Primitives
//!
//! The primitive layer under the ECIES codec, handshake, and frame codec:
//! secp256k1 key handling, recoverable ECDSA, ECDH, Keccak-256, the AES
//! stream/block modes RLPx needs, HMAC-SHA256, and the NIST SP 800-56
//! concatenation KDF.
//!
//! All functions are deterministic given their inputs; only key generation
//! draws from the process RNG.

use hmac::{Hmac, Mac};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Keccak256};
use thiserror::Error;

/// AES-128 in CTR mode with a 64-bit big-endian counter (ECIES payloads).
pub type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;

/// AES-256 in CTR mode with a 64-bit big-endian counter (frame streams).
pub type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Length of a recoverable signature: `r ‖ s ‖ v`.
pub const SIGNATURE_SIZE: usize = 65;

/// Errors from primitive crypto operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secp256k1 point")]
    InvalidPoint,

    #[error("invalid or unrecoverable signature")]
    InvalidSignature,

    #[error("invalid input length")]
    InvalidLength,
}

/// A node's long-lived secp256k1 identity key pair.
///
/// Read-only after creation; shared across sessions.
#[derive(Clone)]
pub struct StaticKeys {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl StaticKeys {
    /// Generate a fresh identity from the process RNG.
    pub fn generate() -> Self {
        let (secret, public) = keypair_generate();
        Self { secret, public }
    }

    /// Build an identity from an existing secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self { secret, public }
    }

    /// Build an identity from raw secret key bytes.
    pub fn from_secret_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPoint)?;
        Ok(Self::from_secret(secret))
    }
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys")
            .field("public", &self.public)
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// Generate a fresh secp256k1 key pair.
pub fn keypair_generate() -> (SecretKey, PublicKey) {
    let secret = SecretKey::new(&mut rand::thread_rng());
    let public = PublicKey::from_secret_key(SECP256K1, &secret);
    (secret, public)
}

/// ECDH returning only the x coordinate of the shared point.
///
/// RLPx key derivation hashes the raw x coordinate rather than the
/// compressed-point SHA-256 that `secp256k1::ecdh::SharedSecret` computes.
pub fn ecdh_x(public: &PublicKey, secret: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(public, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// Sign a 32-byte digest, producing a 65-byte recoverable signature.
pub fn ecdsa_sign(secret: &SecretKey, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_SIZE], CryptoError> {
    let msg = Message::from_digest_slice(digest).map_err(|_| CryptoError::InvalidLength)?;
    let (rec_id, sig) = SECP256K1.sign_ecdsa_recoverable(&msg, secret).serialize_compact();
    let mut out = [0u8; SIGNATURE_SIZE];
    out[..64].copy_from_slice(&sig);
    out[64] = rec_id.to_i32() as u8;
    Ok(out)
}

/// Recover the signing public key from a 65-byte signature over `digest`.
pub fn ecdsa_recover(sig: &[u8; SIGNATURE_SIZE], digest: &[u8; 32]) -> Result<PublicKey, CryptoError> {
    let msg = Message::from_digest_slice(digest).map_err(|_| CryptoError::InvalidLength)?;
    let rec_id = RecoveryId::from_i32(sig[64] as i32).map_err(|_| CryptoError::InvalidSignature)?;
    let sig = RecoverableSignature::from_compact(&sig[..64], rec_id)
        .map_err(|_| CryptoError::InvalidSignature)?;
    SECP256K1.recover_ecdsa(&msg, &sig).map_err(|_| CryptoError::InvalidSignature)
}

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-256 of a single input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256 over `inputs` followed by `auth_data`.
///
/// `auth_data` carries the EIP-8 size prefix for handshake messages and is
/// empty otherwise.
pub fn hmac_sha256(key: &[u8], inputs: &[&[u8]], auth_data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::InvalidLength)?;
    for input in inputs {
        mac.update(input);
    }
    mac.update(auth_data);
    Ok(mac.finalize().into_bytes().into())
}

/// NIST SP 800-56 concatenation KDF with SHA-256 and empty `SharedInfo`,
/// filling `dest` from `secret`.
pub fn kdf(secret: &[u8; 32], dest: &mut [u8]) -> Result<(), CryptoError> {
    concat_kdf::derive_key_into::<Sha256>(secret, &[], dest).map_err(|_| CryptoError::InvalidLength)
}

/// Encrypt one 16-byte block in place with AES-256 (the frame MAC whitening
/// step).
pub fn aes256_encrypt_block(key: &[u8; 32], block: &mut [u8; 16]) {
    use aes::cipher::{BlockEncrypt, KeyInit};
    let cipher = aes::Aes256Enc::new(key.into());
    cipher.encrypt_block(block.into());
}

/// XOR two equal-length byte arrays.
pub fn xor<const N: usize>(a: &[u8; N], b: &[u8; N]) -> [u8; N] {
    let mut out = [0u8; N];
    for i in 0..N {
        out[i] = a[i] ^ b[i];
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_ecdh_known_answer() {
        let secret = SecretKey::from_slice(&hex!(
            "202a36e24c3eb39513335ec99a7619bad0e7dc68d69401b016253c7d26dc92f8"
        ))
        .unwrap();
        let mut uncompressed = [0u8; 65];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(&hex!(
            "d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666"
        ));
        let public = PublicKey::from_slice(&uncompressed).unwrap();

        assert_eq!(
            ecdh_x(&public, &secret),
            hex!("821ce7e01ea11b111a52b2dafae8a3031a372d83bdf1a78109fa0783c2b9d5d3")
        );
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let (sk_a, pk_a) = keypair_generate();
        let (sk_b, pk_b) = keypair_generate();
        assert_eq!(ecdh_x(&pk_b, &sk_a), ecdh_x(&pk_a, &sk_b));
    }

    #[test]
    fn test_sign_recover_roundtrip() {
        let (secret, public) = keypair_generate();
        let digest = keccak256(&[b"message under test"]);

        let sig = ecdsa_sign(&secret, &digest).unwrap();
        let recovered = ecdsa_recover(&sig, &digest).unwrap();
        assert_eq!(recovered, public);

        // A different digest recovers a different key.
        let other = keccak256(&[b"another message"]);
        assert_ne!(ecdsa_recover(&sig, &other).ok(), Some(public));
    }

    #[test]
    fn test_recover_rejects_bad_recovery_id() {
        let (secret, _) = keypair_generate();
        let digest = [0x11u8; 32];
        let mut sig = ecdsa_sign(&secret, &digest).unwrap();
        sig[64] = 9;
        assert_eq!(ecdsa_recover(&sig, &digest), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn test_keccak256_known_answer() {
        assert_eq!(
            keccak256(&[]),
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
        // Concatenation matches a single-buffer hash.
        assert_eq!(keccak256(&[b"ab", b"cd"]), keccak256(&[b"abcd"]));
    }

    #[test]
    fn test_kdf_deterministic() {
        let secret = [0x42u8; 32];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        kdf(&secret, &mut a).unwrap();
        kdf(&secret, &mut b).unwrap();
        assert_eq!(a, b);
        assert_ne!(a[..16], a[16..]);

        let mut c = [0u8; 32];
        kdf(&[0x43u8; 32], &mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_hmac_includes_auth_data() {
        let key = [7u8; 32];
        let with = hmac_sha256(&key, &[b"payload"], &[0x01, 0x02]).unwrap();
        let without = hmac_sha256(&key, &[b"payload"], &[]).unwrap();
        assert_ne!(with, without);

        // Split inputs hash the same as their concatenation.
        let joined = hmac_sha256(&key, &[b"pay", b"load"], &[0x01, 0x02]).unwrap();
        assert_eq!(with, joined);
    }

    #[test]
    fn test_aes256_block_known_answer() {
        let key = [0u8; 32];
        let mut block = [0u8; 16];
        aes256_encrypt_block(&key, &mut block);
        assert_eq!(block, hex!("dc95c078a2408989ad48a21492842087"));
    }

    #[test]
    fn test_xor() {
        let a = [0xffu8; 4];
        let b = [0x0fu8; 4];
        assert_eq!(xor(&a, &b), [0xf0u8; 4]);
    }

    #[test]
    fn test_static_keys_from_secret_slice() {
        let keys = StaticKeys::from_secret_slice(&[0x11u8; 32]).unwrap();
        assert_eq!(keys.public, PublicKey::from_secret_key(SECP256K1, &keys.secret));
        assert_eq!(StaticKeys::from_secret_slice(&[0u8; 32]).err(), Some(CryptoError::InvalidPoint));
    }
}
