//! RLPx Handshake
//!
//! Builds and parses the `auth` and `ack` messages that bootstrap a
//! session, and derives the symmetric frame secrets once both sides hold
//! the raw message bytes.
//!
//! ```text
//! initiator                                responder
//!     |-- auth: sig ‖ pubkey ‖ nonce ‖ v ----->|
//!     |<- ack: eph-pubkey ‖ nonce ‖ v ---------|
//! ```
//!
//! Both records are RLP lists wrapped in the EIP-8 envelope
//! `[size:u16 BE][ECIES ciphertext]` with the size prefix authenticated as
//! ECIES associated data, and padded with 100-300 zero bytes before
//! encryption so they are distinguishable from pre-EIP-8 handshakes.
//! Decoding ignores trailing list elements for forward compatibility.

use crate::crypto::{self, StaticKeys, SIGNATURE_SIZE};
use crate::ecies::{self, EciesError, ECIES_OVERHEAD};
use crate::framing::Secrets;
use crate::peer::PeerId;
use crate::rlp::{self, RlpError};
use rand::Rng;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use thiserror::Error;

/// RLPx ECIES protocol version carried in both records.
const PROTOCOL_VERSION: u8 = 4;

/// Upper bound on a wrapped handshake message; anything larger is a
/// protocol violation rather than a slow read.
pub const MAX_HANDSHAKE_MESSAGE: usize = 2048;

/// Errors from the handshake. All are fatal for the session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake decryption failed: {0}")]
    DecryptFailed(#[from] EciesError),

    #[error("invalid handshake rlp: {0}")]
    BadRlp(#[from] RlpError),

    #[error("handshake signature does not recover a valid key")]
    BadSignature,

    #[error("handshake message truncated")]
    ShortRead,

    #[error("handshake protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl From<crypto::CryptoError> for HandshakeError {
    fn from(_: crypto::CryptoError) -> Self {
        HandshakeError::BadSignature
    }
}

/// Side of the handshake this node plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We dialed and send the auth message.
    Initiator,
    /// They dialed; we answer with the ack.
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Length of one complete EIP-8 envelope at the front of `buf`, if fully
/// buffered.
///
/// Returns `Ok(None)` while the prefix or body is incomplete. The size is
/// validated against [`MAX_HANDSHAKE_MESSAGE`] before waiting for the body,
/// so a hostile length cannot stall the session.
pub fn envelope_len(buf: &[u8]) -> Result<Option<usize>, HandshakeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if size <= ECIES_OVERHEAD || size > MAX_HANDSHAKE_MESSAGE {
        return Err(HandshakeError::ProtocolViolation("handshake envelope size out of range"));
    }
    if buf.len() < 2 + size {
        return Ok(None);
    }
    Ok(Some(2 + size))
}

// ============================================================================
// Wire records
// ============================================================================

/// Plaintext auth record: `[signature, initiator-pubkey, nonce, version]`.
struct AuthMsg {
    signature: [u8; SIGNATURE_SIZE],
    initiator_id: PeerId,
    nonce: [u8; 32],
    version: u8,
}

impl AuthMsg {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        rlp::encode_list(&mut out, |p| {
            rlp::encode_bytes(p, &self.signature);
            rlp::encode_bytes(p, self.initiator_id.as_bytes());
            rlp::encode_bytes(p, &self.nonce);
            rlp::encode_uint(p, self.version as u128);
        });
        out
    }

    fn decode(plain: &[u8]) -> Result<Self, HandshakeError> {
        let (item, _padding) = rlp::split_first(plain)?;
        let mut fields = item.list()?;
        let signature = fields.next_item()?.fixed::<SIGNATURE_SIZE>()?;
        let initiator_id = PeerId::from_bytes(fields.next_item()?.fixed::<64>()?);
        let nonce = fields.next_item()?.fixed::<32>()?;
        let version = fields.next_item()?.u8()?;
        Ok(Self { signature, initiator_id, nonce, version })
    }
}

/// Plaintext ack record: `[recipient-ephemeral-pubkey, nonce, version]`.
struct AckMsg {
    ephemeral_id: PeerId,
    nonce: [u8; 32],
    version: u8,
}

impl AckMsg {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        rlp::encode_list(&mut out, |p| {
            rlp::encode_bytes(p, self.ephemeral_id.as_bytes());
            rlp::encode_bytes(p, &self.nonce);
            rlp::encode_uint(p, self.version as u128);
        });
        out
    }

    fn decode(plain: &[u8]) -> Result<Self, HandshakeError> {
        let (item, _padding) = rlp::split_first(plain)?;
        let mut fields = item.list()?;
        let ephemeral_id = PeerId::from_bytes(fields.next_item()?.fixed::<64>()?);
        let nonce = fields.next_item()?.fixed::<32>()?;
        let version = fields.next_item()?.u8()?;
        Ok(Self { ephemeral_id, nonce, version })
    }
}

// ============================================================================
// Handshake state
// ============================================================================

/// In-progress handshake for one session.
///
/// Owns the ephemeral key pair and nonce, both of which die with this value
/// when [`Handshake::into_secrets`] consumes it.
pub struct Handshake {
    role: Role,
    static_keys: StaticKeys,
    remote_public: Option<PublicKey>,
    ephemeral_secret: SecretKey,
    ephemeral_public: PublicKey,
    nonce: [u8; 32],
    remote_nonce: Option<[u8; 32]>,
    remote_ephemeral: Option<PublicKey>,
    /// The wrapped message we sent (auth for initiator, ack for responder).
    init_msg: Option<Vec<u8>>,
    /// The wrapped message we received.
    remote_init_msg: Option<Vec<u8>>,
}

impl Handshake {
    fn new(
        role: Role,
        static_keys: StaticKeys,
        remote_public: Option<PublicKey>,
        nonce: [u8; 32],
        ephemeral_secret: SecretKey,
    ) -> Self {
        let ephemeral_public = PublicKey::from_secret_key(SECP256K1, &ephemeral_secret);
        Self {
            role,
            static_keys,
            remote_public,
            ephemeral_secret,
            ephemeral_public,
            nonce,
            remote_nonce: None,
            remote_ephemeral: None,
            init_msg: None,
            remote_init_msg: None,
        }
    }

    /// Start as the dialing side, which knows the remote static key.
    pub fn initiator(static_keys: StaticKeys, remote_public: PublicKey) -> Self {
        let mut rng = rand::thread_rng();
        let nonce: [u8; 32] = rng.gen();
        let ephemeral_secret = SecretKey::new(&mut rng);
        Self::new(Role::Initiator, static_keys, Some(remote_public), nonce, ephemeral_secret)
    }

    /// Start as the listening side; the remote identity arrives in the auth.
    pub fn responder(static_keys: StaticKeys) -> Self {
        let mut rng = rand::thread_rng();
        let nonce: [u8; 32] = rng.gen();
        let ephemeral_secret = SecretKey::new(&mut rng);
        Self::new(Role::Responder, static_keys, None, nonce, ephemeral_secret)
    }

    /// Deterministic construction for vector tests.
    #[cfg(test)]
    pub(crate) fn with_materials(
        role: Role,
        static_keys: StaticKeys,
        remote_public: Option<PublicKey>,
        nonce: [u8; 32],
        ephemeral_secret: SecretKey,
    ) -> Self {
        Self::new(role, static_keys, remote_public, nonce, ephemeral_secret)
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The remote static key, once known.
    pub fn remote_public(&self) -> Option<&PublicKey> {
        self.remote_public.as_ref()
    }

    fn require_remote(&self) -> Result<&PublicKey, HandshakeError> {
        self.remote_public
            .as_ref()
            .ok_or(HandshakeError::ProtocolViolation("remote static key not yet known"))
    }

    /// ECIES-wrap a plaintext record into the EIP-8 envelope.
    fn wrap(&self, mut plain: Vec<u8>) -> Result<Vec<u8>, HandshakeError> {
        let remote = self.require_remote()?;

        // EIP-8 padding keeps the message distinguishable from the legacy
        // fixed-size handshake.
        let padding = rand::thread_rng().gen_range(100..=300);
        plain.resize(plain.len() + padding, 0);

        let size = (plain.len() + ECIES_OVERHEAD) as u16;
        let size_prefix = size.to_be_bytes();
        let body = ecies::encrypt(remote, &plain, &size_prefix)?;

        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&size_prefix);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// ECIES-unwrap a complete envelope (prefix included).
    fn unwrap(&self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if message.len() < 2 + ECIES_OVERHEAD {
            return Err(HandshakeError::ShortRead);
        }
        let (size_prefix, body) = message.split_at(2);
        let size = u16::from_be_bytes([size_prefix[0], size_prefix[1]]) as usize;
        if body.len() != size {
            return Err(HandshakeError::ShortRead);
        }
        Ok(ecies::decrypt(&self.static_keys.secret, body, size_prefix)?)
    }

    /// Build the wrapped auth message (initiator only).
    pub fn write_auth(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.role != Role::Initiator {
            return Err(HandshakeError::ProtocolViolation("responder cannot send auth"));
        }
        let remote = self.require_remote()?;

        // Sign static-shared-secret XOR nonce with the ephemeral key so the
        // responder can recover our ephemeral public key.
        let shared_x = crypto::ecdh_x(remote, &self.static_keys.secret);
        let digest = crypto::xor(&shared_x, &self.nonce);
        let signature = crypto::ecdsa_sign(&self.ephemeral_secret, &digest)?;

        let auth = AuthMsg {
            signature,
            initiator_id: PeerId::from_public_key(&self.static_keys.public),
            nonce: self.nonce,
            version: PROTOCOL_VERSION,
        };

        let wrapped = self.wrap(auth.encode())?;
        self.init_msg = Some(wrapped.clone());
        Ok(wrapped)
    }

    /// Parse a wrapped auth message and recover the initiator's ephemeral
    /// key (responder only).
    pub fn read_auth(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        if self.role != Role::Responder {
            return Err(HandshakeError::ProtocolViolation("initiator cannot receive auth"));
        }

        let plain = self.unwrap(message)?;
        let auth = AuthMsg::decode(&plain)?;

        let remote_public = auth
            .initiator_id
            .to_public_key()
            .map_err(|_| HandshakeError::ProtocolViolation("auth carries an invalid public key"))?;

        let shared_x = crypto::ecdh_x(&remote_public, &self.static_keys.secret);
        let digest = crypto::xor(&shared_x, &auth.nonce);
        let remote_ephemeral = crypto::ecdsa_recover(&auth.signature, &digest)
            .map_err(|_| HandshakeError::BadSignature)?;

        self.remote_public = Some(remote_public);
        self.remote_nonce = Some(auth.nonce);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_init_msg = Some(message.to_vec());
        Ok(())
    }

    /// Build the wrapped ack message (responder only, after `read_auth`).
    pub fn write_ack(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.role != Role::Responder {
            return Err(HandshakeError::ProtocolViolation("initiator cannot send ack"));
        }

        let ack = AckMsg {
            ephemeral_id: PeerId::from_public_key(&self.ephemeral_public),
            nonce: self.nonce,
            version: PROTOCOL_VERSION,
        };

        let wrapped = self.wrap(ack.encode())?;
        self.init_msg = Some(wrapped.clone());
        Ok(wrapped)
    }

    /// Parse a wrapped ack message (initiator only).
    pub fn read_ack(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        if self.role != Role::Initiator {
            return Err(HandshakeError::ProtocolViolation("responder cannot receive ack"));
        }

        let plain = self.unwrap(message)?;
        let ack = AckMsg::decode(&plain)?;

        let remote_ephemeral = ack
            .ephemeral_id
            .to_public_key()
            .map_err(|_| HandshakeError::ProtocolViolation("ack carries an invalid ephemeral key"))?;

        self.remote_nonce = Some(ack.nonce);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_init_msg = Some(message.to_vec());
        Ok(())
    }

    /// Derive `(aes_secret, mac_secret)` from the completed key exchange.
    fn derive_keys(&self) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
        let remote_ephemeral = self
            .remote_ephemeral
            .as_ref()
            .ok_or(HandshakeError::ProtocolViolation("handshake not complete"))?;
        let remote_nonce = self
            .remote_nonce
            .ok_or(HandshakeError::ProtocolViolation("handshake not complete"))?;

        let ephemeral_shared = crypto::ecdh_x(remote_ephemeral, &self.ephemeral_secret);

        let (recipient_nonce, initiator_nonce) = match self.role {
            Role::Initiator => (remote_nonce, self.nonce),
            Role::Responder => (self.nonce, remote_nonce),
        };

        let hashed_nonces = crypto::keccak256(&[&recipient_nonce, &initiator_nonce]);
        let shared_secret = crypto::keccak256(&[&ephemeral_shared, &hashed_nonces]);
        let aes_secret = crypto::keccak256(&[&ephemeral_shared, &shared_secret]);
        let mac_secret = crypto::keccak256(&[&ephemeral_shared, &aes_secret]);
        Ok((aes_secret, mac_secret))
    }

    /// Consume the handshake and produce the session's symmetric state.
    ///
    /// The egress MAC starts from `(mac-secret ^ remote-nonce) ‖ our-init-msg`,
    /// the ingress MAC from `(mac-secret ^ our-nonce) ‖ their-init-msg`;
    /// the naming already swaps per role, so this holds for both sides.
    pub fn into_secrets(self) -> Result<Secrets, HandshakeError> {
        let (aes_secret, mac_secret) = self.derive_keys()?;

        let remote_nonce =
            self.remote_nonce.ok_or(HandshakeError::ProtocolViolation("handshake not complete"))?;
        let init_msg = self
            .init_msg
            .as_deref()
            .ok_or(HandshakeError::ProtocolViolation("own handshake message never sent"))?;
        let remote_init_msg = self
            .remote_init_msg
            .as_deref()
            .ok_or(HandshakeError::ProtocolViolation("remote handshake message never seen"))?;

        let mut secrets = Secrets::new(aes_secret, mac_secret);
        secrets.seed_egress(&crypto::xor(&mac_secret, &remote_nonce));
        secrets.seed_egress(init_msg);
        secrets.seed_ingress(&crypto::xor(&mac_secret, &self.nonce));
        secrets.seed_ingress(remote_init_msg);
        Ok(secrets)
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("has_remote_public", &self.remote_public.is_some())
            .field("has_remote_ephemeral", &self.remote_ephemeral.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
