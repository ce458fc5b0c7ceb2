//! RLPx Frame Codec
//!
//! Encrypts and decrypts the framed message stream that follows the
//! handshake. Every frame is:
//!
//! ```text
//! header-ciphertext(16) ‖ header-mac(16) ‖ body-ciphertext(pad16) ‖ body-mac(16)
//! ```
//!
//! The header plaintext is `[size:3 BE][rlp([0,0])][zero pad]` where `size`
//! covers the RLP-encoded packet type plus the packet body, excluding
//! padding and MACs.
//!
//! The ingress and egress MAC states are Keccak sponges that live for the
//! whole session and are re-keyed on every frame section: each absorption is
//! whitened with an AES-256-ECB encryption of the current digest. The update
//! order (seed-then-digest for the header, absorb-then-seed for the body)
//! is load-bearing; both sides advance their sponges in lock-step with the
//! wire and a mismatch is fatal for the session.

use crate::crypto::{self, Aes256Ctr};
use crate::rlp;
use aes::cipher::{KeyIvInit, StreamCipher};
use bytes::{Buf, BytesMut};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Encrypted header plus its MAC.
pub const HEADER_LEN: usize = 32;

/// Length of a frame section MAC.
pub const MAC_LEN: usize = 16;

/// Largest frame-data size encodable in the 24-bit header field.
pub const MAX_FRAME_DATA: usize = (1 << 24) - 1;

/// Errors from frame encoding and decoding. All are fatal for the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame mac mismatch")]
    MacMismatch,

    #[error("frame data too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid packet type prefix")]
    BadPacketType,
}

// ============================================================================
// Rolling MAC
// ============================================================================

/// One direction's rolling frame MAC.
///
/// Holds the Keccak sponge across frames; the sponge is never rebuilt, only
/// advanced. `digest` clones the sponge so reading the current MAC does not
/// consume state.
#[derive(Clone)]
pub struct FrameMac {
    secret: [u8; 32],
    sponge: sha3::Keccak256,
}

impl FrameMac {
    /// Start a MAC keyed by `mac_secret`; the handshake seeds the sponge
    /// with the nonce XOR and init-message bytes afterwards.
    pub fn new(secret: [u8; 32]) -> Self {
        use sha3::Digest;
        Self { secret, sponge: sha3::Keccak256::new() }
    }

    /// Absorb raw bytes (handshake seeding only).
    pub fn absorb(&mut self, data: &[u8]) {
        use sha3::Digest;
        self.sponge.update(data);
    }

    /// The current 16-byte MAC value.
    pub fn digest(&self) -> [u8; MAC_LEN] {
        use sha3::Digest;
        let full: [u8; 32] = self.sponge.clone().finalize().into();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&full[..MAC_LEN]);
        out
    }

    /// Advance the sponge for a header: absorb
    /// `AES-256(secret, digest) XOR header_ciphertext`.
    pub fn update_header(&mut self, header_ciphertext: &[u8; 16]) {
        let mut seed = self.digest();
        crypto::aes256_encrypt_block(&self.secret, &mut seed);
        self.absorb(&crypto::xor(&seed, header_ciphertext));
    }

    /// Advance the sponge for a body: absorb the ciphertext, then absorb
    /// `AES-256(secret, digest) XOR digest`.
    pub fn update_body(&mut self, body_ciphertext: &[u8]) {
        self.absorb(body_ciphertext);
        let prev = self.digest();
        let mut seed = prev;
        crypto::aes256_encrypt_block(&self.secret, &mut seed);
        self.absorb(&crypto::xor(&seed, &prev));
    }
}

impl std::fmt::Debug for FrameMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMac").field("digest", &hex::encode(self.digest())).finish()
    }
}

// ============================================================================
// Session secrets
// ============================================================================

/// Symmetric state derived from a completed handshake.
///
/// The two CTR streams share `aes_secret` with a zero IV and stay in sync
/// with the wire across frames. Invalid or partial input never advances any
/// of this state.
pub struct Secrets {
    aes_secret: [u8; 32],
    mac_secret: [u8; 32],
    ingress_aes: Aes256Ctr,
    egress_aes: Aes256Ctr,
    ingress_mac: FrameMac,
    egress_mac: FrameMac,
}

impl Secrets {
    /// Build fresh symmetric state; the caller seeds the MAC sponges.
    pub fn new(aes_secret: [u8; 32], mac_secret: [u8; 32]) -> Self {
        let iv = [0u8; 16];
        Self {
            aes_secret,
            mac_secret,
            ingress_aes: Aes256Ctr::new(&aes_secret.into(), &iv.into()),
            egress_aes: Aes256Ctr::new(&aes_secret.into(), &iv.into()),
            ingress_mac: FrameMac::new(mac_secret),
            egress_mac: FrameMac::new(mac_secret),
        }
    }

    /// Seed the egress MAC (handshake initialization).
    pub fn seed_egress(&mut self, data: &[u8]) {
        self.egress_mac.absorb(data);
    }

    /// Seed the ingress MAC (handshake initialization).
    pub fn seed_ingress(&mut self, data: &[u8]) {
        self.ingress_mac.absorb(data);
    }

    /// The MAC key (for key-material comparisons in tests and logs of
    /// fingerprints, never the key itself).
    pub fn mac_secret(&self) -> &[u8; 32] {
        &self.mac_secret
    }

    /// The frame stream key.
    pub fn aes_secret(&self) -> &[u8; 32] {
        &self.aes_secret
    }

    /// Current egress MAC digest.
    pub fn egress_digest(&self) -> [u8; MAC_LEN] {
        self.egress_mac.digest()
    }

    /// Current ingress MAC digest.
    pub fn ingress_digest(&self) -> [u8; MAC_LEN] {
        self.ingress_mac.digest()
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("ingress_mac", &self.ingress_mac)
            .field("egress_mac", &self.egress_mac)
            .finish()
    }
}

// ============================================================================
// Frame codec
// ============================================================================

/// Decoder position within the current inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    /// Waiting for 32 header bytes.
    Header,
    /// Header consumed; waiting for the padded body of `size` data bytes
    /// plus the body MAC.
    Body { size: usize },
}

/// Stateful frame encoder/decoder for one session.
///
/// Decoding is incremental: [`FrameCodec::read_frame`] consumes whole
/// sections from the buffer and returns `Ok(None)` while a section is
/// incomplete, leaving both the buffer remainder and all MAC/CTR state
/// untouched until enough bytes arrive.
pub struct FrameCodec {
    secrets: Secrets,
    state: ReadState,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        Self { secrets, state: ReadState::Header }
    }

    /// Encrypt one `(packet_type, body)` frame.
    pub fn write_frame(&mut self, packet_type: u8, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut frame_data = Vec::with_capacity(1 + body.len());
        rlp::encode_uint(&mut frame_data, packet_type as u128);
        frame_data.extend_from_slice(body);

        let size = frame_data.len();
        if size > MAX_FRAME_DATA {
            return Err(FrameError::BodyTooLarge(size));
        }

        // Header plaintext: 24-bit size, rlp([0, 0]), zero padding.
        let mut header = [0u8; 16];
        header[0] = (size >> 16) as u8;
        header[1] = (size >> 8) as u8;
        header[2] = size as u8;
        header[3..6].copy_from_slice(&[0xc2, 0x80, 0x80]);

        self.secrets.egress_aes.apply_keystream(&mut header);
        self.secrets.egress_mac.update_header(&header);
        let header_mac = self.secrets.egress_mac.digest();

        let padded = size.next_multiple_of(16);
        frame_data.resize(padded, 0);
        self.secrets.egress_aes.apply_keystream(&mut frame_data);
        self.secrets.egress_mac.update_body(&frame_data);
        let body_mac = self.secrets.egress_mac.digest();

        let mut out = Vec::with_capacity(HEADER_LEN + padded + MAC_LEN);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header_mac);
        out.extend_from_slice(&frame_data);
        out.extend_from_slice(&body_mac);
        Ok(out)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet hold a complete
    /// section. A MAC mismatch is fatal: the state is poisoned by design and
    /// the session must close.
    pub fn read_frame(&mut self, buf: &mut BytesMut) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        if self.state == ReadState::Header {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let mut header: [u8; 16] = buf[..16].try_into().expect("sliced 16 bytes");
            let wire_mac: [u8; MAC_LEN] = buf[16..32].try_into().expect("sliced 16 bytes");

            self.secrets.ingress_mac.update_header(&header);
            let expected = self.secrets.ingress_mac.digest();
            if !bool::from(expected[..].ct_eq(&wire_mac[..])) {
                return Err(FrameError::MacMismatch);
            }

            self.secrets.ingress_aes.apply_keystream(&mut header);
            let size = (header[0] as usize) << 16 | (header[1] as usize) << 8 | header[2] as usize;
            buf.advance(HEADER_LEN);
            self.state = ReadState::Body { size };
        }

        let ReadState::Body { size } = self.state else {
            return Ok(None);
        };

        let padded = size.next_multiple_of(16);
        if buf.len() < padded + MAC_LEN {
            return Ok(None);
        }

        let wire_mac: [u8; MAC_LEN] =
            buf[padded..padded + MAC_LEN].try_into().expect("sliced 16 bytes");
        self.secrets.ingress_mac.update_body(&buf[..padded]);
        let expected = self.secrets.ingress_mac.digest();
        if !bool::from(expected[..].ct_eq(&wire_mac[..])) {
            return Err(FrameError::MacMismatch);
        }

        let mut frame_data = buf[..padded].to_vec();
        self.secrets.ingress_aes.apply_keystream(&mut frame_data);
        frame_data.truncate(size);
        buf.advance(padded + MAC_LEN);
        self.state = ReadState::Header;

        let (type_item, body) = rlp::split_first(&frame_data).map_err(|_| FrameError::BadPacketType)?;
        let packet_type = type_item.u8().map_err(|_| FrameError::BadPacketType)?;
        Ok(Some((packet_type, body.to_vec())))
    }
}

// ============================================================================
// Tests
// ============================================================================
