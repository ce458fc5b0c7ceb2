//! Peer Identity and Endpoint
//!
//! A peer is a remote endpoint identified by `(host, port, public key)`.
//! The public key travels on the wire as a 64-byte uncompressed secp256k1
//! point without the `0x04` prefix; enode URLs carry it as 128 hex digits.

use crate::crypto::CryptoError;
use secp256k1::PublicKey;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// Size of a wire-format peer id.
pub const PEER_ID_SIZE: usize = 64;

/// Errors from parsing peer identifiers.
#[derive(Debug, Error)]
pub enum PeerParseError {
    #[error("invalid peer id: {0}")]
    InvalidId(String),

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("expected <128 hex digits>@host:port")]
    BadFormat,
}

/// A remote node's public key in wire format (uncompressed point, no
/// `0x04` prefix).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Wrap raw id bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the id from a secp256k1 public key.
    pub fn from_public_key(public: &PublicKey) -> Self {
        let uncompressed = public.serialize_uncompressed();
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes.copy_from_slice(&uncompressed[1..]);
        Self(bytes)
    }

    /// Reconstruct the secp256k1 public key, validating the point.
    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        let mut uncompressed = [0u8; PEER_ID_SIZE + 1];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&uncompressed).map_err(|_| CryptoError::InvalidPoint)
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("enode://").unwrap_or(s);
        let raw = hex::decode(s).map_err(|e| PeerParseError::InvalidId(e.to_string()))?;
        let bytes: [u8; PEER_ID_SIZE] = raw
            .try_into()
            .map_err(|_| PeerParseError::InvalidId("expected 64 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// A remote endpoint for one session.
///
/// Dialed peers carry their id from the start; inbound peers learn it from
/// the auth message. Once set, the id is immutable for the session's life.
#[derive(Clone, Debug)]
pub struct Peer {
    addr: SocketAddr,
    id: Option<PeerId>,
}

impl Peer {
    /// A dialed peer with a known identity.
    pub fn new(addr: SocketAddr, id: PeerId) -> Self {
        Self { addr, id: Some(id) }
    }

    /// An inbound peer whose identity is not yet known.
    pub fn inbound(addr: SocketAddr) -> Self {
        Self { addr, id: None }
    }

    /// Parse an `enode://<id>@host:port` URL (the scheme is optional).
    pub fn from_enode(s: &str) -> Result<Self, PeerParseError> {
        let s = s.strip_prefix("enode://").unwrap_or(s);
        let (id_part, addr_part) = s.split_once('@').ok_or(PeerParseError::BadFormat)?;
        let id: PeerId = id_part.parse()?;
        let addr: SocketAddr = addr_part
            .parse()
            .map_err(|_| PeerParseError::InvalidAddress(addr_part.into()))?;
        Ok(Self::new(addr, id))
    }

    /// The socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer id, if known.
    pub fn id(&self) -> Option<PeerId> {
        self.id
    }

    /// Record the identity learned from an inbound auth message.
    pub fn set_id(&mut self, id: PeerId) {
        self.id = Some(id);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}@{}", id, self.addr),
            None => write!(f, "?@{}", self.addr),
        }
    }
}
