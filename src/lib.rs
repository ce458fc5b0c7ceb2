//! RLPx Peer Session Core
//!
//! The component of a DevP2P node that owns a single TCP connection to one
//! remote peer: the ECIES/EIP-8 encrypted handshake, the continuously-keyed
//! frame stream with its rolling MACs, packet multiplexing over the frames,
//! and fan-out of decoded packets to subscribers.
//!
//! Peer discovery, chain state, and block synchronization live elsewhere;
//! this crate only exposes the session hooks they attach to.

pub mod config;
pub mod crypto;
pub mod ecies;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod rlp;
pub mod session;
pub mod subscriber;

pub use config::{NodeConfig, SessionConfig};
pub use crypto::StaticKeys;
pub use message::{Capability, DisconnectReason, Message, PacketAction};
pub use peer::{Peer, PeerId};
pub use session::{dial, listen, SessionError, SessionHandle};
pub use subscriber::{Subscriber, SubscriberToken};
