//! Subscriber Fan-out
//!
//! Delivers decoded packets to registered observers. Fan-out is
//! fire-and-forget: each subscriber gets its own forwarding task fed by an
//! unbounded channel, so a slow or panicking subscriber can neither block
//! frame processing nor corrupt the session. Packets reach a single
//! subscriber in arrival order; ordering across subscribers is unspecified.

use crate::message::Message;
use crate::peer::Peer;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something that can be given a packet and the peer it came from.
///
/// Closures, trait objects, and channel senders all qualify.
pub trait Subscriber: Send + Sync {
    fn on_packet(&self, packet: &Message, peer: &Peer);
}

impl<F> Subscriber for F
where
    F: Fn(&Message, &Peer) + Send + Sync,
{
    fn on_packet(&self, packet: &Message, peer: &Peer) {
        self(packet, peer)
    }
}

/// A subscriber that forwards every packet into an unbounded channel.
pub fn channel_subscriber() -> (Arc<dyn Subscriber>, mpsc::UnboundedReceiver<(Message, Peer)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = Arc::new(move |packet: &Message, peer: &Peer| {
        let _ = tx.send((packet.clone(), peer.clone()));
    });
    (subscriber, rx)
}

/// Opaque handle identifying one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberToken(u64);

/// The set of subscribers attached to one session.
///
/// The session only ever holds the delivery channels; after `remove` the
/// subscriber itself is never touched again.
#[derive(Default)]
pub struct SubscriberSet {
    next_token: u64,
    entries: Vec<(SubscriberToken, mpsc::UnboundedSender<(Message, Peer)>)>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a subscriber, spawning its forwarding task.
    ///
    /// Must run inside a tokio runtime.
    pub fn add(&mut self, subscriber: Arc<dyn Subscriber>) -> SubscriberToken {
        let token = SubscriberToken(self.next_token);
        self.next_token += 1;

        let (tx, mut rx) = mpsc::unbounded_channel::<(Message, Peer)>();
        tokio::spawn(async move {
            while let Some((packet, peer)) = rx.recv().await {
                subscriber.on_packet(&packet, &peer);
            }
        });

        self.entries.push((token, tx));
        token
    }

    /// Drop a registration. The forwarding task ends once it drains.
    pub fn remove(&mut self, token: SubscriberToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(t, _)| *t != token);
        before != self.entries.len()
    }

    /// Hand a packet to every subscriber without waiting on any of them.
    pub fn fanout(&mut self, packet: &Message, peer: &Peer) {
        self.entries.retain(|(_, tx)| tx.send((packet.clone(), peer.clone())).is_ok());
    }
}

// ============================================================================
// Tests
// ============================================================================
