//! Peer Session Actor
//!
//! One session owns one TCP connection to one remote peer. All state (the
//! socket, handshake, frame codec, MAC/CTR streams, and subscriber list)
//! lives inside a single spawned task that serializes every event: socket
//! bytes, caller commands, the pinger, and the deferred-send timer. Callers
//! interact only through the [`SessionHandle`] command queue, so no two
//! sends can interleave bytes on the wire or advance the egress state
//! concurrently.
//!
//! ## State machine
//!
//! ```text
//! Handshaking --ack/auth--> FrameReady --Hello exchanged--> Active --+
//!      |                        |                                    |
//!      +------- fatal error / transport loss / Disconnect -----------+--> Closed
//! ```
//!
//! `FrameReady` means secrets exist but `Hello` has not been exchanged; the
//! session sends its own `Hello` the moment it enters this state.
//! Application packets submitted earlier are deferred on a ~500 ms timer
//! rather than written, since most peers treat a pre-`Hello` application
//! packet as a protocol violation.

use crate::config::SessionConfig;
use crate::framing::FrameCodec;
use crate::handshake::{self, Handshake, Role};
use crate::message::{DisconnectReason, Message, MessageError, PacketAction};
use crate::peer::{Peer, PeerId};
use crate::subscriber::{Subscriber, SubscriberSet, SubscriberToken};
use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Liveness probe interval.
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// How long a pre-`Hello` application packet waits before retrying.
const DEFERRED_SEND_DELAY: Duration = Duration::from_millis(500);

/// Grace period after sending `Disconnect`, so it leaves the socket before
/// the write half drops.
const DISCONNECT_GRACE: Duration = Duration::from_millis(50);

/// Depth of the caller command queue.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Errors surfaced through the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("peer identity is missing or invalid")]
    BadPeerId,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Raw handshake bytes are the only valid traffic.
    Handshaking,
    /// Secrets exist; our `Hello` is out, theirs has not arrived.
    FrameReady,
    /// Both sides exchanged `Hello`.
    Active,
    /// Terminal. No further frames are written.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::FrameReady => "frame_ready",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Caller work submitted to the session actor.
enum Command {
    Send(Message),
    Subscribe(Arc<dyn Subscriber>, oneshot::Sender<SubscriberToken>),
    Unsubscribe(SubscriberToken),
    Close(Option<DisconnectReason>),
}

/// Caller-side handle to a running session.
///
/// All methods enqueue work; `send_packet` returning does not mean the
/// packet has left the socket, only that the actor accepted it.
#[derive(Clone)]
pub struct SessionHandle {
    /// Shared with the actor, which fills in the id once an inbound auth
    /// message names the peer.
    peer: Arc<Mutex<Peer>>,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// The remote endpoint as currently known; inbound sessions gain their
    /// id once the auth message arrives.
    pub fn peer(&self) -> Peer {
        self.peer.lock().expect("peer lock poisoned").clone()
    }

    /// Enqueue a packet. Never blocks on socket I/O.
    pub async fn send_packet(&self, message: Message) -> Result<(), SessionError> {
        self.commands.send(Command::Send(message)).await.map_err(|_| SessionError::Closed)
    }

    /// Register a subscriber for decoded packets.
    pub async fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<SubscriberToken, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe(subscriber, reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Remove a previously registered subscriber.
    pub async fn unsubscribe(&self, token: SubscriberToken) -> Result<(), SessionError> {
        self.commands.send(Command::Unsubscribe(token)).await.map_err(|_| SessionError::Closed)
    }

    /// Close the session, optionally sending a `Disconnect` first.
    pub async fn close(&self, reason: Option<DisconnectReason>) -> Result<(), SessionError> {
        self.commands.send(Command::Close(reason)).await.map_err(|_| SessionError::Closed)
    }

    /// Whether the session actor has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait for the session actor to exit.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Dial a peer and spawn its session as the handshake initiator.
pub async fn dial(
    peer: Peer,
    config: Arc<SessionConfig>,
    subscribers: Vec<Arc<dyn Subscriber>>,
) -> Result<SessionHandle, SessionError> {
    let remote_public = peer
        .id()
        .ok_or(SessionError::BadPeerId)?
        .to_public_key()
        .map_err(|_| SessionError::BadPeerId)?;

    info!(peer = %peer, "dialing");
    let stream = TcpStream::connect(peer.addr()).await?;
    configure_stream(&stream)?;

    let handshake = Handshake::initiator(config.keys.clone(), remote_public);
    Ok(spawn_session(stream, peer, handshake, config, subscribers))
}

/// Adopt an accepted socket and spawn its session as the handshake
/// responder. The peer identity is learned from the auth message.
pub fn listen(
    stream: TcpStream,
    config: Arc<SessionConfig>,
    subscribers: Vec<Arc<dyn Subscriber>>,
) -> Result<SessionHandle, SessionError> {
    let peer = Peer::inbound(stream.peer_addr()?);
    configure_stream(&stream)?;
    info!(peer = %peer, "inbound connection accepted");

    let handshake = Handshake::responder(config.keys.clone());
    Ok(spawn_session(stream, peer, handshake, config, subscribers))
}

/// TCP options for a session socket, applied on both dial and accept.
fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Spawn the session actor over any byte stream.
///
/// `dial` and `listen` wrap this for TCP; tests drive it with in-process
/// duplex pipes.
pub fn spawn_session<S>(
    stream: S,
    peer: Peer,
    handshake: Handshake,
    config: Arc<SessionConfig>,
    subscribers: Vec<Arc<dyn Subscriber>>,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let shared_peer = Arc::new(Mutex::new(peer.clone()));
    let handle = SessionHandle { peer: shared_peer.clone(), commands: commands_tx };

    let (reader, writer) = tokio::io::split(stream);

    let mut subscriber_set = SubscriberSet::new();
    for subscriber in subscribers {
        subscriber_set.add(subscriber);
    }

    let session = Session {
        writer,
        peer,
        shared_peer,
        config,
        state: SessionState::Handshaking,
        handshake: Some(handshake),
        codec: None,
        ingress: BytesMut::new(),
        subscribers: subscriber_set,
        deferred: Vec::new(),
        retry_at: None,
    };
    tokio::spawn(session.run(reader, commands_rx));

    handle
}

// ============================================================================
// The actor
// ============================================================================

struct Session<S> {
    writer: WriteHalf<S>,
    peer: Peer,
    /// The handle-visible copy of `peer`, updated when the id is learned.
    shared_peer: Arc<Mutex<Peer>>,
    config: Arc<SessionConfig>,
    state: SessionState,
    /// Present until secrets are derived, then dropped with its ephemeral
    /// key material.
    handshake: Option<Handshake>,
    codec: Option<FrameCodec>,
    /// Bytes received but not yet consumed as a handshake message or frame.
    ingress: BytesMut,
    subscribers: SubscriberSet,
    /// Packets submitted before `Active`, waiting on the retry timer.
    deferred: Vec<Message>,
    retry_at: Option<Instant>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Session<S> {
    async fn run(
        mut self,
        mut reader: tokio::io::ReadHalf<S>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        // The initiator opens with the auth message; everything else waits
        // for bytes.
        if self.handshake.as_ref().map(Handshake::role) == Some(Role::Initiator) {
            match self.handshake.as_mut().and_then(|hs| hs.write_auth().ok()) {
                Some(auth) => {
                    if let Err(error) = self.writer.write_all(&auth).await {
                        warn!(peer = %self.peer, %error, "failed to send auth");
                        self.state = SessionState::Closed;
                    } else {
                        debug!(peer = %self.peer, bytes = auth.len(), "auth sent");
                    }
                }
                None => {
                    warn!(peer = %self.peer, "failed to build auth message");
                    self.state = SessionState::Closed;
                }
            }
        }

        let mut pinger = time::interval(PING_INTERVAL);
        pinger.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != SessionState::Closed {
            let retry_deadline =
                self.retry_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(peer = %self.peer, "all handles dropped, closing");
                        self.close_session(None).await;
                    }
                },

                result = reader.read_buf(&mut self.ingress) => match result {
                    Ok(0) => {
                        info!(peer = %self.peer, "transport closed by remote");
                        self.on_transport_closed();
                    }
                    Ok(n) => {
                        trace!(peer = %self.peer, bytes = n, "bytes received");
                        self.process_ingress().await;
                    }
                    Err(error) => {
                        warn!(peer = %self.peer, %error, "transport read error");
                        self.on_transport_closed();
                    }
                },

                _ = pinger.tick() => self.on_ping_tick().await,

                _ = time::sleep_until(retry_deadline), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.flush_deferred().await;
                }
            }
        }

        let _ = self.writer.shutdown().await;
        debug!(peer = %self.peer, "session task exiting");
    }

    // === Commands ===

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => self.send_packet(message).await,
            Command::Subscribe(subscriber, reply) => {
                let token = self.subscribers.add(subscriber);
                let _ = reply.send(token);
            }
            Command::Unsubscribe(token) => {
                if !self.subscribers.remove(token) {
                    debug!(peer = %self.peer, "unsubscribe for unknown token");
                }
            }
            Command::Close(reason) => self.close_session(reason).await,
        }
    }

    /// Send discipline: drop when closed, defer application packets until
    /// `Active`, otherwise frame and write.
    async fn send_packet(&mut self, message: Message) {
        if self.state == SessionState::Closed {
            info!(peer = %self.peer, packet = message.name(), "dropping send on closed session");
            return;
        }

        if self.state != SessionState::Active && !matches!(message, Message::Hello(_)) {
            debug!(peer = %self.peer, packet = message.name(), "session not active, deferring send");
            self.deferred.push(message);
            if self.retry_at.is_none() {
                self.retry_at = Some(Instant::now() + DEFERRED_SEND_DELAY);
            }
            return;
        }

        self.write_message(&message).await;
    }

    /// Retry deferred sends; they re-defer if the session is still not
    /// active, and drop if it closed in the meantime.
    async fn flush_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        if self.state == SessionState::Closed {
            debug!(peer = %self.peer, dropped = self.deferred.len(), "dropping deferred sends");
            self.deferred.clear();
            return;
        }
        let pending = std::mem::take(&mut self.deferred);
        for message in pending {
            self.send_packet(message).await;
        }
    }

    /// Frame and write one packet. Transport errors close the session.
    async fn write_message(&mut self, message: &Message) {
        if self.state == SessionState::Closed {
            return;
        }
        let Some(codec) = self.codec.as_mut() else {
            warn!(peer = %self.peer, packet = message.name(), "no frame secrets yet, dropping packet");
            return;
        };

        match codec.write_frame(message.id(), &message.encode_body()) {
            Ok(frame) => {
                if let Err(error) = self.writer.write_all(&frame).await {
                    warn!(peer = %self.peer, %error, "transport write error");
                    self.on_transport_closed();
                } else {
                    trace!(
                        peer = %self.peer,
                        packet = message.name(),
                        bytes = frame.len(),
                        "packet sent"
                    );
                }
            }
            Err(error) => {
                warn!(peer = %self.peer, %error, "frame encoding failed");
                Box::pin(self.close_session(None)).await;
            }
        }
    }

    // === Timers ===

    /// Liveness probe: a `Status` frame while active, a no-op otherwise.
    async fn on_ping_tick(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        trace!(peer = %self.peer, "sending liveness status");
        self.write_message(&Message::Status(self.config.status())).await;
    }

    // === Inbound path ===

    /// Drain the ingress buffer: one handshake envelope while handshaking,
    /// then whole frames until the remainder is incomplete.
    async fn process_ingress(&mut self) {
        loop {
            match self.state {
                SessionState::Handshaking => match handshake::envelope_len(&self.ingress) {
                    Ok(None) => return,
                    Ok(Some(len)) => {
                        let message = self.ingress.split_to(len);
                        if let Err(error) = self.on_handshake_message(&message).await {
                            warn!(peer = %self.peer, %error, "handshake failed");
                            self.close_session(None).await;
                            return;
                        }
                        // Leftover bytes may already hold the peer's first
                        // frames; fall through to the frame path.
                    }
                    Err(error) => {
                        warn!(peer = %self.peer, %error, "handshake framing violation");
                        self.close_session(None).await;
                        return;
                    }
                },

                SessionState::FrameReady | SessionState::Active => {
                    let Some(codec) = self.codec.as_mut() else { return };
                    match codec.read_frame(&mut self.ingress) {
                        Ok(None) => return,
                        Ok(Some((packet_type, body))) => {
                            self.dispatch(packet_type, &body).await;
                        }
                        Err(error) => {
                            warn!(peer = %self.peer, %error, "frame decoding failed");
                            self.close_session(None).await;
                            return;
                        }
                    }
                }

                SessionState::Closed => return,
            }
        }
    }

    /// Consume the one handshake message this side expects, derive secrets,
    /// and send our `Hello`.
    async fn on_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<(), handshake::HandshakeError> {
        let Some(mut hs) = self.handshake.take() else {
            return Err(handshake::HandshakeError::ProtocolViolation(
                "handshake message after completion",
            ));
        };

        match hs.role() {
            Role::Initiator => {
                hs.read_ack(message)?;
                debug!(peer = %self.peer, "ack received");
            }
            Role::Responder => {
                hs.read_auth(message)?;
                if let Some(public) = hs.remote_public() {
                    let id = PeerId::from_public_key(public);
                    self.peer.set_id(id);
                    self.shared_peer.lock().expect("peer lock poisoned").set_id(id);
                }
                debug!(peer = %self.peer, "auth received");

                let ack = hs.write_ack()?;
                if let Err(error) = self.writer.write_all(&ack).await {
                    warn!(peer = %self.peer, %error, "failed to send ack");
                    self.close_session(None).await;
                    return Ok(());
                }
                debug!(peer = %self.peer, bytes = ack.len(), "ack sent");
            }
        }

        // Ephemeral key material dies here.
        let secrets = hs.into_secrets()?;
        self.codec = Some(FrameCodec::new(secrets));
        self.state = SessionState::FrameReady;
        info!(peer = %self.peer, "handshake complete");

        self.write_message(&Message::Hello(self.config.hello())).await;
        Ok(())
    }

    /// Decode, handle, and fan out one packet.
    async fn dispatch(&mut self, packet_type: u8, body: &[u8]) {
        let message = match Message::decode(packet_type, body) {
            Ok(message) => message,
            Err(MessageError::UnknownId(id)) => {
                warn!(peer = %self.peer, id, "unknown packet type, dropping");
                return;
            }
            Err(error) => {
                warn!(peer = %self.peer, %error, "undecodable packet, dropping");
                return;
            }
        };
        trace!(peer = %self.peer, packet = message.name(), "packet received");

        match message.handle() {
            PacketAction::Ok => {}
            PacketAction::Activate => self.on_activate(&message).await,
            PacketAction::PeerDisconnected => {
                if let Message::Disconnect(reason) = &message {
                    info!(peer = %self.peer, reason = %reason, "peer disconnected");
                }
                self.subscribers.fanout(&message, &self.peer);
                self.state = SessionState::Closed;
                self.deferred.clear();
                return;
            }
            PacketAction::Disconnect(reason) => {
                self.subscribers.fanout(&message, &self.peer);
                self.close_session(Some(reason)).await;
                return;
            }
            PacketAction::Send(reply) => {
                self.write_message(&reply).await;
            }
        }

        self.subscribers.fanout(&message, &self.peer);
    }

    /// The remote `Hello` arrived: negotiate capabilities and go active.
    async fn on_activate(&mut self, message: &Message) {
        if self.state == SessionState::Active {
            warn!(peer = %self.peer, "duplicate hello, ignoring");
            return;
        }

        if let Message::Hello(hello) = message {
            info!(
                peer = %self.peer,
                client = %hello.client_id,
                protocol_version = hello.protocol_version,
                "hello received"
            );
            if self.config.supports_eth() && !hello.supports_eth() {
                // The caller's fan-out still delivers this Hello afterwards.
                warn!(peer = %self.peer, "no shared eth capability");
                self.close_session(Some(DisconnectReason::UselessPeer)).await;
                return;
            }
        }

        self.state = SessionState::Active;
        info!(peer = %self.peer, "session active");

        // Anything queued before activation goes out now, after our Hello.
        self.retry_at = None;
        self.flush_deferred().await;
    }

    // === Teardown ===

    /// Close locally, optionally announcing a reason first.
    async fn close_session(&mut self, reason: Option<DisconnectReason>) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(reason) = reason {
            if self.codec.is_some() {
                info!(peer = %self.peer, reason = %reason, "disconnecting");
                self.write_message(&Message::Disconnect(reason)).await;
                // Let the disconnect reach the socket before the writer drops.
                time::sleep(DISCONNECT_GRACE).await;
            }
        } else {
            info!(peer = %self.peer, state = %self.state, "closing session");
        }

        self.state = SessionState::Closed;
        self.deferred.clear();
        self.retry_at = None;
    }

    /// The transport died under us: tell subscribers and stop.
    fn on_transport_closed(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.subscribers
            .fanout(&Message::Disconnect(DisconnectReason::TcpSubsystemError), &self.peer);
        self.state = SessionState::Closed;
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests;
