//! End-to-end session scenarios over in-process duplex pipes.
//!
//! Two kinds of harness: full loopback (two real session actors wired
//! together) and a manual peer (the test side drives the handshake and
//! frame codec directly, giving byte-level control over what the session
//! under test receives).

use super::*;
use crate::crypto::StaticKeys;
use crate::handshake::envelope_len;
use crate::message::{Capability, Hello, Status};
use crate::subscriber::channel_subscriber;
use std::net::SocketAddr;
use tokio::io::DuplexStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

type PacketRx = UnboundedReceiver<(Message, Peer)>;

fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn test_config() -> Arc<SessionConfig> {
    Arc::new(SessionConfig::new(StaticKeys::generate()))
}

/// A `Status` no pinger would produce, for tracing a specific send.
fn probe_status() -> Message {
    Message::Status(Status {
        version: 63,
        network_id: 777,
        total_difficulty: 1,
        head_hash: [9; 32],
        genesis_hash: [9; 32],
    })
}

fn is_probe_status(message: &Message) -> bool {
    matches!(message, Message::Status(status) if status.network_id == 777)
}

struct Loopback {
    initiator: SessionHandle,
    responder: SessionHandle,
    initiator_rx: PacketRx,
    responder_rx: PacketRx,
    initiator_id: PeerId,
}

/// Two real sessions talking over a duplex pipe.
fn loopback() -> Loopback {
    let config_a = test_config();
    let config_b = test_config();
    let initiator_id = config_a.node_id();
    let (stream_a, stream_b) = tokio::io::duplex(256 * 1024);

    let (subscriber_a, initiator_rx) = channel_subscriber();
    let (subscriber_b, responder_rx) = channel_subscriber();

    let initiator = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), config_b.node_id()),
        Handshake::initiator(config_a.keys.clone(), config_b.keys.public),
        config_a,
        vec![subscriber_a],
    );

    let responder = spawn_session(
        stream_b,
        Peer::inbound(test_addr(40404)),
        Handshake::responder(config_b.keys.clone()),
        config_b,
        vec![subscriber_b],
    );

    Loopback { initiator, responder, initiator_rx, responder_rx, initiator_id }
}

async fn recv_packet(rx: &mut PacketRx, within: Duration) -> Message {
    timeout(within, rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("subscriber channel closed")
        .0
}

// ============================================================================
// Manual peer helpers
// ============================================================================

/// Run the responder half of the handshake by hand, returning the frame
/// codec for the established stream.
async fn manual_responder_handshake(
    stream: &mut DuplexStream,
    buf: &mut BytesMut,
    keys: StaticKeys,
) -> FrameCodec {
    let auth = loop {
        if let Some(len) = envelope_len(buf).expect("bad envelope") {
            break buf.split_to(len);
        }
        let n = stream.read_buf(buf).await.expect("read failed");
        assert!(n > 0, "eof before auth");
    };

    let mut hs = Handshake::responder(keys);
    hs.read_auth(&auth).expect("auth rejected");
    let ack = hs.write_ack().expect("ack build failed");
    stream.write_all(&ack).await.expect("ack write failed");
    FrameCodec::new(hs.into_secrets().expect("secret derivation failed"))
}

/// Read one frame from the stream, buffering as needed.
async fn manual_read_frame(
    stream: &mut DuplexStream,
    buf: &mut BytesMut,
    codec: &mut FrameCodec,
) -> (u8, Vec<u8>) {
    loop {
        if let Some(frame) = codec.read_frame(buf).expect("frame error") {
            return frame;
        }
        let n = stream.read_buf(buf).await.expect("read failed");
        assert!(n > 0, "eof mid-frame");
    }
}

async fn manual_send(
    stream: &mut DuplexStream,
    codec: &mut FrameCodec,
    message: &Message,
) {
    let frame = codec.write_frame(message.id(), &message.encode_body()).expect("encode failed");
    stream.write_all(&frame).await.expect("write failed");
}

fn manual_hello(keys: &StaticKeys) -> Message {
    Message::Hello(Hello {
        protocol_version: 5,
        client_id: "manual-peer/0.0.0".into(),
        capabilities: vec![Capability::eth()],
        listen_port: 0,
        node_id: PeerId::from_public_key(&keys.public),
    })
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_loopback_reaches_active_within_deadline() {
    let mut lb = loopback();

    // Each side seeing the other's Hello means both sent and received one,
    // which is exactly the Active condition.
    let deadline = Duration::from_millis(100);
    let first_a = recv_packet(&mut lb.initiator_rx, deadline).await;
    let first_b = recv_packet(&mut lb.responder_rx, deadline).await;
    assert!(matches!(first_a, Message::Hello(_)), "initiator saw {first_a:?}");
    assert!(matches!(first_b, Message::Hello(_)), "responder saw {first_b:?}");

    assert!(!lb.initiator.is_closed());
    assert!(!lb.responder.is_closed());

    // The responder's handle now carries the identity learned from the auth
    // message, not the anonymous inbound placeholder.
    assert_eq!(lb.responder.peer().id(), Some(lb.initiator_id));
}

#[tokio::test(start_paused = true)]
async fn test_pre_hello_send_arrives_strictly_after_hello() {
    let mut lb = loopback();

    // Submitted before the handshake can possibly have finished.
    lb.initiator.send_packet(probe_status()).await.unwrap();

    let mut seen_hello = false;
    let found_probe = loop {
        let message = recv_packet(&mut lb.responder_rx, Duration::from_secs(10)).await;
        if is_probe_status(&message) {
            break seen_hello;
        }
        if matches!(message, Message::Hello(_)) {
            seen_hello = true;
        }
    };
    assert!(found_probe, "probe status arrived before the hello");
}

#[tokio::test]
async fn test_disconnect_roundtrip() {
    let mut lb = loopback();

    // Wait for activation on both sides.
    recv_packet(&mut lb.initiator_rx, Duration::from_secs(1)).await;
    recv_packet(&mut lb.responder_rx, Duration::from_secs(1)).await;

    lb.initiator.close(Some(DisconnectReason::UselessPeer)).await.unwrap();

    // The responder reports the disconnect to its subscribers and closes
    // without writing further frames.
    let message = loop {
        let message = recv_packet(&mut lb.responder_rx, Duration::from_secs(2)).await;
        if let Message::Disconnect(_) = &message {
            break message;
        }
    };
    assert_eq!(message, Message::Disconnect(DisconnectReason::UselessPeer));

    timeout(Duration::from_secs(2), lb.responder.closed()).await.expect("responder stuck open");
    timeout(Duration::from_secs(2), lb.initiator.closed()).await.expect("initiator stuck open");
}

#[tokio::test]
async fn test_send_on_closed_session_is_dropped() {
    let lb = loopback();
    lb.initiator.close(None).await.unwrap();
    timeout(Duration::from_secs(2), lb.initiator.closed()).await.expect("close stuck");

    assert!(matches!(lb.initiator.send_packet(probe_status()).await, Err(SessionError::Closed)));
    assert!(lb.initiator.is_closed());
}

#[tokio::test]
async fn test_mac_tamper_is_fatal_and_delivers_nothing() {
    let config_a = test_config();
    let keys_b = StaticKeys::generate();
    let (stream_a, mut raw) = tokio::io::duplex(256 * 1024);

    let (subscriber, mut rx_a) = channel_subscriber();
    let handle = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), PeerId::from_public_key(&keys_b.public)),
        Handshake::initiator(config_a.keys.clone(), keys_b.public),
        config_a,
        vec![subscriber],
    );

    let mut buf = BytesMut::new();
    let mut codec = manual_responder_handshake(&mut raw, &mut buf, keys_b).await;

    // The session's Hello decodes cleanly.
    let (packet_type, _) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
    assert_eq!(packet_type, 0x00);

    // One flipped bit anywhere in the next frame must kill the session.
    let status = probe_status();
    let mut frame = codec.write_frame(status.id(), &status.encode_body()).unwrap();
    frame[20] ^= 0x01;
    raw.write_all(&frame).await.unwrap();

    timeout(Duration::from_secs(2), handle.closed()).await.expect("session survived tampering");

    // No packet ever reached the subscriber.
    assert!(rx_a.try_recv().is_err(), "tampered traffic was delivered");
}

#[tokio::test]
async fn test_unknown_packet_dropped_and_ping_answered() {
    let config_a = test_config();
    let keys_b = StaticKeys::generate();
    let (stream_a, mut raw) = tokio::io::duplex(256 * 1024);

    let (subscriber, mut rx_a) = channel_subscriber();
    let handle = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), PeerId::from_public_key(&keys_b.public)),
        Handshake::initiator(config_a.keys.clone(), keys_b.public),
        config_a,
        vec![subscriber],
    );

    let mut buf = BytesMut::new();
    let mut codec = manual_responder_handshake(&mut raw, &mut buf, keys_b.clone()).await;
    let (packet_type, _) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
    assert_eq!(packet_type, 0x00);

    manual_send(&mut raw, &mut codec, &manual_hello(&keys_b)).await;

    // An unknown packet id is logged and dropped without killing the session.
    let unknown = codec.write_frame(0x42, &[0xc0]).unwrap();
    raw.write_all(&unknown).await.unwrap();

    manual_send(&mut raw, &mut codec, &Message::Ping).await;

    // The session answers the ping; pinger Status frames may interleave.
    let found_pong = timeout(Duration::from_secs(5), async {
        loop {
            let (packet_type, _) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
            if packet_type == 0x03 {
                break;
            }
        }
    })
    .await;
    assert!(found_pong.is_ok(), "no pong received");
    assert!(!handle.is_closed(), "session died on unknown packet");

    // Subscribers saw the Hello and the Ping, never the unknown packet.
    let (first, _) = rx_a.recv().await.unwrap();
    assert!(matches!(first, Message::Hello(_)));
    let (second, _) = rx_a.recv().await.unwrap();
    assert_eq!(second, Message::Ping);
}

#[tokio::test(start_paused = true)]
async fn test_pinger_sends_status_while_active() {
    let config_a = test_config();
    let keys_b = StaticKeys::generate();
    let (stream_a, mut raw) = tokio::io::duplex(256 * 1024);

    let _handle = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), PeerId::from_public_key(&keys_b.public)),
        Handshake::initiator(config_a.keys.clone(), keys_b.public),
        config_a.clone(),
        Vec::new(),
    );

    let mut buf = BytesMut::new();
    let mut codec = manual_responder_handshake(&mut raw, &mut buf, keys_b.clone()).await;
    let (packet_type, _) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
    assert_eq!(packet_type, 0x00);

    manual_send(&mut raw, &mut codec, &manual_hello(&keys_b)).await;

    // Once active, the 2 s pinger emits our chain Status.
    let (packet_type, body) = timeout(Duration::from_secs(10), async {
        loop {
            let frame = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
            if frame.0 == 0x10 {
                break frame;
            }
        }
    })
    .await
    .expect("no liveness status observed");

    assert_eq!(packet_type, 0x10);
    let decoded = Message::decode(packet_type, &body).unwrap();
    assert_eq!(decoded, Message::Status(config_a.status()));
}

#[tokio::test]
async fn test_deferred_sends_dropped_when_closed_before_active() {
    let config_a = test_config();
    let keys_b = StaticKeys::generate();
    let (stream_a, mut raw) = tokio::io::duplex(256 * 1024);

    let handle = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), PeerId::from_public_key(&keys_b.public)),
        Handshake::initiator(config_a.keys.clone(), keys_b.public),
        config_a,
        Vec::new(),
    );

    // Queue an application packet while still handshaking (the manual peer
    // never responds, so the session cannot activate), then close.
    handle.send_packet(probe_status()).await.unwrap();
    handle.close(None).await.unwrap();
    timeout(Duration::from_secs(2), handle.closed()).await.expect("close stuck");

    // The wire carries the auth envelope and nothing else: the deferred
    // packet observed the closed state and was dropped.
    let mut received = BytesMut::new();
    loop {
        match raw.read_buf(&mut received).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    let envelope = envelope_len(&received).unwrap().expect("auth missing");
    assert_eq!(envelope, received.len(), "bytes written after close");
}

#[tokio::test]
async fn test_no_shared_capability_disconnects_useless_peer() {
    let config_a = test_config();
    let keys_b = StaticKeys::generate();
    let (stream_a, mut raw) = tokio::io::duplex(256 * 1024);

    let handle = spawn_session(
        stream_a,
        Peer::new(test_addr(30303), PeerId::from_public_key(&keys_b.public)),
        Handshake::initiator(config_a.keys.clone(), keys_b.public),
        config_a,
        Vec::new(),
    );

    let mut buf = BytesMut::new();
    let mut codec = manual_responder_handshake(&mut raw, &mut buf, keys_b.clone()).await;
    let (packet_type, _) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
    assert_eq!(packet_type, 0x00);

    // A Hello with no eth capability gets a UselessPeer disconnect back.
    let hello = Message::Hello(Hello {
        protocol_version: 5,
        client_id: "capless/0.0.0".into(),
        capabilities: vec![Capability::new("shh", 3)],
        listen_port: 0,
        node_id: PeerId::from_public_key(&keys_b.public),
    });
    manual_send(&mut raw, &mut codec, &hello).await;

    let (packet_type, body) = manual_read_frame(&mut raw, &mut buf, &mut codec).await;
    assert_eq!(packet_type, 0x01);
    assert_eq!(
        Message::decode(packet_type, &body).unwrap(),
        Message::Disconnect(DisconnectReason::UselessPeer)
    );

    timeout(Duration::from_secs(2), handle.closed()).await.expect("session stayed open");
}
