#![cfg(test)]
use super::*;
use crate::config::ConfigBuilder;
use crate::rpc::{Request, Response, RpcType};
use crate::session::Keys;
use crate::transport::UdpTransport;
use enr::EnrBuilder;
use futures::StreamExt;
use std::net::Ipv4Addr;
use std::time::Duration;

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a service bound to an ephemeral localhost socket. `advertised_port` overrides the
/// port the ENR advertises, used to simulate a node whose record does not match its address.
fn open_service_with_enr_port(
    config: Config,
    advertised_port: Option<u16>,
) -> (SessionService<UdpTransport>, Enr) {
    let key = CombinedKey::generate_secp256k1();
    let node_id: NodeId = key.public().into();
    let transport =
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), packet::magic(&node_id)).unwrap();
    let local_addr = transport.local_addr().unwrap();
    let enr = EnrBuilder::new("v4")
        .ip4(Ipv4Addr::LOCALHOST)
        .udp4(advertised_port.unwrap_or_else(|| local_addr.port()))
        .build(&key)
        .unwrap();
    let service = SessionService::new(enr.clone(), key, transport, config).unwrap();
    (service, enr)
}

fn open_service(config: Config) -> (SessionService<UdpTransport>, Enr) {
    open_service_with_enr_port(config, None)
}

fn remote_enr(port: u16) -> Enr {
    let key = CombinedKey::generate_secp256k1();
    EnrBuilder::new("v4")
        .ip4(Ipv4Addr::LOCALHOST)
        .udp4(port)
        .build(&key)
        .unwrap()
}

fn ping(id: u64) -> ProtocolMessage {
    ProtocolMessage {
        id,
        body: RpcType::Request(Request::Ping { enr_seq: 1 }),
    }
}

fn pong(id: u64, port: u16) -> ProtocolMessage {
    ProtocolMessage {
        id,
        body: RpcType::Response(Response::Pong {
            enr_seq: 1,
            ip: "127.0.0.1".parse().unwrap(),
            port,
        }),
    }
}

#[tokio::test]
// A full handshake between two nodes. Both sides establish exactly once and the request and
// response are delivered.
async fn clean_handshake_delivers_and_establishes() {
    init();

    let (mut sender, sender_enr) = open_service(Config::default());
    let (mut receiver, receiver_enr) = open_service(Config::default());

    let request = ping(1);
    let expected = request.clone();
    sender.send_request(&receiver_enr, request).unwrap();

    let sender_side = async move {
        let mut established = 0;
        let mut got_response = false;
        loop {
            match sender.next().await {
                Some(SessionEvent::Established(enr)) => {
                    assert_eq!(enr, receiver_enr);
                    established += 1;
                    assert_eq!(established, 1);
                }
                Some(SessionEvent::Message { message, .. }) => {
                    assert_eq!(message.id, 1);
                    assert!(matches!(message.body, RpcType::Response(_)));
                    got_response = true;
                }
                Some(SessionEvent::RequestFailed(_, id)) => {
                    panic!("request {} failed during a clean handshake", id)
                }
                _ => {}
            }
            if established == 1 && got_response {
                return;
            }
        }
    };

    let receiver_side = async move {
        let mut established = 0;
        loop {
            match receiver.next().await {
                Some(SessionEvent::WhoAreYouRequest {
                    src,
                    src_id,
                    auth_tag,
                }) => {
                    receiver.send_whoareyou(
                        src,
                        &src_id,
                        sender_enr.seq(),
                        Some(sender_enr.clone()),
                        auth_tag,
                    );
                }
                Some(SessionEvent::Established(enr)) => {
                    assert_eq!(enr, sender_enr);
                    established += 1;
                    assert!(established <= 1, "established may only fire once");
                }
                Some(SessionEvent::Message {
                    src,
                    src_id,
                    message,
                }) => {
                    assert_eq!(*message, expected);
                    assert_eq!(established, 1, "the message must follow establishment");
                    receiver
                        .send_response(src, &src_id, pong(message.id, src.port()))
                        .unwrap();
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_side => {}
        _ = receiver_side => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
}

#[tokio::test]
// Requests submitted before the session exists produce a single handshake and are delivered in
// submission order once it completes.
async fn queued_messages_flush_in_order() {
    init();

    let (mut sender, sender_enr) = open_service(Config::default());
    let (mut receiver, receiver_enr) = open_service(Config::default());

    let messages_to_send = 5u64;
    for id in 1..=messages_to_send {
        sender.send_request(&receiver_enr, ping(id)).unwrap();
    }
    // a single random packet is in flight, everything else is queued behind it
    assert_eq!(sender.pending_requests.len(), 1);

    let sender_side = async move {
        loop {
            sender.next().await;
        }
    };

    let receiver_side = async move {
        let mut received = Vec::new();
        loop {
            match receiver.next().await {
                Some(SessionEvent::WhoAreYouRequest {
                    src,
                    src_id,
                    auth_tag,
                }) => {
                    receiver.send_whoareyou(
                        src,
                        &src_id,
                        sender_enr.seq(),
                        Some(sender_enr.clone()),
                        auth_tag,
                    );
                }
                Some(SessionEvent::Message {
                    src,
                    src_id,
                    message,
                }) => {
                    received.push(message.id);
                    receiver
                        .send_response(src, &src_id, pong(message.id, src.port()))
                        .unwrap();
                    if received.len() == messages_to_send as usize {
                        let expected: Vec<u64> = (1..=messages_to_send).collect();
                        assert_eq!(received, expected);
                        return;
                    }
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_side => {}
        _ = receiver_side => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
}

#[tokio::test]
// A node whose ENR endpoint does not match its observed address completes the handshake but
// stays untrusted. Requests towards it fail synchronously while responses still flow.
async fn untrusted_node_rejects_requests_but_responses_flow() {
    init();

    // the sender advertises a port it does not listen on
    let (mut sender, sender_enr) = open_service_with_enr_port(Config::default(), Some(1));
    let (mut receiver, receiver_enr) = open_service(Config::default());

    sender.send_request(&receiver_enr, ping(1)).unwrap();

    let sender_side = async move {
        let mut established = false;
        let mut got_response = false;
        loop {
            match sender.next().await {
                Some(SessionEvent::Established(enr)) => {
                    assert_eq!(enr, receiver_enr);
                    established = true;
                }
                Some(SessionEvent::Message { message, .. }) => {
                    assert_eq!(message.id, 1);
                    got_response = true;
                }
                _ => {}
            }
            if established && got_response {
                return;
            }
        }
    };

    let receiver_side = async move {
        loop {
            match receiver.next().await {
                Some(SessionEvent::WhoAreYouRequest {
                    src,
                    src_id,
                    auth_tag,
                }) => {
                    receiver.send_whoareyou(
                        src,
                        &src_id,
                        sender_enr.seq(),
                        Some(sender_enr.clone()),
                        auth_tag,
                    );
                }
                Some(SessionEvent::Established(_)) => {
                    panic!("an untrusted session must not be reported as established")
                }
                Some(SessionEvent::Message {
                    src,
                    src_id,
                    message,
                }) => {
                    // requests are refused on the untrusted session
                    assert!(matches!(
                        receiver.send_request(&sender_enr, ping(7)),
                        Err(Error::UntrustedPeer)
                    ));
                    // responses are not
                    receiver
                        .send_response(src, &src_id, pong(message.id, src.port()))
                        .unwrap();
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_side => {}
        _ = receiver_side => {}
        _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("test timed out"),
    }
}

#[tokio::test]
// An unresponsive node causes exactly `request_retries` transmissions, one failure event and
// nothing further.
async fn exhausted_retries_fail_the_request() {
    init();

    let config = ConfigBuilder::new()
        .request_timeout(Duration::from_millis(200))
        .request_retries(2)
        .build();
    let (mut sender, _enr) = open_service(config);

    // a socket that receives and never answers
    let black_hole = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hole_enr = remote_enr(black_hole.local_addr().unwrap().port());
    let hole_id = hole_enr.node_id();

    sender.send_request(&hole_enr, ping(1)).unwrap();

    let mut buf = [0u8; 1280];
    let mut transmissions = 0;

    let drive = async {
        loop {
            tokio::select! {
                event = sender.next() => {
                    if let Some(SessionEvent::RequestFailed(node_id, id)) = event {
                        assert_eq!(node_id, hole_id);
                        assert_eq!(id, 1);
                        return;
                    }
                }
                recv = black_hole.recv_from(&mut buf) => {
                    recv.unwrap();
                    transmissions += 1;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), drive)
        .await
        .expect("the request must fail once retries are exhausted");

    assert_eq!(transmissions, 2);
    // nothing further may be transmitted after the failure
    let extra = tokio::time::timeout(
        Duration::from_millis(400),
        black_hole.recv_from(&mut buf),
    )
    .await;
    assert!(extra.is_err(), "no packets may follow a request failure");
}

#[tokio::test]
// A challenge that is never answered is retransmitted, then abandoned without a failure event
// since no user message was queued behind it.
async fn abandoned_challenge_emits_no_failure() {
    init();

    let config = ConfigBuilder::new()
        .request_timeout(Duration::from_millis(100))
        .request_retries(2)
        .build();
    let (mut service, enr) = open_service(config);
    let service_addr = service.transport.local_addr().unwrap();

    // a stranger writes to us from a socket that will ignore our challenge
    let stranger = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let stranger_id = NodeId::random();
    let tag = packet::tag(&stranger_id, &enr.node_id());
    let packet = Packet::Message {
        tag,
        auth_tag: rand::random(),
        message: vec![0xad; 32],
    };
    stranger.send_to(&packet.encode(), service_addr).await.unwrap();

    let deadline = tokio::time::sleep(Duration::from_secs(1));
    tokio::pin!(deadline);
    let mut challenged = false;
    loop {
        tokio::select! {
            event = service.next() => match event {
                Some(SessionEvent::WhoAreYouRequest { src, src_id, auth_tag }) => {
                    assert_eq!(src_id, stranger_id);
                    service.send_whoareyou(src, &src_id, 0, None, auth_tag);
                    challenged = true;
                }
                Some(SessionEvent::RequestFailed(..)) => {
                    panic!("an abandoned challenge must not report a failure")
                }
                _ => {}
            },
            _ = &mut deadline => break,
        }
    }

    assert!(challenged);
    // the half-session was dropped with the challenge
    assert!(service.sessions.get(&stranger_id).is_none());
}

#[tokio::test]
// A message that does not decrypt under the session keys drops the session and requests a
// single new handshake.
async fn undecryptable_message_drops_the_session() {
    init();

    let (mut service, _enr) = open_service(Config::default());

    let remote_enr = remote_enr(9000);
    let remote_id = remote_enr.node_id();
    let keys = Keys {
        auth_resp_key: rand::random(),
        encryption_key: rand::random(),
        decryption_key: rand::random(),
    };
    service
        .sessions
        .insert(remote_id.clone(), Session::new_established(Some(remote_enr), keys));

    let src: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let tag = packet::tag(&remote_id, &service.enr.node_id());
    service.handle_message(src, remote_id.clone(), rand::random(), &[0u8; 48], tag);

    assert!(service.sessions.get(&remote_id).is_none());
    assert_eq!(service.events.len(), 1);
    assert!(matches!(
        service.events.front(),
        Some(SessionEvent::WhoAreYouRequest { src_id, .. }) if *src_id == remote_id
    ));
}

#[tokio::test]
// Requests submitted while a handshake is in flight are queued in order behind the single
// random packet.
async fn requests_queue_while_a_handshake_is_in_flight() {
    init();

    let (mut service, _enr) = open_service(Config::default());
    let dst_enr = remote_enr(9005);
    let dst_id = dst_enr.node_id();

    service.send_request(&dst_enr, ping(1)).unwrap();
    service.send_request(&dst_enr, ping(2)).unwrap();
    service.send_request(&dst_enr, ping(3)).unwrap();

    assert_eq!(service.pending_requests.len(), 1);
    assert!(service
        .pending_requests
        .exists(|request| request.packet.is_random()));

    let queued: Vec<u64> = service
        .pending_messages
        .get(&dst_id)
        .unwrap()
        .iter()
        .map(|message| message.id)
        .collect();
    assert_eq!(queued, vec![1, 2, 3]);
}

#[tokio::test]
// An expired session with requests still in flight is kept for another request window,
// otherwise its queued messages fail.
async fn expiry_extends_sessions_with_requests_in_flight() {
    init();

    let (mut service, _enr) = open_service(Config::default());
    let dst_enr = remote_enr(9006);
    let remote_id = dst_enr.node_id();
    let dst: SocketAddr = "127.0.0.1:9006".parse().unwrap();
    let tag = packet::tag(&service.enr.node_id(), &remote_id);

    let (session, packet) = Session::new_random(tag, dst_enr.clone());
    service
        .pending_requests
        .insert(dst, PendingRequest::new(remote_id.clone(), packet, None));
    service.handle_session_expiry(remote_id.clone(), session);
    assert!(service.sessions.get(&remote_id).is_some());

    // without outstanding requests the queued messages fail
    service.pending_requests.clear();
    service.sessions.remove(&remote_id);
    service
        .pending_messages
        .entry(remote_id.clone())
        .or_default()
        .push_back(ping(3));
    let (session, _packet) = Session::new_random(tag, dst_enr);
    service.handle_session_expiry(remote_id.clone(), session);
    assert!(service.sessions.get(&remote_id).is_none());
    assert!(matches!(
        service.events.back(),
        Some(SessionEvent::RequestFailed(node_id, 3)) if *node_id == remote_id
    ));
}

#[tokio::test]
async fn responses_require_a_session() {
    init();

    let (mut service, _enr) = open_service(Config::default());
    let dst: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let dst_id = NodeId::random();

    assert!(matches!(
        service.send_response(dst, &dst_id, pong(1, 9000)),
        Err(Error::SessionNotReady)
    ));
    assert!(matches!(
        service.send_request_unknown_enr(dst, &dst_id, ping(1)),
        Err(Error::SessionNotReady)
    ));
}

#[tokio::test]
async fn mismatched_keypair_is_rejected() {
    init();

    let key1 = CombinedKey::generate_secp256k1();
    let key2 = CombinedKey::generate_secp256k1();
    let enr = EnrBuilder::new("v4")
        .ip4(Ipv4Addr::LOCALHOST)
        .udp4(9000)
        .build(&key1)
        .unwrap();
    let node_id: NodeId = key1.public().into();
    let transport =
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), packet::magic(&node_id)).unwrap();

    assert!(matches!(
        SessionService::new(enr, key2, transport, Config::default()),
        Err(Error::InvalidEnr)
    ));
}

#[tokio::test]
// Stopping the service clears every session, request and queued message.
async fn stop_clears_all_state() {
    init();

    let (mut service, _enr) = open_service(Config::default());
    let dst_enr = remote_enr(9007);
    service.send_request(&dst_enr, ping(1)).unwrap();
    assert_eq!(service.pending_requests.len(), 1);

    service.stop();
    assert_eq!(service.pending_requests.len(), 0);
    assert!(service.pending_messages.is_empty());
    assert!(service.sessions.get(&dst_enr.node_id()).is_none());
    assert!(service.events.is_empty());
}
