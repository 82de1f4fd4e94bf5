//! Client and server engines talking over an in-memory byte shuttle.

use std::time::{Duration, Instant};

use amqp_engine::codec::Symbol;
use amqp_engine::endpoint::{ConnectionState, LinkId, LinkState, SessionId};
use amqp_engine::error::{DecodeError, SaslError};
use amqp_engine::frame::{Frame, FrameEncoder, ProtocolHeader};
use amqp_engine::sasl::{Plain, PlainAuthenticator};
use amqp_engine::types::{DeliveryState, ErrorCondition, Open, Role, SaslCode, SaslInit, conditions};
use amqp_engine::{Engine, EngineConfig, EngineEvent, Error};
use bytes::{Bytes, BytesMut};

struct Pair {
    client: Engine,
    server: Engine,
}

impl Pair {
    fn new(client: Engine, server: Engine) -> Self {
        let mut pair = Self { client, server };
        pair.client.start().unwrap();
        pair.server.start().unwrap();
        pair
    }

    fn plain() -> Self {
        Self::with_configs(EngineConfig::default(), EngineConfig::server())
    }

    fn with_configs(client: EngineConfig, server: EngineConfig) -> Self {
        Self::new(Engine::new(client).unwrap(), Engine::new(server).unwrap())
    }

    /// Move bytes both ways until neither side has output.
    fn pump(&mut self) {
        for _ in 0..64 {
            let to_server = self.client.take_output();
            let to_client = self.server.take_output();
            if to_server.is_empty() && to_client.is_empty() {
                return;
            }
            if !to_server.is_empty() {
                let _ = self.server.ingest(to_server);
            }
            if !to_client.is_empty() {
                let _ = self.client.ingest(to_client);
            }
        }
        panic!("engines never went quiet");
    }
}

fn events(engine: &mut Engine) -> Vec<EngineEvent> {
    std::iter::from_fn(|| engine.poll_event()).collect()
}

fn remote_begin(events: &[EngineEvent]) -> SessionId {
    events
        .iter()
        .find_map(|event| match event {
            EngineEvent::RemoteBegin(session) => Some(*session),
            _ => None,
        })
        .expect("remote begin")
}

fn remote_attach(events: &[EngineEvent]) -> LinkId {
    events
        .iter()
        .find_map(|event| match event {
            EngineEvent::RemoteAttach(link) => Some(*link),
            _ => None,
        })
        .expect("remote attach")
}

fn open(pair: &mut Pair) {
    pair.client.open().unwrap();
    pair.pump();
    assert!(events(&mut pair.server).contains(&EngineEvent::RemoteOpen));
    pair.server.open().unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::RemoteOpen));
}

struct Linked {
    pair: Pair,
    client_session: SessionId,
    sender: LinkId,
    receiver: LinkId,
}

fn linked(pair: Pair) -> Linked {
    let mut pair = pair;
    open(&mut pair);

    let client_session = pair.client.new_session(None).unwrap();
    pair.client.begin(client_session).unwrap();
    pair.pump();
    let server_session = remote_begin(&events(&mut pair.server));
    pair.server.begin(server_session).unwrap();
    pair.pump();
    assert_eq!(remote_begin(&events(&mut pair.client)), client_session);

    let sender = pair.client.new_sender(client_session, "link-1", "queue").unwrap();
    pair.client.attach(sender).unwrap();
    pair.pump();
    let receiver = remote_attach(&events(&mut pair.server));
    assert_eq!(pair.server.link(receiver).unwrap().role(), Role::Receiver);
    pair.server.attach(receiver).unwrap();
    pair.pump();

    let client_events = events(&mut pair.client);
    assert_eq!(remote_attach(&client_events), sender);
    assert!(client_events.contains(&EngineEvent::LinkCredit(sender)));
    assert_eq!(pair.client.link(sender).unwrap().credit().credit(), 10);
    Linked {
        pair,
        client_session,
        sender,
        receiver,
    }
}

#[test]
fn full_lifecycle() {
    let Linked {
        mut pair,
        sender,
        receiver,
        ..
    } = linked(Pair::plain());

    let delivery_id = pair
        .client
        .send(sender, Bytes::from_static(b"tag-1"), Bytes::from_static(b"hello"), false)
        .unwrap();
    pair.pump();
    assert!(events(&mut pair.server).contains(&EngineEvent::Delivery {
        link: receiver,
        delivery_id,
    }));
    let delivery = pair.server.take_delivery(receiver).unwrap().unwrap();
    assert_eq!(&delivery.payload[..], b"hello");
    assert_eq!(&delivery.tag[..], b"tag-1");
    assert!(pair.server.take_delivery(receiver).unwrap().is_none());

    assert_eq!(pair.client.link(sender).unwrap().unsettled_count(), 1);
    pair.server
        .disposition(receiver, delivery.delivery_id, Some(DeliveryState::Accepted), true)
        .unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::DeliveryUpdated {
        link: sender,
        delivery_id,
        state: Some(DeliveryState::Accepted),
        settled: true,
    }));
    assert_eq!(pair.client.link(sender).unwrap().unsettled_count(), 0);

    pair.client.detach(sender, true, None).unwrap();
    pair.pump();
    assert!(events(&mut pair.server).iter().any(|event| matches!(
        event,
        EngineEvent::RemoteDetach { link, closed: true, .. } if *link == receiver
    )));
    pair.server.detach(receiver, true, None).unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::LinkDetached(sender)));
    assert!(pair.client.link(sender).is_none());

    pair.client.close(None).unwrap();
    pair.pump();
    assert!(events(&mut pair.server).contains(&EngineEvent::RemoteClose(None)));
    pair.server.close(None).unwrap();
    pair.pump();
    assert!(events(&mut pair.server).contains(&EngineEvent::ConnectionClosed));
    assert!(events(&mut pair.client).contains(&EngineEvent::ConnectionClosed));
    assert_eq!(pair.client.connection().state(), ConnectionState::Closed);
    assert_eq!(pair.server.connection().state(), ConnectionState::Closed);
    assert!(!pair.client.is_failed() && !pair.server.is_failed());
}

#[test]
fn large_delivery_spans_frames() {
    let server = EngineConfig {
        max_frame_size: 512,
        ..EngineConfig::server()
    };
    let Linked {
        mut pair,
        sender,
        receiver,
        ..
    } = linked(Pair::with_configs(EngineConfig::default(), server));

    let payload: Bytes = (0..2000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    pair.client
        .send(sender, Bytes::from_static(b"big"), payload.clone(), true)
        .unwrap();
    pair.pump();
    assert!(!pair.server.is_failed(), "{:?}", pair.server.failure());
    let delivery = pair.server.take_delivery(receiver).unwrap().unwrap();
    assert_eq!(delivery.payload, payload);
    assert!(delivery.settled);
    assert_eq!(pair.client.link(sender).unwrap().unsettled_count(), 0);
}

#[test]
fn drain_returns_unused_credit() {
    let Linked {
        mut pair,
        sender,
        receiver,
        ..
    } = linked(Pair::plain());

    pair.server.drain(receiver).unwrap();
    assert!(matches!(
        pair.server.drain(receiver),
        Err(Error::Usage(_))
    ));
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::DrainRequested(sender)));
    pair.client.drained(sender).unwrap();
    pair.pump();
    assert!(events(&mut pair.server).contains(&EngineEvent::Drained(receiver)));
    assert_eq!(pair.server.link(receiver).unwrap().credit().credit(), 0);
    assert_eq!(pair.client.link(sender).unwrap().credit().credit(), 0);
    assert!(matches!(
        pair.client.send(sender, Bytes::from_static(b"t"), Bytes::new(), true),
        Err(Error::Usage(_))
    ));
}

#[test]
fn receiver_credit_is_replenished() {
    let Linked {
        mut pair,
        sender,
        receiver,
        ..
    } = linked(Pair::plain());

    for i in 0..6u8 {
        pair.client
            .send(sender, Bytes::from(vec![i]), Bytes::from_static(b"m"), true)
            .unwrap();
    }
    pair.pump();
    assert_eq!(pair.client.link(sender).unwrap().credit().credit(), 4);
    for _ in 0..6 {
        pair.server.take_delivery(receiver).unwrap().unwrap();
    }
    pair.pump();
    assert_eq!(pair.server.link(receiver).unwrap().credit().credit(), 10);
    assert_eq!(pair.client.link(sender).unwrap().credit().credit(), 10);
}

#[test]
fn sasl_plain_success() {
    let client = Engine::new(EngineConfig::default())
        .unwrap()
        .with_sasl_client(vec![Box::new(Plain::new("guest", "secret"))])
        .unwrap();
    let server = Engine::new(EngineConfig::server())
        .unwrap()
        .with_sasl_server(Box::new(PlainAuthenticator::new().with_user("guest", "secret")))
        .unwrap();
    let mut pair = Pair::new(client, server);

    pair.client.open().unwrap();
    pair.pump();
    let server_events = events(&mut pair.server);
    assert!(server_events.contains(&EngineEvent::SaslOutcome(SaslCode::Ok)));
    assert!(server_events.contains(&EngineEvent::RemoteOpen));
    pair.server.open().unwrap();
    pair.pump();
    let client_events = events(&mut pair.client);
    assert!(client_events.contains(&EngineEvent::SaslOutcome(SaslCode::Ok)));
    assert!(client_events.contains(&EngineEvent::RemoteOpen));
    assert_eq!(pair.client.connection().state(), ConnectionState::Active);
    assert_eq!(pair.server.connection().state(), ConnectionState::Active);
    assert!(pair.client.handlers().all(|name| name != "sasl"));
    assert!(pair.server.handlers().all(|name| name != "sasl"));
}

#[test]
fn sasl_plain_failure() {
    let client = Engine::new(EngineConfig::default())
        .unwrap()
        .with_sasl_client(vec![Box::new(Plain::new("guest", "wrong"))])
        .unwrap();
    let server = Engine::new(EngineConfig::server())
        .unwrap()
        .with_sasl_server(Box::new(PlainAuthenticator::new().with_user("guest", "secret")))
        .unwrap();
    let mut pair = Pair::new(client, server);

    pair.client.open().unwrap();
    pair.pump();
    let server_events = events(&mut pair.server);
    assert!(server_events.contains(&EngineEvent::SaslOutcome(SaslCode::Auth)));
    assert!(server_events.iter().all(|event| *event != EngineEvent::RemoteOpen));
    assert!(matches!(
        pair.client.failure(),
        Some(Error::Sasl(SaslError::AuthenticationFailed { code: 1 }))
    ));
    let client_events = events(&mut pair.client);
    assert_eq!(
        client_events
            .iter()
            .filter(|event| matches!(event, EngineEvent::Failed(_)))
            .count(),
        1
    );
    assert!(matches!(
        pair.client.new_session(None),
        Err(Error::EngineFailed(_))
    ));
}

fn plain_server() -> Engine {
    let mut server = Engine::new(EngineConfig::server())
        .unwrap()
        .with_sasl_server(Box::new(PlainAuthenticator::new().with_user("guest", "secret")))
        .unwrap();
    server.start().unwrap();
    server
}

#[test]
fn pipelined_sasl_client_reaches_open() {
    let encoder = FrameEncoder::new(u32::MAX);
    let mut wire = BytesMut::from(&ProtocolHeader::Sasl.to_bytes()[..]);
    let init = Frame::sasl(SaslInit {
        mechanism: Symbol::new("PLAIN"),
        initial_response: Some(Bytes::from_static(b"\0guest\0secret")),
        hostname: None,
    });
    encoder.encode(&init, &mut wire).unwrap();
    wire.extend_from_slice(&ProtocolHeader::Amqp.to_bytes());
    let open = Frame::amqp(0, Open {
        container_id: "eager-client".into(),
        ..Open::default()
    });
    encoder.encode(&open, &mut wire).unwrap();

    let mut server = plain_server();
    server.ingest(wire.freeze()).unwrap();
    let server_events = events(&mut server);
    assert!(server_events.contains(&EngineEvent::SaslOutcome(SaslCode::Ok)));
    assert!(server_events.contains(&EngineEvent::RemoteOpen));
    assert!(server.failure().is_none());
    assert!(server.handlers().all(|name| name != "sasl"));
}

/// An Open frame whose properties map nests `depth` maps deep.
fn deeply_nested_open(depth: usize) -> Bytes {
    let mut properties = vec![0xc1, 1, 0];
    for _ in 0..depth {
        let mut outer = vec![0xd1];
        outer.extend_from_slice(&(properties.len() as u32 + 5).to_be_bytes());
        outer.extend_from_slice(&2u32.to_be_bytes());
        outer.push(0x40);
        outer.extend_from_slice(&properties);
        properties = outer;
    }
    let mut fields = vec![0xa1, 1, b'c'];
    fields.extend_from_slice(&[0x40; 8]);
    fields.extend_from_slice(&properties);

    let mut body = vec![0x00, 0x53, 0x10, 0xd0];
    body.extend_from_slice(&(fields.len() as u32 + 4).to_be_bytes());
    body.extend_from_slice(&10u32.to_be_bytes());
    body.extend_from_slice(&fields);

    let mut wire = BytesMut::from(&ProtocolHeader::Amqp.to_bytes()[..]);
    wire.extend_from_slice(&(body.len() as u32 + 8).to_be_bytes());
    wire.extend_from_slice(&[2, 0, 0, 0]);
    wire.extend_from_slice(&body);
    wire.freeze()
}

#[test]
fn deeply_nested_open_fails_with_decode_error() {
    let config = EngineConfig {
        max_frame_size: 1 << 20,
        ..EngineConfig::server()
    };
    let mut server = Engine::new(config).unwrap();
    server.start().unwrap();

    let err = server.ingest(deeply_nested_open(20_000)).unwrap_err();
    assert_eq!(err.condition(), conditions::DECODE_ERROR);
    assert!(matches!(
        server.failure(),
        Some(Error::Decode(DecodeError::NestingTooDeep { .. }))
    ));
    assert!(
        events(&mut server)
            .iter()
            .all(|event| *event != EngineEvent::RemoteOpen)
    );
}

#[test]
fn shallow_nested_open_is_accepted() {
    let mut server = Engine::new(EngineConfig::server()).unwrap();
    server.start().unwrap();
    server.ingest(deeply_nested_open(16)).unwrap();
    assert!(events(&mut server).contains(&EngineEvent::RemoteOpen));
}

#[test]
fn remote_close_cascades() {
    let Linked {
        mut pair,
        client_session,
        sender,
        ..
    } = linked(Pair::plain());

    let error = ErrorCondition::new(conditions::CONNECTION_FORCED, "shutting down");
    pair.server.close(Some(error.clone())).unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::RemoteClose(Some(error.clone()))));
    assert_eq!(pair.client.connection().state(), ConnectionState::CloseReceived);
    assert_eq!(pair.client.connection().remote_error(), Some(&error));
    assert!(pair.client.session(client_session).is_none());
    assert!(pair.client.link(sender).is_none());
    assert!(matches!(
        pair.client.send(sender, Bytes::from_static(b"t"), Bytes::new(), true),
        Err(Error::Usage(_))
    ));

    pair.client.close(None).unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::ConnectionClosed));
    assert!(events(&mut pair.server).contains(&EngineEvent::ConnectionClosed));
}

#[test]
fn remote_end_reaches_links() {
    let Linked {
        mut pair,
        client_session,
        sender,
        ..
    } = linked(Pair::plain());

    let server_session = pair
        .server
        .connection()
        .sessions()
        .next()
        .map(|session| session.id())
        .unwrap();
    pair.server.end(server_session, None).unwrap();
    pair.pump();
    assert!(events(&mut pair.client).iter().any(|event| matches!(
        event,
        EngineEvent::RemoteEnd { session, error: None } if *session == client_session
    )));
    pair.client.end(client_session, None).unwrap();
    pair.pump();
    assert!(events(&mut pair.client).contains(&EngineEvent::SessionEnded(client_session)));
    assert!(events(&mut pair.server).contains(&EngineEvent::SessionEnded(server_session)));
    assert!(pair.client.link(sender).is_none());
}

#[test]
fn open_timeout_fails_engine() {
    let mut pair = Pair::plain();
    let start = Instant::now();
    pair.client.tick(start).unwrap();
    pair.client.open().unwrap();
    pair.client.tick(start + Duration::from_secs(29)).unwrap();
    let err = pair.client.tick(start + Duration::from_secs(30)).unwrap_err();
    assert!(matches!(err.root_cause(), Error::Timeout("open")));
    assert_eq!(
        pair.client.failure().map(Error::condition),
        Some(conditions::RESOURCE_LIMIT_EXCEEDED)
    );
    assert!(events(&mut pair.client).iter().any(|event| matches!(event, EngineEvent::Failed(_))));
}

#[test]
fn open_reply_cancels_timeout() {
    let mut pair = Pair::plain();
    let start = Instant::now();
    pair.client.tick(start).unwrap();
    open(&mut pair);
    pair.client.tick(start + Duration::from_secs(60)).unwrap();
    assert!(!pair.client.is_failed());
}

#[test]
fn heartbeats_follow_remote_idle_timeout() {
    let client = EngineConfig {
        idle_timeout: Some(Duration::from_secs(1)),
        ..EngineConfig::default()
    };
    let mut pair = Pair::with_configs(client, EngineConfig::server());
    open(&mut pair);

    let start = Instant::now();
    pair.server.tick(start).unwrap();
    pair.server.tick(start + Duration::from_millis(400)).unwrap();
    assert!(pair.server.take_output().is_empty());
    pair.server.tick(start + Duration::from_millis(500)).unwrap();
    let heartbeat = pair.server.take_output();
    assert_eq!(&heartbeat[..], &[0, 0, 0, 8, 2, 0, 0, 0]);
}

#[test]
fn silent_peer_expires_idle_timeout() {
    let client = EngineConfig {
        idle_timeout: Some(Duration::from_secs(1)),
        ..EngineConfig::default()
    };
    let mut pair = Pair::with_configs(client, EngineConfig::server());
    open(&mut pair);

    let start = Instant::now();
    pair.client.tick(start).unwrap();
    let err = pair.client.tick(start + Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err.root_cause(), Error::Timeout("idle")));
    pair.pump();
    assert!(events(&mut pair.server).iter().any(|event| matches!(
        event,
        EngineEvent::RemoteClose(Some(error)) if error.condition.as_str() == conditions::RESOURCE_LIMIT_EXCEEDED
    )));
}

#[test]
fn drain_crosses_in_flight_transfers() {
    let Linked {
        mut pair,
        sender,
        receiver,
        ..
    } = linked(Pair::plain());

    pair.server.drain(receiver).unwrap();
    // Transfers already on the wire use up the credit being drained.
    for i in 0..10u8 {
        pair.client
            .send(sender, Bytes::from(vec![i]), Bytes::from_static(b"m"), true)
            .unwrap();
    }
    assert!(matches!(
        pair.client.send(sender, Bytes::from_static(b"x"), Bytes::new(), true),
        Err(Error::Usage(_))
    ));
    pair.pump();
    assert!(!pair.server.is_failed());
    assert!(events(&mut pair.server).contains(&EngineEvent::Drained(receiver)));
    assert_eq!(
        pair.server.link(receiver).map(|link| link.state()),
        Some(LinkState::Attached)
    );
}
