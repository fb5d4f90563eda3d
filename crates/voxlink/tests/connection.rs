mod support;

use std::time::{Duration, Instant};

use glam::{IVec3, Vec3};
use voxlink::net::{Channel, ClientMessage, Command, RejectCode, ServerMessage};
use voxlink::{
    Client, ClientConfig, ConnectError, ConnectionState, DisconnectReason, Event, EventStream,
    SendError, SessionError,
};

use support::{FakeServer, Incoming, WAIT};

async fn next_event(events: &mut EventStream) -> Event {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn wait_for(events: &mut EventStream, matches: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_connect_and_first_move() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice").with_password("hunter2")).unwrap();

    let (result, _) = tokio::join!(client.connect(), server.accept(7, 42, "hunter2"));
    result.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.peer_id(), 7);
    assert_eq!(client.entity_id(), Some(42));

    client
        .send_command(Command::move_to(Vec3::new(1.0, 2.0, 3.0)))
        .unwrap();

    let (peer_id, channel, sequence, message) = server.expect_message().await;
    assert_eq!(peer_id, 7);
    assert_eq!(channel, Channel::ReliableOrdered);
    assert_eq!(sequence, 1);
    assert_eq!(
        message,
        ClientMessage::Command(Command::move_to(Vec3::new(1.0, 2.0, 3.0)))
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_state_events_during_handshake() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();
    let mut events = client.subscribe();

    let (result, _) = tokio::join!(client.connect(), server.accept(3, 1, ""));
    result.unwrap();

    let mut states = Vec::new();
    while let Some(event) = events.try_recv() {
        if let Event::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::AwaitingPeerId,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
        ]
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_auth_rejected() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("mallory").with_password("guess")).unwrap();
    let mut events = client.subscribe();

    let (result, _) = tokio::join!(
        client.connect(),
        server.reject(9, RejectCode::WrongPassword, "wrong password")
    );

    match result {
        Err(ConnectError::AuthenticationFailed { code, reason }) => {
            assert_eq!(code, RejectCode::WrongPassword);
            assert_eq!(reason, "wrong password");
        }
        other => panic!("expected authentication failure, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let event = wait_for(&mut events, Event::is_terminal).await;
    assert!(matches!(
        event,
        Event::Disconnected(DisconnectReason::Failed(
            SessionError::AuthenticationFailed { .. }
        ))
    ));

    // Nothing may follow the rejection, not even acks.
    assert_eq!(server.recv_packet(Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn test_connect_timeout() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();

    let started = Instant::now();
    let deadline = started + Duration::from_millis(300);
    let result = client.connect_with_deadline(deadline).await;

    assert!(matches!(result, Err(ConnectError::ConnectTimeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let mut saw_hello = false;
    while let Some(incoming) = server.next_incoming(Duration::from_millis(200)).await {
        match incoming {
            Incoming::Message {
                message: ClientMessage::Hello { .. },
                ..
            } => saw_hello = true,
            Incoming::Disconnect { .. } => break,
            _ => {}
        }
    }
    assert!(saw_hello);
}

#[tokio::test]
async fn test_unresolvable_host() {
    let config = ClientConfig::new("alice").with_server("no such host.invalid", 30000);
    let mut client = Client::new(config).unwrap();

    let result = tokio::time::timeout(WAIT * 4, client.connect())
        .await
        .expect("resolution hung");
    assert!(matches!(result, Err(ConnectError::Resolve(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_send_before_connect() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config("alice")).unwrap();

    assert_eq!(
        client.send_command(Command::chat("hello")),
        Err(SendError::NotConnected)
    );
    assert_eq!(
        client.send_command_on(Command::chat("hello"), Channel::Control),
        Err(SendError::ReservedChannel)
    );
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();
    let mut events = client.subscribe();

    // Never connected.
    client.disconnect().await;

    let (result, _) = tokio::join!(client.connect(), server.accept(5, 2, ""));
    result.unwrap();

    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        server.next_incoming(WAIT).await,
        Some(Incoming::Disconnect { peer_id: 5 })
    ));

    let event = wait_for(&mut events, Event::is_terminal).await;
    assert_eq!(event, Event::Disconnected(DisconnectReason::Requested));
    assert_eq!(events.try_recv(), None);
    assert_eq!(
        client.send_command(Command::chat("late")),
        Err(SendError::NotConnected)
    );
}

#[tokio::test]
async fn test_server_events_reach_subscribers() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();
    let mut first = client.subscribe();
    let mut second = client.subscribe();

    let (result, _) = tokio::join!(client.connect(), server.accept(4, 8, ""));
    result.unwrap();

    server
        .send(ServerMessage::Chat {
            sender: "bob".into(),
            text: "hi alice".into(),
        })
        .await;
    server
        .send(ServerMessage::BlockUpdate {
            pos: IVec3::new(1, -2, 3),
            node: "default:dirt".into(),
        })
        .await;

    for events in [&mut first, &mut second] {
        let chat = wait_for(events, |e| matches!(e, Event::Chat { .. })).await;
        assert_eq!(
            chat,
            Event::Chat {
                sender: "bob".into(),
                text: "hi alice".into()
            }
        );
        let block = next_event(events).await;
        assert_eq!(
            block,
            Event::BlockUpdate {
                pos: IVec3::new(1, -2, 3),
                node: "default:dirt".into()
            }
        );
    }

    client.disconnect().await;
}

#[tokio::test]
async fn test_server_disconnect_notice() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();
    let mut events = client.subscribe();

    let (result, _) = tokio::join!(client.connect(), server.accept(6, 1, ""));
    result.unwrap();

    server.send_disconnect().await;

    let event = wait_for(&mut events, Event::is_terminal).await;
    assert_eq!(event, Event::Disconnected(DisconnectReason::ServerClosed));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_malformed_datagrams_ignored() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();

    let (result, _) = tokio::join!(client.connect(), server.accept(2, 1, ""));
    result.unwrap();

    server.send_raw(&[0xFF; 3]).await;
    server.send_raw(b"VOXL but not really").await;
    client.send_command(Command::chat("still here")).unwrap();

    let (_, _, _, message) = server.expect_message().await;
    assert_eq!(message, ClientMessage::Command(Command::chat("still here")));
    assert_eq!(client.state(), ConnectionState::Connected);

    // The worker may handle the command before the junk datagrams.
    let deadline = Instant::now() + WAIT;
    while client.stats().packets_dropped_malformed < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.stats().packets_dropped_malformed, 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_second_connect_rejected() {
    let mut server = FakeServer::bind().await;
    let mut client = Client::new(server.config("alice")).unwrap();

    let (result, _) = tokio::join!(client.connect(), server.accept(2, 1, ""));
    result.unwrap();

    assert!(matches!(
        client.connect().await,
        Err(ConnectError::AlreadyConnected)
    ));

    client.disconnect().await;
}
