use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};

use super::channel::Channel;
use super::connection::{ConnectionState, PeerSession};
use super::message::Command;
use super::stats::NetworkStats;
use crate::error::ConnectError;
use crate::event::{DisconnectReason, Event};

const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
pub(crate) enum Request {
    Command { command: Command, channel: Channel },
    Disconnect { done: oneshot::Sender<()> },
}

/// Snapshot of the session published after every worker iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub peer_id: u16,
    pub entity_id: Option<u32>,
    pub stats: NetworkStats,
}

impl SessionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            peer_id: 0,
            entity_id: None,
            stats: NetworkStats::default(),
        }
    }

    fn of(session: &PeerSession) -> Self {
        Self {
            state: session.state(),
            peer_id: session.peer_id(),
            entity_id: session.entity_id(),
            stats: session.stats(),
        }
    }
}

/// Owns the socket and drives one [`PeerSession`] until it closes.
pub(crate) struct NetworkEndpoint {
    socket: UdpSocket,
    session: PeerSession,
    requests: mpsc::UnboundedReceiver<Request>,
    events: broadcast::Sender<Event>,
    status: watch::Sender<SessionStatus>,
    connect_result: Option<oneshot::Sender<Result<(), ConnectError>>>,
    tick_interval: Duration,
}

impl NetworkEndpoint {
    pub(crate) fn new(
        socket: UdpSocket,
        session: PeerSession,
        requests: mpsc::UnboundedReceiver<Request>,
        events: broadcast::Sender<Event>,
        connect_result: oneshot::Sender<Result<(), ConnectError>>,
        tick_interval: Duration,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status, status_rx) = watch::channel(SessionStatus::of(&session));
        let endpoint = Self {
            socket,
            session,
            requests,
            events,
            status,
            connect_result: Some(connect_result),
            tick_interval,
        };
        (endpoint, status_rx)
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut recv_buffer = [0u8; RECV_BUFFER_SIZE];
        let mut disconnect_waiters = Vec::new();
        let mut requests_open = true;

        self.flush().await;
        self.publish();

        while !self.session.is_closed() {
            tokio::select! {
                result = self.socket.recv(&mut recv_buffer) => match result {
                    Ok(len) => self.session.handle_datagram(&recv_buffer[..len], Instant::now()),
                    // ICMP errors surface here on connected sockets; silence is handled by keep-alive.
                    Err(e) => log::debug!("receive error: {e}"),
                },
                _ = ticker.tick() => self.session.tick(Instant::now()),
                request = self.requests.recv(), if requests_open => match request {
                    Some(Request::Command { command, channel }) => {
                        if let Err(e) = self.session.send_command_on(&command, channel, Instant::now()) {
                            log::debug!("dropping {}: {e}", command.name());
                        }
                    }
                    Some(Request::Disconnect { done }) => {
                        disconnect_waiters.push(done);
                        self.session.disconnect(Instant::now());
                    }
                    None => {
                        log::debug!("client handle dropped, closing session");
                        requests_open = false;
                        self.session.disconnect(Instant::now());
                    }
                },
            }

            self.flush().await;
            self.publish();
        }

        log::debug!("network worker finished");
        for done in disconnect_waiters {
            let _ = done.send(());
        }
    }

    async fn flush(&mut self) {
        while let Some(datagram) = self.session.poll_transmit(Instant::now()) {
            if let Err(e) = self.socket.send(&datagram).await {
                log::debug!("send failed: {e}");
            }
        }
    }

    fn publish(&mut self) {
        self.status.send_replace(SessionStatus::of(&self.session));

        while let Some(event) = self.session.poll_event() {
            match &event {
                Event::StateChanged(ConnectionState::Connected) => {
                    if let Some(result) = self.connect_result.take() {
                        let _ = result.send(Ok(()));
                    }
                }
                Event::Disconnected(reason) => {
                    if let Some(result) = self.connect_result.take() {
                        let _ = result.send(Err(connect_error(reason)));
                    }
                }
                _ => {}
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

fn connect_error(reason: &DisconnectReason) -> ConnectError {
    match reason {
        DisconnectReason::Failed(err) => err.clone().into(),
        DisconnectReason::Kicked(reason) => ConnectError::Disconnected(reason.clone()),
        DisconnectReason::ServerClosed | DisconnectReason::Requested => {
            ConnectError::Disconnected(reason.to_string())
        }
    }
}
