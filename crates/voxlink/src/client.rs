use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{ConfigError, ConnectError, SendError};
use crate::event::{Event, EventStream};
use crate::net::endpoint::{NetworkEndpoint, Request, SessionStatus};
use crate::net::{Channel, Command, ConnectionState, NetworkStats, PeerSession};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct Worker {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<SessionStatus>,
    handle: JoinHandle<()>,
}

/// Async handle to a session with a voxel game server.
///
/// A background task owns the socket. Commands are queued to it and events
/// are fanned out to every [`EventStream`] from [`Client::subscribe`].
pub struct Client {
    config: ClientConfig,
    events: broadcast::Sender<Event>,
    worker: Option<Worker>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_queue_capacity);
        Ok(Self {
            config,
            events,
            worker: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        self.connect_with_deadline(deadline).await
    }

    /// Runs the handshake. On failure the session is already closed.
    pub async fn connect_with_deadline(&mut self, deadline: Instant) -> Result<(), ConnectError> {
        if self.worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(ConnectError::AlreadyConnected);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.await;
        }

        let addr = self.resolve().await?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        log::info!(
            "connecting to {addr} from {}",
            socket.local_addr().map_or_else(|_| "?".to_string(), |a| a.to_string())
        );

        let now = Instant::now();
        let mut session = PeerSession::new(&self.config, now);
        session.connect(now, deadline);

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (endpoint, status) = NetworkEndpoint::new(
            socket,
            session,
            requests_rx,
            self.events.clone(),
            result_tx,
            self.config.tick_interval,
        );
        let handle = tokio::spawn(endpoint.run());
        self.worker = Some(Worker {
            requests,
            status,
            handle,
        });

        match result_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                log::warn!("connect failed: {err}");
                self.reap().await;
                Err(err)
            }
            Err(_) => {
                self.reap().await;
                Err(ConnectError::WorkerStopped)
            }
        }
    }

    async fn resolve(&self) -> Result<SocketAddr, ConnectError> {
        let target = self.config.server_addr();
        lookup_host(target.as_str())
            .await
            .map_err(|e| ConnectError::Resolve(format!("{target}: {e}")))?
            .next()
            .ok_or_else(|| ConnectError::Resolve(target.clone()))
    }

    pub fn send_command(&self, command: Command) -> Result<(), SendError> {
        let channel = command.channel();
        self.send_command_on(command, channel)
    }

    pub fn send_command_on(&self, command: Command, channel: Channel) -> Result<(), SendError> {
        if channel == Channel::Control {
            return Err(SendError::ReservedChannel);
        }
        let worker = self.worker.as_ref().ok_or(SendError::NotConnected)?;
        if worker.status.borrow().state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        worker
            .requests
            .send(Request::Command { command, channel })
            .map_err(|_| SendError::NotConnected)
    }

    /// Closes the session gracefully. Safe to call at any time, any number of times.
    pub async fn disconnect(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let (done, done_rx) = oneshot::channel();
        if worker.requests.send(Request::Disconnect { done }).is_ok()
            && tokio::time::timeout(DISCONNECT_GRACE, done_rx).await.is_err()
        {
            log::warn!("network worker did not stop in time, aborting");
            worker.handle.abort();
        }
        let _ = worker.handle.await;
    }

    async fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.handle.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn peer_id(&self) -> u16 {
        self.status().peer_id
    }

    pub fn entity_id(&self) -> Option<u32> {
        self.status().entity_id
    }

    pub fn stats(&self) -> NetworkStats {
        self.status().stats
    }

    fn status(&self) -> SessionStatus {
        self.worker
            .as_ref()
            .map_or_else(SessionStatus::disconnected, |w| w.status.borrow().clone())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Dropping the request sender tells the worker to send its disconnect notice.
        if let Some(worker) = self.worker.take() {
            drop(worker.requests);
        }
    }
}
