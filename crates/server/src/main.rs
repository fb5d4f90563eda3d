mod admin;
mod config;
mod events;
mod peers;
mod server;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;

use admin::{AdminCommand, parse_admin};

use config::ServerConfig;
use events::ServerEvent;
use server::GameServer;
use voxlink::net::{DEFAULT_PORT, LinkConditions, MAX_PACKET_SIZE};

#[derive(Parser)]
#[command(name = "voxlink-server")]
#[command(about = "Reference server for the voxlink session protocol")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "", help = "Shared password, empty accepts anyone")]
    password: String,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 30, help = "Seconds of silence before a peer is dropped")]
    peer_timeout: u64,

    #[arg(long, default_value_t = 0.0, help = "Simulated packet loss percentage (0-100)")]
    loss: f32,

    #[arg(long, default_value_t = 0, help = "Simulated one-way latency in ms")]
    latency: u64,

    #[arg(long, default_value_t = 0, help = "Simulated jitter in ms")]
    jitter: u64,

    #[arg(long, default_value_t = 0, help = "Seed for nonces and link simulation")]
    seed: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let link = LinkConditions {
            loss_percent: self.loss.clamp(0.0, 100.0),
            duplicate_percent: 0.0,
            min_latency: Duration::from_millis(self.latency),
            max_latency: Duration::from_millis(self.latency),
            jitter: Duration::from_millis(self.jitter),
        };
        let seed = if self.seed == 0 {
            rand::random()
        } else {
            self.seed
        };

        ServerConfig {
            max_clients: self.max_clients,
            password: self.password.clone(),
            peer_timeout: Duration::from_secs(self.peer_timeout.max(1)),
            link: (!link.is_perfect()).then_some(link),
            seed,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let socket = UdpSocket::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    log::info!("Server started on {}", socket.local_addr()?);
    if let Some(link) = &config.link {
        log::info!(
            "Simulating {:.1}% loss, {:?} latency, {:?} jitter",
            link.loss_percent,
            link.max_latency,
            link.jitter
        );
    }

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut server = GameServer::new(config);
    let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => server.handle_datagram(from, &buf[..len], Instant::now()),
                // ICMP unreachable from a departed client surfaces here on some platforms.
                Err(err) => log::debug!("recv failed: {err}"),
            },
            _ = ticker.tick() => server.tick(Instant::now()),
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => run_admin(&mut server, &line),
                // Detached from a terminal.
                Ok(None) => console_open = false,
                Err(err) => {
                    log::warn!("console read failed: {err}");
                    console_open = false;
                }
            },
            _ = &mut shutdown => break,
        }

        flush(&socket, &mut server).await;
        log_events(&mut server);
    }

    log::info!("Server shutting down, dropping {} peers", server.peer_count());
    server.shutdown(Instant::now());
    flush(&socket, &mut server).await;
    log_events(&mut server);

    let stats = server.stats();
    log::info!(
        "Sent {} packets ({} bytes), received {} ({} bytes), {:.1}% retransmitted",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.retransmit_percent()
    );
    Ok(())
}

fn run_admin(server: &mut GameServer, line: &str) {
    match parse_admin(line) {
        Ok(Some(AdminCommand::Kick { peer_id, reason })) => {
            if !server.kick(peer_id, &reason, Instant::now()) {
                log::warn!("No peer {peer_id}");
            }
        }
        Ok(Some(AdminCommand::Status)) => log::info!(
            "{} connected, {} peers tracked",
            server.connected_count(),
            server.peer_count()
        ),
        Ok(None) => {}
        Err(err) => log::warn!("{err:#}"),
    }
}

async fn flush(socket: &UdpSocket, server: &mut GameServer) {
    while let Some((to, data)) = server.poll_transmit(Instant::now()) {
        if let Err(err) = socket.send_to(&data, to).await {
            log::debug!("send to {to} failed: {err}");
        }
    }
}

fn log_events(server: &mut GameServer) {
    let events: Vec<ServerEvent> = server.drain_events().collect();
    for event in events {
        match event {
            ServerEvent::ClientConnecting { addr } => {
                log::debug!("Connection request from {addr}");
            }
            ServerEvent::ClientConnected {
                peer_id,
                addr,
                username,
                entity_id,
            } => {
                log::info!(
                    "{username} connected from {addr} (peer {peer_id}, entity {entity_id}), {} online",
                    server.connected_count()
                );
            }
            ServerEvent::ClientDisconnected { peer_id, reason } => {
                log::info!("Peer {peer_id} {}", reason.as_str());
            }
            ServerEvent::ConnectionDenied { addr, reason } => {
                log::warn!("Connection denied to {addr}: {reason}");
            }
            ServerEvent::Chat { username, text } => {
                log::info!("<{username}> {text}");
            }
        }
    }
}
