mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use voxlink::{Client, ClientConfig, Event, EventStream};

use commands::{HELP, Input, parse_line};

#[derive(Parser)]
#[command(name = "voxlink-bot")]
#[command(about = "Line-driven client for a voxlink game server")]
struct Args {
    #[arg(short, long, help = "JSON config file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'o',
        long = "option",
        value_name = "KEY=VALUE",
        help = "Override a config field, e.g. -o keepAliveInterval=1000"
    )]
    options: Vec<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ClientConfig::default(),
        };

        for option in &self.options {
            let Some((key, value)) = option.split_once('=') else {
                bail!("option `{option}` is not of the form KEY=VALUE");
            };
            config.set_option(key.trim(), value)?;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = args.client_config()?;
    let server = config.server_addr();

    let mut client = Client::new(config)?;
    let events = client.subscribe();
    client
        .connect()
        .await
        .with_context(|| format!("could not join {server}"))?;
    println!(
        "Joined {server} as peer {} (entity {}). Type /help for commands.",
        client.peer_id(),
        client.entity_id().unwrap_or_default()
    );

    let mut printer = tokio::spawn(print_events(events));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => handle_input(&client, input),
                    Ok(None) => {}
                    Err(err) => eprintln!("{err:#}"),
                }
            }
            _ = &mut printer => {
                // The session ended on its own.
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await;
    let _ = printer.await;
    Ok(())
}

fn handle_input(client: &Client, input: Input) {
    let sent = match input {
        Input::Send(command) => client.send_command(command),
        Input::SendOn(command, channel) => client.send_command_on(command, channel),
        Input::Stats => {
            let stats = client.stats();
            println!(
                "rtt {:.0} ms, rto {:.0} ms, sent {} / received {} packets, {:.1}% retransmitted, {} malformed",
                stats.rtt_ms,
                stats.rto_ms,
                stats.packets_sent,
                stats.packets_received,
                stats.retransmit_percent(),
                stats.packets_dropped_malformed
            );
            Ok(())
        }
        Input::Help => {
            println!("{HELP}");
            Ok(())
        }
        Input::Quit => Ok(()),
    };
    if let Err(err) = sent {
        eprintln!("not sent: {err}");
    }
}

async fn print_events(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match &event {
            Event::StateChanged(state) => log::info!("state: {state}"),
            Event::Chat { sender, text } => println!("<{sender}> {text}"),
            Event::BlockUpdate { pos, node } => {
                println!("block {} {} {} is now {node}", pos.x, pos.y, pos.z);
            }
            Event::EntityState {
                entity_id,
                position,
                ..
            } => log::debug!("entity {entity_id} at {position}"),
            Event::EntityRemoved { entity_id } => println!("entity {entity_id} left"),
            Event::Disconnected(reason) => println!("disconnected: {reason}"),
            Event::Lagged { dropped } => log::warn!("missed {dropped} events"),
        }
        if event.is_terminal() {
            break;
        }
    }
}
