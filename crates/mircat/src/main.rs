// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mircat CLI
//!
//! Runs one engine and drives it from stdin. Every notification is printed to
//! stdout as one JSON object per line; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Dial the configured server, then type `open`, `send 0 aGk=`, `close 0`
//! mircat client --address 127.0.0.1:8080
//!
//! # Accept peers, then `send <peer> <base64>` or `broadcast <base64>`
//! mircat server --bind 0.0.0.0:8080
//!
//! # Relay, then `up <peer> <base64>`, `down <peer> <base64>`, `bcast-up`, `bcast-down`
//! mircat relay --bind 0.0.0.0:9090 --downstream 127.0.0.1:8080
//! ```

use clap::{Parser, Subcommand};
use mircat::{AppConfig, BoundaryEvent, ConfigError, ConnectionCoordinator, Notification};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// mircat TCP toolkit
#[derive(Parser, Debug)]
#[command(name = "mircat")]
#[command(about = "Manual TCP toolkit - reconnecting client, multi-peer server and pairing relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = mircat::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open outbound connections on demand
    Client {
        /// Server address (host:port), overrides the config file
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Accept inbound peers
    Server {
        /// Listen address (host:port), overrides the config file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Pair inbound clients with a fixed destination
    Relay {
        /// Listen address (host:port), overrides the config file
        #[arg(short, long)]
        bind: Option<String>,

        /// Destination address (host:port), overrides the config file
        #[arg(short, long)]
        downstream: Option<String>,
    },

    /// Generate a default configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = mircat::config::DEFAULT_CONFIG_FILE)]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Which engine the session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
    Relay,
}

/// One line typed on stdin.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open,
    Send { target: String, data: String },
    Close(i64),
    CloseAll,
    Broadcast(String),
    Upstream { peer: String, data: String },
    Downstream { peer: String, data: String },
    BroadcastUpstream(String),
    BroadcastDownstream(String),
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty command".to_string())?;
        let mut arg = |what: &str| {
            words
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("{}: missing {}", verb, what))
        };

        match verb {
            "open" => Ok(Self::Open),
            "send" => Ok(Self::Send {
                target: arg("target")?,
                data: arg("base64 payload")?,
            }),
            "close" => {
                let index = arg("index")?;
                index
                    .parse()
                    .map(Self::Close)
                    .map_err(|_| format!("close: invalid index '{}'", index))
            }
            "close-all" => Ok(Self::CloseAll),
            "broadcast" => Ok(Self::Broadcast(arg("base64 payload")?)),
            "up" => Ok(Self::Upstream {
                peer: arg("peer")?,
                data: arg("base64 payload")?,
            }),
            "down" => Ok(Self::Downstream {
                peer: arg("peer")?,
                data: arg("base64 payload")?,
            }),
            "bcast-up" => Ok(Self::BroadcastUpstream(arg("base64 payload")?)),
            "bcast-down" => Ok(Self::BroadcastDownstream(arg("base64 payload")?)),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs on stderr, stdout carries the events.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let (mode, config) = match args.command {
        Commands::GenConfig { output } => return cmd_gen_config(output),
        Commands::Validate { config } => return cmd_validate(config),
        Commands::Client { address } => {
            let mut config = AppConfig::load_or_create(&args.config)?;
            if let Some(address) = address {
                let (host, port) = split_address(&address)?;
                config.client.server_ip = host;
                config.client.server_port = port;
            }
            (Mode::Client, config)
        }
        Commands::Server { bind } => {
            let mut config = AppConfig::load_or_create(&args.config)?;
            if let Some(bind) = bind {
                let (host, port) = split_address(&bind)?;
                config.server.tcp_addr = host;
                config.server.tcp_port = port;
            }
            (Mode::Server, config)
        }
        Commands::Relay { bind, downstream } => {
            let mut config = AppConfig::load_or_create(&args.config)?;
            if let Some(bind) = bind {
                let (host, port) = split_address(&bind)?;
                config.transfer.src_addr = host;
                config.transfer.src_port = port;
            }
            if let Some(downstream) = downstream {
                let (host, port) = split_address(&downstream)?;
                config.transfer.dst_addr = host;
                config.transfer.dst_port = port;
            }
            (Mode::Relay, config)
        }
    };
    config.validate()?;

    let notifier = Arc::new(|n: Notification| {
        println!("{}", BoundaryEvent::from(&n).to_json());
    });
    let coordinator = Arc::new(ConnectionCoordinator::new(config, notifier));

    let started = match mode {
        Mode::Client => true,
        Mode::Server => coordinator.server_start().await,
        Mode::Relay => coordinator.relay_start().await,
    };
    if !started {
        return Err("failed to start".into());
    }

    info!("mircat {} ready ({:?} mode)", env!("CARGO_PKG_VERSION"), mode);
    run_session(mode, coordinator.clone()).await?;

    info!("Shutting down...");
    coordinator.shutdown().await;
    Ok(())
}

/// Read commands until `quit`, end of input or Ctrl+C.
async fn run_session(
    mode: Mode,
    coordinator: Arc<ConnectionCoordinator>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Quit) => return Ok(()),
            Ok(command) => dispatch(mode, command, coordinator.clone()),
            Err(e) => warn!("{}", e),
        }
    }
}

/// Run one command in its own task so a send waiting on a reconnect does not
/// block the prompt.
fn dispatch(mode: Mode, command: Command, coordinator: Arc<ConnectionCoordinator>) {
    tokio::spawn(async move {
        match (mode, command) {
            (Mode::Client, Command::Open) => {
                let index = coordinator.client_open().await;
                info!("open -> {}", index);
            }
            (Mode::Client, Command::Send { target, data }) => match target.parse() {
                Ok(index) => coordinator.client_send(index, &data).await,
                Err(_) => warn!("send: invalid index '{}'", target),
            },
            (Mode::Client, Command::Close(index)) => coordinator.client_close(index).await,
            (Mode::Client, Command::CloseAll) => {
                let closed = coordinator.client_close_all().await;
                info!("closed {} connection(s)", closed);
            }
            (Mode::Server, Command::Send { target, data }) => {
                coordinator.server_send(&target, &data).await
            }
            (Mode::Server, Command::Broadcast(data)) => {
                let delivered = coordinator.server_broadcast(&data).await;
                info!("broadcast delivered to {} peer(s)", delivered);
            }
            (Mode::Relay, Command::Upstream { peer, data }) => {
                coordinator.relay_send_to_upstream(&peer, &data).await
            }
            (Mode::Relay, Command::Downstream { peer, data }) => {
                coordinator.relay_send_to_downstream(&peer, &data).await
            }
            (Mode::Relay, Command::BroadcastUpstream(data)) => {
                let delivered = coordinator.relay_broadcast_to_upstream(&data).await;
                info!("broadcast delivered to {} client(s)", delivered);
            }
            (Mode::Relay, Command::BroadcastDownstream(data)) => {
                let delivered = coordinator.relay_broadcast_to_downstream(&data).await;
                info!("broadcast delivered to {} destination(s)", delivered);
            }
            (mode, command) => warn!("{:?} is not available in {:?} mode", command, mode),
        }
    });
}

fn split_address(address: &str) -> Result<(String, String), ConfigError> {
    address
        .rsplit_once(':')
        .map(|(host, port)| (host.to_string(), port.to_string()))
        .ok_or_else(|| ConfigError::Invalid(format!("expected host:port, got '{}'", address)))
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    AppConfig::default().to_file(&output)?;
    println!("Generated configuration: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating: {}", config_path.display());

    let config = AppConfig::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid!");
    println!("  Client:   {}", config.client_address());
    println!("  Server:   {}", config.server_address());
    println!(
        "  Relay:    {} -> {}",
        config.transfer_src_address(),
        config.transfer_dst_address()
    );
    println!("  Reconnect interval: {} ms", config.reconnect_interval_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("open"), Ok(Command::Open));
        assert_eq!(
            Command::parse("send 0 aGk="),
            Ok(Command::Send {
                target: "0".into(),
                data: "aGk=".into()
            })
        );
        assert_eq!(Command::parse("close 2"), Ok(Command::Close(2)));
        assert_eq!(
            Command::parse("  down 127.0.0.1:5000   AA==  "),
            Ok(Command::Downstream {
                peer: "127.0.0.1:5000".into(),
                data: "AA==".into()
            })
        );
        assert_eq!(
            Command::parse("bcast-up aGk="),
            Ok(Command::BroadcastUpstream("aGk=".into()))
        );
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("close x").is_err());
        assert!(Command::parse("send 0").is_err());
        assert!(Command::parse("dance").is_err());
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("127.0.0.1:8080").unwrap(),
            ("127.0.0.1".to_string(), "8080".to_string())
        );
        assert!(split_address("localhost").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::parse_from(["mircat", "relay", "--bind", "0.0.0.0:1", "-d", "h:2"]);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(matches!(args.command, Commands::Relay { .. }));
    }
}
